//! Model, vocabulary and calibration file locations.
//!
//! Paths come from the environment (`MODEL_DIR`, `WEIGHTS_DIR` and per-file
//! variables) and may be overridden from the command line. Model files are
//! validated before a session is built from them.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::color_utils::symbols;

pub const LIGHT_MODEL_ENV: &str = "LEAFSCAN_LIGHT_MODEL";
pub const HEAVY_MODEL_ENV: &str = "LEAFSCAN_HEAVY_MODEL";
pub const SPECIALIST_MODEL_ENV: &str = "LEAFSCAN_SPECIALIST_MODEL";

/// Where every artifact of an [`crate::pipeline::InferenceContext`] lives.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelPaths {
    pub light_model: PathBuf,
    pub heavy_model: PathBuf,
    /// Loaded only when the file exists
    pub specialist_model: PathBuf,
    pub class_to_idx: PathBuf,
    pub temperature_classwise: PathBuf,
    pub temperature_scalar: PathBuf,
}

/// Command-line replacements for individual paths.
#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub light_model: Option<String>,
    pub heavy_model: Option<String>,
    pub specialist_model: Option<String>,
    pub class_to_idx: Option<String>,
    pub temperature_classwise: Option<String>,
}

impl ModelPaths {
    /// Resolve from the process environment.
    pub fn from_env() -> Self {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Resolve with an explicit variable lookup.
    pub fn from_env_with<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let path_or = |key: &str, default: PathBuf| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(default)
        };
        let model_dir = path_or("MODEL_DIR", PathBuf::from("."));
        let weights_dir = path_or("WEIGHTS_DIR", model_dir.join("weights"));
        let calibration_dir = model_dir.join("calibration");

        Self {
            light_model: path_or(LIGHT_MODEL_ENV, weights_dir.join("MN").join("best.onnx")),
            heavy_model: path_or(HEAVY_MODEL_ENV, weights_dir.join("RN").join("best.onnx")),
            specialist_model: path_or(
                SPECIALIST_MODEL_ENV,
                weights_dir.join("RN").join("rn_rice_ft_best.onnx"),
            ),
            class_to_idx: path_or("CLASS_TO_IDX_JSON", weights_dir.join("class_to_idx.json")),
            temperature_classwise: path_or(
                "TEMP_CLASSWISE_JSON",
                calibration_dir.join("temperature_classwise_v1.fixed.json"),
            ),
            temperature_scalar: path_or(
                "TEMP_SCALAR_JSON",
                calibration_dir.join("temperature_scalar.json"),
            ),
        }
    }

    /// Apply command-line paths on top of the resolved ones.
    pub fn with_overrides(mut self, overrides: &PathOverrides) -> Self {
        let apply = |slot: &mut PathBuf, value: &Option<String>| {
            if let Some(v) = value {
                log::debug!("🔄 Using path from command line: {v}");
                *slot = PathBuf::from(v);
            }
        };
        apply(&mut self.light_model, &overrides.light_model);
        apply(&mut self.heavy_model, &overrides.heavy_model);
        apply(&mut self.specialist_model, &overrides.specialist_model);
        apply(&mut self.class_to_idx, &overrides.class_to_idx);
        apply(
            &mut self.temperature_classwise,
            &overrides.temperature_classwise,
        );
        self
    }
}

/// MD5 hex digest of `bytes`.
pub fn calculate_md5_bytes(bytes: &[u8]) -> String {
    let mut hasher = md5::Context::new();
    hasher.consume(bytes);
    format!("{:x}", hasher.finalize())
}

/// Read a model file, rejecting missing or empty files.
pub fn read_model_file(path: &Path) -> Result<Vec<u8>> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("Model file not found: {}", path.display()))?;
    if metadata.len() == 0 {
        return Err(anyhow!(
            "Model file is empty (0 bytes): {}\n\
             Empty model files are not valid ONNX models.",
            path.display()
        ));
    }

    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let size_mb = bytes.len() as f64 / (1024.0 * 1024.0);
    log::debug!(
        "{}Model {} ({size_mb:.2} MB, md5 {})",
        symbols::checking(),
        path.display(),
        calculate_md5_bytes(&bytes)
    );
    Ok(bytes)
}
