//! Per-image metadata sidecar files (`<stem>.leafscan.toml`).
//!
//! Each command owns one section; writing one section keeps whatever other
//! sections the file already holds.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::color_utils::symbols;

/// Environment variables worth recording alongside a result.
const RECORDED_ENV_PREFIXES: [&str; 2] = ["LEAFSCAN_", "ENSEMBLE_"];
const RECORDED_ENV_KEYS: [&str; 10] = [
    "MODEL_DIR",
    "WEIGHTS_DIR",
    "CLASS_TO_IDX_JSON",
    "TEMP_CLASSWISE_JSON",
    "TEMP_SCALAR_JSON",
    "LEAF_GATE_MIN",
    "LEAF_DELTA_MAX",
    "PICK_OVERRIDE",
    "RICE_BLEND_ALPHA",
    "T_FLOOR",
];

#[derive(Serialize, Deserialize, Default, Debug)]
pub struct LeafscanMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classify: Option<ToolSections>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ToolSections>,
}

/// One command's results plus the context they were produced in.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ToolSections {
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub core: Option<toml::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<toml::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<InputProcessing>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ExecutionContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leafscan_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_line: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_vars: Option<BTreeMap<String, String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SystemInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_requested: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_selected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_selection_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_load_time_ms: Option<f64>,
    pub specialist_loaded: bool,
    pub demo_mode: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct InputProcessing {
    pub image_path: String,
    pub strict_mode: bool,
}

pub fn load_or_create_metadata(path: &Path) -> Result<LeafscanMetadata> {
    if !path.exists() {
        return Ok(LeafscanMetadata::default());
    }
    let content = fs::read_to_string(path)?;
    match toml::from_str::<LeafscanMetadata>(&content) {
        Ok(metadata) => Ok(metadata),
        Err(e) => {
            warn!(
                "{}Dropping existing metadata from {}: {e}",
                symbols::warning(),
                path.display()
            );
            Ok(LeafscanMetadata::default())
        }
    }
}

pub fn save_metadata(metadata: &LeafscanMetadata, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(metadata).map_err(|e| {
        log::debug!("Unserializable metadata: {metadata:#?}");
        anyhow!("Failed to serialize metadata to TOML: {e}")
    })?;
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Metadata path next to the input, or inside `output_dir`.
pub fn get_metadata_path(input_path: &Path, output_dir: Option<&str>) -> Result<PathBuf> {
    let stem = input_path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("Invalid input filename: {}", input_path.display()))?;
    let filename = format!("{stem}.leafscan.toml");
    Ok(match output_dir {
        Some(dir) => Path::new(dir).join(filename),
        None => input_path
            .parent()
            .unwrap_or(Path::new("."))
            .join(filename),
    })
}

/// Load the file at `path`, replace the `tool` section and write it back.
pub fn update_tool_section(path: &Path, tool: &str, sections: ToolSections) -> Result<()> {
    let mut metadata = load_or_create_metadata(path)?;
    match tool {
        "classify" => metadata.classify = Some(sections),
        "metrics" => metadata.metrics = Some(sections),
        other => return Err(anyhow!("Unknown tool name: {other}")),
    }
    save_metadata(&metadata, path)?;
    log::debug!("📋 Saved metadata to: {}", path.display());
    Ok(())
}

/// Present, non-empty configuration variables.
pub fn collect_env_vars() -> Option<BTreeMap<String, String>> {
    collect_env_vars_from(std::env::vars())
}

fn collect_env_vars_from<I>(vars: I) -> Option<BTreeMap<String, String>>
where
    I: IntoIterator<Item = (String, String)>,
{
    let recorded: BTreeMap<String, String> = vars
        .into_iter()
        .filter(|(key, value)| {
            !value.is_empty()
                && (RECORDED_ENV_KEYS.contains(&key.as_str())
                    || RECORDED_ENV_PREFIXES.iter().any(|p| key.starts_with(p)))
        })
        .collect();
    (!recorded.is_empty()).then_some(recorded)
}
