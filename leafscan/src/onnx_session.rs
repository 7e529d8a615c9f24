use crate::classifier::Backbone;
use crate::color_utils::symbols;
use crate::model_access::{calculate_md5_bytes, read_model_file};
use anyhow::{anyhow, Result};
use log::Level;
use ndarray::{Array2, Array4, Ix2};
use ort::{
    execution_providers::{CPUExecutionProvider, CoreMLExecutionProvider, ExecutionProvider},
    logging::LogLevel,
    session::Session,
    value::Value,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;

fn log_level_from_ort(level: LogLevel) -> Level {
    match level {
        LogLevel::Verbose => Level::Trace,
        LogLevel::Info => Level::Trace,
        LogLevel::Warning => Level::Debug,
        LogLevel::Error => Level::Info,
        LogLevel::Fatal => Level::Error,
    }
}

fn ort_level_from_log(level: Level) -> LogLevel {
    match level {
        // ONNX info output is closer to our trace
        Level::Trace => LogLevel::Verbose,
        Level::Debug => LogLevel::Warning,
        Level::Info => LogLevel::Error,
        Level::Warn => LogLevel::Error,
        Level::Error => LogLevel::Fatal,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub model_path: String,
    pub model_size_bytes: usize,
    pub execution_providers: Vec<String>,
    pub model_checksum: String,
}

/// Device selection result
#[derive(Debug, Clone)]
pub struct DeviceSelection {
    pub device: String,
    pub reason: String,
}

/// Determine optimal device based on user preference
pub fn determine_optimal_device(requested_device: &str) -> DeviceSelection {
    match requested_device {
        "auto" => match CoreMLExecutionProvider::default().is_available() {
            Ok(true) => DeviceSelection {
                device: "coreml".to_string(),
                reason: "Auto-selected CoreML (available)".to_string(),
            },
            _ => DeviceSelection {
                device: "cpu".to_string(),
                reason: "Auto-selected CPU (CoreML not available)".to_string(),
            },
        },
        other => DeviceSelection {
            device: other.to_string(),
            reason: format!("User explicitly chose {other}"),
        },
    }
}

fn execution_providers(device: &str) -> Vec<ort::execution_providers::ExecutionProviderDispatch> {
    match device {
        "coreml" => match CoreMLExecutionProvider::default().is_available() {
            Ok(true) => vec![
                CoreMLExecutionProvider::default().build(),
                CPUExecutionProvider::default().build(),
            ],
            _ => {
                log::warn!(
                    "{}CoreML not available, falling back to CPU",
                    symbols::warning()
                );
                vec![CPUExecutionProvider::default().build()]
            }
        },
        "cpu" => vec![CPUExecutionProvider::default().build()],
        other => {
            log::warn!("{}Unknown device '{other}', using CPU", symbols::warning());
            vec![CPUExecutionProvider::default().build()]
        }
    }
}

/// Build a session from model bytes with ONNX logging routed through `log`.
pub fn create_onnx_session(bytes: &[u8], device: &str) -> Result<(Session, Vec<String>)> {
    let providers = execution_providers(device);
    let ep_names: Vec<String> = providers.iter().map(|ep| format!("{ep:?}")).collect();

    let ort_log_level = [
        Level::Trace,
        Level::Debug,
        Level::Info,
        Level::Warn,
        Level::Error,
    ]
    .into_iter()
    .find(|&lvl| log::log_enabled!(lvl))
    .map(ort_level_from_log)
    .unwrap_or(LogLevel::Fatal);

    let session = Session::builder()
        .map_err(|e| anyhow!("Failed to create session builder: {}", e))?
        .with_logger(Box::new(|level, _, _, _, msg| {
            log::log!(log_level_from_ort(level), "[onnx] {msg}")
        }))
        .map_err(|e| anyhow!("Failed to set logger: {}", e))?
        .with_log_level(ort_log_level)
        .map_err(|e| anyhow!("Failed to set log level: {}", e))?
        .with_execution_providers(providers)
        .map_err(|e| anyhow!("Failed to set execution providers: {}", e))?
        .commit_from_memory(bytes)
        .map_err(|e| anyhow!("Failed to load model from memory: {}", e))?;

    log::debug!(
        "{}Execution providers registered: {}",
        symbols::system_setup(),
        ep_names.join(" -> ")
    );
    Ok((session, ep_names))
}

/// A classification network served by ONNX Runtime.
///
/// `Session::run` needs exclusive access, so concurrent requests serialize on
/// the session lock while everything around inference runs in parallel.
pub struct OnnxBackbone {
    name: String,
    session: Mutex<Session>,
    info: ModelInfo,
}

impl OnnxBackbone {
    pub fn load(name: &str, path: &Path, device: &str) -> Result<Self> {
        let bytes = read_model_file(path)?;
        let (session, execution_providers) = create_onnx_session(&bytes, device)?;
        let info = ModelInfo {
            model_path: path.display().to_string(),
            model_size_bytes: bytes.len(),
            execution_providers,
            model_checksum: calculate_md5_bytes(&bytes),
        };
        log::info!(
            "{}Loaded {name} model from {}",
            symbols::model_loaded(),
            path.display()
        );
        Ok(Self {
            name: name.to_string(),
            session: Mutex::new(session),
            info,
        })
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }
}

impl Backbone for OnnxBackbone {
    fn name(&self) -> &str {
        &self.name
    }

    fn logits(&self, batch: &Array4<f32>) -> Result<Array2<f32>> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("{} session lock poisoned", self.name))?;

        let input_name = session.inputs[0].name.clone();
        let output_name = session.outputs[0].name.clone();
        let input_value = Value::from_array(batch.clone())
            .map_err(|e| anyhow!("Failed to create input value: {}", e))?;

        let outputs = session
            .run(ort::inputs![input_name.as_str() => &input_value])
            .map_err(|e| anyhow!("Failed to run inference: {}", e))?;

        let output_view = outputs[output_name.as_str()]
            .try_extract_array::<f32>()
            .map_err(|e| anyhow!("Failed to extract output array: {}", e))?;

        output_view
            .to_owned()
            .into_dimensionality::<Ix2>()
            .map_err(|e| anyhow!("{} output is not [batch, classes]: {}", self.name, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_round_trip_is_quieter_for_onnx() {
        assert_eq!(ort_level_from_log(Level::Info), LogLevel::Error);
        assert_eq!(log_level_from_ort(LogLevel::Info), Level::Trace);
        assert_eq!(log_level_from_ort(LogLevel::Fatal), Level::Error);
    }

    #[test]
    fn test_explicit_device_is_kept() {
        let selection = determine_optimal_device("cpu");
        assert_eq!(selection.device, "cpu");
        assert!(selection.reason.contains("explicitly"));
    }

    #[test]
    fn test_missing_model_fails_to_load() {
        assert!(OnnxBackbone::load("light", Path::new("/nonexistent/model.onnx"), "cpu").is_err());
    }
}
