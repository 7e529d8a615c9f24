//! Batch driver shared by the CLI commands.
//!
//! Collects inputs, runs one job per image, prints each result on stdout and
//! optionally writes the metadata sidecar. In strict mode the first failure
//! aborts the run; otherwise failures are logged and counted.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use image::RgbImage;
use log::{debug, info, warn};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::color_utils::{colors, progress::create_batch_progress_bar, symbols};
use crate::config::{ClassifyConfig, MetricsConfig, RunConfig};
use crate::demo::demo_verdict;
use crate::error::ClassifyError;
use crate::image_input::{collect_images_from_sources, load_rgb, ImageInputConfig};
use crate::leaf_metrics::{self, ImageMetrics};
use crate::model_access::ModelPaths;
use crate::onnx_session::determine_optimal_device;
use crate::pipeline::{classify_with_deadline, classify_with_details_deadline, InferenceContext};
use crate::progress::remove_progress_bar;
use crate::rule_params::RuleParams;
use crate::shared_metadata::{
    collect_env_vars, get_metadata_path, update_tool_section, ExecutionContext, InputProcessing,
    SystemInfo, ToolSections,
};
use crate::verdict::{ClassificationDetails, FinalVerdict};

/// Output of one image, printable and recordable.
pub trait ImageResult: Serialize {
    /// Line printed on stdout for this image
    fn render(&self) -> Result<String>;

    fn processing_time_ms(&self) -> f64;
}

#[derive(Serialize, Debug)]
pub struct ClassifyOutcome {
    pub image_path: String,
    pub verdict: FinalVerdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ClassificationDetails>,
    pub processing_time_ms: f64,
    #[serde(skip)]
    json: bool,
}

impl ImageResult for ClassifyOutcome {
    fn render(&self) -> Result<String> {
        if self.json {
            return Ok(match &self.details {
                Some(details) => serde_json::to_string(details)?,
                None => serde_json::to_string(&self.verdict)?,
            });
        }
        let status = match &self.verdict {
            FinalVerdict::Accepted { .. } => colors::accepted(self.verdict.label()),
            FinalVerdict::Rejected { .. } => colors::rejected(self.verdict.label()),
        };
        let mut line = format!(
            "{}: {} ({:.3}, {})",
            self.image_path,
            status,
            self.verdict.confidence(),
            self.verdict.reason_code()
        );
        if let Some(details) = &self.details {
            line.push_str(&format!(
                "\n  light {} {:.3} | heavy {} {:.3} | H {:.3}/{:.3} | {}",
                details.light.label,
                details.light.confidence,
                details.heavy.label,
                details.heavy.confidence,
                details.entropy.light,
                details.entropy.heavy,
                details.reason
            ));
        }
        Ok(line)
    }

    fn processing_time_ms(&self) -> f64 {
        self.processing_time_ms
    }
}

#[derive(Serialize, Debug)]
pub struct MetricsOutcome {
    pub image_path: String,
    pub metrics: ImageMetrics,
    pub processing_time_ms: f64,
}

impl ImageResult for MetricsOutcome {
    fn render(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn processing_time_ms(&self) -> f64 {
        self.processing_time_ms
    }
}

/// Run-wide facts recorded in every metadata file.
struct RunContext {
    started: DateTime<Utc>,
    command_line: Vec<String>,
    system: SystemInfo,
}

/// Run `process` over every input named by `config`. Returns the number of
/// images that succeeded.
pub fn run_batch<C, R, F>(config: &C, system: SystemInfo, mut process: F) -> Result<usize>
where
    C: RunConfig + Serialize,
    R: ImageResult,
    F: FnMut(&Path) -> Result<R>,
{
    let batch_start = Instant::now();
    let run = RunContext {
        started: Utc::now(),
        command_line: std::env::args().collect(),
        system,
    };
    let base = config.base();

    let image_config = ImageInputConfig::from_strict_flag(base.strict);
    let image_files = collect_images_from_sources(&base.sources, &image_config)?;
    if image_files.is_empty() {
        warn!("{}No valid images found to process", symbols::warning());
        return Ok(0);
    }
    info!(
        "{}Found {} image(s) to process",
        symbols::resources_found(),
        image_files.len()
    );

    let pb = create_batch_progress_bar(image_files.len());
    let mut successful = 0;
    let mut failed = 0;

    for (index, image_path) in image_files.iter().enumerate() {
        let outcome = process(image_path).and_then(|result| {
            let line = result.render()?;
            match &pb {
                Some(pb) => pb.suspend(|| println!("{line}")),
                None => println!("{line}"),
            }
            if !base.skip_metadata {
                save_metadata_for_file(config, &run, image_path, &result)?;
            }
            Ok(result)
        });

        match outcome {
            Ok(result) => {
                successful += 1;
                info!(
                    "{}Processed {} ({}/{}) in {:.1}ms",
                    symbols::completed_successfully(),
                    image_path.display(),
                    index + 1,
                    image_files.len(),
                    result.processing_time_ms()
                );
            }
            Err(e) => {
                failed += 1;
                if base.strict {
                    if let Some(pb) = &pb {
                        remove_progress_bar(pb);
                    }
                    return Err(e.context(format!("Failed to process {}", image_path.display())));
                }
                warn!(
                    "{}Failed to process {} ({}/{}): {e:#}",
                    symbols::warning(),
                    image_path.display(),
                    index + 1,
                    image_files.len()
                );
            }
        }
        if let Some(pb) = &pb {
            pb.inc(1);
        }
    }

    if let Some(pb) = &pb {
        pb.finish_and_clear();
        remove_progress_bar(pb);
    }

    let elapsed = batch_start.elapsed().as_secs_f64();
    if failed == 0 {
        info!(
            "{}Processed {successful} image(s) in {elapsed:.1}s",
            symbols::completed_successfully()
        );
    } else {
        warn!(
            "{}{failed} of {} image(s) failed to process",
            symbols::completed_partially_successfully(),
            image_files.len()
        );
    }

    Ok(successful)
}

fn save_metadata_for_file<C, R>(config: &C, run: &RunContext, image_path: &Path, result: &R) -> Result<()>
where
    C: RunConfig + Serialize,
    R: ImageResult,
{
    let base = config.base();
    let path = get_metadata_path(image_path, base.output_dir.as_deref())?;
    let sections = ToolSections {
        core: Some(toml::Value::try_from(result).context("Failed to convert result to TOML")?),
        config: Some(toml::Value::try_from(config).context("Failed to convert config to TOML")?),
        execution: Some(ExecutionContext {
            timestamp: Some(run.started),
            leafscan_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            command_line: Some(run.command_line.clone()),
            processing_time_ms: Some(result.processing_time_ms()),
            env_vars: collect_env_vars(),
        }),
        system: Some(run.system.clone()),
        input: Some(InputProcessing {
            image_path: image_path.display().to_string(),
            strict_mode: base.strict,
        }),
    };
    update_tool_section(&path, config.tool_name(), sections)
}

enum Engine {
    Models(Arc<InferenceContext>),
    Demo,
}

impl Engine {
    fn classify(&self, config: &ClassifyConfig, image_path: &Path) -> Result<ClassifyOutcome> {
        let start = Instant::now();
        let (verdict, details) = match self {
            Engine::Models(context) => {
                let image = load_rgb(image_path)?;
                let (verdict, details) = run_pipeline(context, image, config)?;
                (verdict, details)
            }
            Engine::Demo => (demo_verdict(image_path), None),
        };
        Ok(ClassifyOutcome {
            image_path: image_path.display().to_string(),
            verdict,
            details,
            processing_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            json: config.json,
        })
    }
}

fn run_pipeline(
    context: &Arc<InferenceContext>,
    image: RgbImage,
    config: &ClassifyConfig,
) -> Result<(FinalVerdict, Option<ClassificationDetails>), ClassifyError> {
    match (config.timeout(), config.details) {
        (Some(timeout), true) => {
            let details = classify_with_details_deadline(context.clone(), image, timeout)?;
            Ok((details.verdict.clone(), Some(details)))
        }
        (Some(timeout), false) => Ok((classify_with_deadline(context.clone(), image, timeout)?, None)),
        (None, true) => {
            let details = context.classify_with_details(&image)?;
            Ok((details.verdict.clone(), Some(details)))
        }
        (None, false) => Ok((context.classify(&image)?, None)),
    }
}

/// `leafscan classify`
pub fn run_classify(config: ClassifyConfig) -> Result<usize> {
    let params = RuleParams::resolve(config.rules.as_deref())?;
    let paths = ModelPaths::from_env().with_overrides(&config.paths);
    debug!("Model paths: {paths:?}");

    let device = determine_optimal_device(&config.base.device);
    let load_start = Instant::now();
    let mut system = SystemInfo {
        device_requested: Some(config.base.device.clone()),
        device_selected: Some(device.device.clone()),
        device_selection_reason: Some(device.reason.clone()),
        ..Default::default()
    };

    let engine = match InferenceContext::load(&paths, &device.device, params) {
        Ok(context) => {
            system.specialist_loaded = context.has_specialist();
            Engine::Models(Arc::new(context))
        }
        Err(e) if config.allow_demo => {
            warn!(
                "{}Models unavailable ({e}); using filename-hint demo verdicts",
                symbols::warning()
            );
            system.demo_mode = true;
            Engine::Demo
        }
        Err(e) => return Err(anyhow!(e).context("Failed to load models")),
    };
    system.model_load_time_ms = Some(load_start.elapsed().as_secs_f64() * 1000.0);
    info!(
        "{}Ready in {:.1}ms",
        symbols::model_loaded(),
        system.model_load_time_ms.unwrap_or_default()
    );

    run_batch(&config, system, |path| engine.classify(&config, path))
}

/// `leafscan metrics`
pub fn run_metrics(config: MetricsConfig) -> Result<usize> {
    run_batch(&config, SystemInfo::default(), |path| {
        let start = Instant::now();
        let image = load_rgb(path)?;
        let metrics = leaf_metrics::extract(&image)?;
        Ok(MetricsOutcome {
            image_path: path.display().to_string(),
            metrics,
            processing_time_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BaseConfig;
    use image::Rgb;
    use tempfile::tempdir;

    fn base(sources: Vec<String>, skip_metadata: bool) -> BaseConfig {
        BaseConfig {
            sources,
            device: "cpu".to_string(),
            output_dir: None,
            skip_metadata,
            strict: true,
        }
    }

    fn write_leaf(dir: &Path, name: &str) -> String {
        let path = dir.join(name);
        RgbImage::from_pixel(32, 32, Rgb([40, 150, 50]))
            .save(&path)
            .unwrap();
        path.display().to_string()
    }

    #[test]
    fn test_metrics_batch_writes_metadata() {
        let dir = tempdir().unwrap();
        let source = write_leaf(dir.path(), "leaf.png");
        let config = MetricsConfig {
            base: base(vec![source], false),
        };
        assert_eq!(run_metrics(config).unwrap(), 1);

        let sidecar = dir.path().join("leaf.leafscan.toml");
        let text = std::fs::read_to_string(sidecar).unwrap();
        assert!(text.contains("[metrics"));
        assert!(text.contains("leaf_area_fraction"));
    }

    #[test]
    fn test_strict_batch_stops_on_bad_image() {
        let dir = tempdir().unwrap();
        let bad = dir.path().join("broken.png");
        std::fs::write(&bad, b"not an image").unwrap();
        let config = MetricsConfig {
            base: base(vec![bad.display().to_string()], true),
        };
        assert!(run_metrics(config).is_err());
    }

    #[test]
    fn test_permissive_batch_counts_successes() {
        let dir = tempdir().unwrap();
        let good = write_leaf(dir.path(), "good.png");
        let bad = dir.path().join("broken.png");
        std::fs::write(&bad, b"not an image").unwrap();
        let mut base = base(vec![good, bad.display().to_string()], true);
        base.strict = false;
        assert_eq!(run_metrics(MetricsConfig { base }).unwrap(), 1);
    }

    #[test]
    fn test_demo_outcome_rendering() {
        let outcome = ClassifyOutcome {
            image_path: "rust_leaf.jpg".to_string(),
            verdict: demo_verdict(Path::new("rust_leaf.jpg")),
            details: None,
            processing_time_ms: 0.1,
            json: true,
        };
        let line = outcome.render().unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["status"], "Accepted");
        assert_eq!(value["label"], "Apple___Cedar_apple_rust");
    }
}
