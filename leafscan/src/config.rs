//! Separation between CLI arguments and the internal run configurations.
//!
//! `GlobalArgs` holds flags shared by every subcommand; each command struct
//! holds only its own arguments. `from_args` merges the two into the
//! configuration the batch runner consumes.

use clap::Parser;
use clap_verbosity_flag::Verbosity;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::model_access::PathOverrides;

pub const RULES_ENV: &str = "LEAFSCAN_RULES";
pub const ALLOW_DEMO_ENV: &str = "LEAFSCAN_ALLOW_DEMO";

/// Global CLI arguments that apply to all leafscan commands
#[derive(Parser, Debug, Clone)]
pub struct GlobalArgs {
    /// Global output directory (overrides default placement next to input)
    #[arg(long, global = true)]
    pub output_dir: Option<String>,

    /// Write a `<stem>.leafscan.toml` metadata file per image
    #[arg(long, global = true)]
    pub metadata: bool,

    /// Verbosity level (-q/--quiet, -v/-vv/-vvv for info/debug/trace)
    #[command(flatten)]
    pub verbosity: Verbosity,

    /// Warn and continue on unsupported or failing inputs instead of stopping
    #[arg(long, global = true)]
    pub permissive: bool,

    /// Device to use for inference (auto, cpu, coreml)
    #[arg(long, default_value = "auto", global = true)]
    pub device: String,

    /// Disable colored output (also respects NO_COLOR and LEAFSCAN_NO_COLOR env vars)
    #[arg(long, global = true)]
    pub no_color: bool,
}

/// Settings common to every command.
#[derive(Debug, Clone, Serialize)]
pub struct BaseConfig {
    pub sources: Vec<String>,
    pub device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    pub skip_metadata: bool,
    /// Opposite of `--permissive`
    pub strict: bool,
}

impl From<GlobalArgs> for BaseConfig {
    fn from(global: GlobalArgs) -> Self {
        Self {
            sources: Vec::new(),
            device: global.device,
            output_dir: global.output_dir,
            skip_metadata: !global.metadata,
            strict: !global.permissive,
        }
    }
}

/// Diagnose leaf images
#[derive(Parser, Debug, Clone)]
pub struct ClassifyCommand {
    /// Path(s) to input images or directories. Supports glob patterns like *.jpg
    #[arg(value_name = "IMAGES_OR_DIRS", required = true)]
    pub sources: Vec<String>,

    /// Print the full decision breakdown instead of the verdict only
    #[arg(long)]
    pub details: bool,

    /// Print one JSON document per image on stdout
    #[arg(long)]
    pub json: bool,

    /// TOML file overriding rule thresholds (env: LEAFSCAN_RULES)
    #[arg(long)]
    pub rules: Option<PathBuf>,

    /// Abandon an image after this many milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Fall back to filename-hint demo verdicts when models fail to load
    #[arg(long)]
    pub allow_demo: bool,

    /// Path to the light classifier ONNX model
    #[arg(long)]
    pub light_model: Option<String>,

    /// Path to the heavy classifier ONNX model
    #[arg(long)]
    pub heavy_model: Option<String>,

    /// Path to the specialist ONNX model
    #[arg(long)]
    pub specialist_model: Option<String>,

    /// Path to class_to_idx.json
    #[arg(long)]
    pub class_to_idx: Option<String>,

    /// Path to the class-wise temperature table
    #[arg(long)]
    pub temperatures: Option<String>,
}

/// Print leaf metrics for images
#[derive(Parser, Debug, Clone)]
pub struct MetricsCommand {
    /// Path(s) to input images or directories. Supports glob patterns like *.jpg
    #[arg(value_name = "IMAGES_OR_DIRS", required = true)]
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassifyConfig {
    #[serde(skip)]
    pub base: BaseConfig,
    pub details: bool,
    pub json: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub allow_demo: bool,
    #[serde(skip)]
    pub paths: PathOverrides,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsConfig {
    #[serde(skip)]
    pub base: BaseConfig,
}

fn env_flag(value: Option<String>) -> bool {
    matches!(
        value.as_deref().map(str::trim),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

impl ClassifyConfig {
    pub fn from_args(global: GlobalArgs, cmd: ClassifyCommand) -> Result<Self, String> {
        Self::from_args_with(global, cmd, |key| std::env::var(key).ok())
    }

    /// Same as [`ClassifyConfig::from_args`] with an explicit env lookup.
    pub fn from_args_with<F>(global: GlobalArgs, cmd: ClassifyCommand, lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if cmd.timeout_ms == Some(0) {
            return Err("--timeout-ms must be greater than zero".to_string());
        }
        let mut base: BaseConfig = global.into();
        base.sources = cmd.sources;

        let rules = cmd
            .rules
            .or_else(|| lookup(RULES_ENV).filter(|v| !v.is_empty()).map(PathBuf::from));

        Ok(Self {
            base,
            details: cmd.details,
            json: cmd.json,
            rules,
            timeout_ms: cmd.timeout_ms,
            allow_demo: cmd.allow_demo || env_flag(lookup(ALLOW_DEMO_ENV)),
            paths: PathOverrides {
                light_model: cmd.light_model,
                heavy_model: cmd.heavy_model,
                specialist_model: cmd.specialist_model,
                class_to_idx: cmd.class_to_idx,
                temperature_classwise: cmd.temperatures,
            },
        })
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl MetricsConfig {
    pub fn from_args(global: GlobalArgs, cmd: MetricsCommand) -> Self {
        let mut base: BaseConfig = global.into();
        base.sources = cmd.sources;
        Self { base }
    }
}

/// Access to the shared part of a command configuration.
pub trait RunConfig {
    fn base(&self) -> &BaseConfig;

    /// Section name in metadata files
    fn tool_name(&self) -> &'static str;
}

impl RunConfig for ClassifyConfig {
    fn base(&self) -> &BaseConfig {
        &self.base
    }

    fn tool_name(&self) -> &'static str {
        "classify"
    }
}

impl RunConfig for MetricsConfig {
    fn base(&self) -> &BaseConfig {
        &self.base
    }

    fn tool_name(&self) -> &'static str {
        "metrics"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global(permissive: bool, metadata: bool) -> GlobalArgs {
        GlobalArgs {
            output_dir: Some("/out".to_string()),
            metadata,
            verbosity: Verbosity::new(0, 0),
            permissive,
            device: "cpu".to_string(),
            no_color: false,
        }
    }

    fn classify_cmd() -> ClassifyCommand {
        ClassifyCommand {
            sources: vec!["leaf.jpg".to_string()],
            details: true,
            json: false,
            rules: None,
            timeout_ms: Some(1500),
            allow_demo: false,
            light_model: None,
            heavy_model: Some("/models/heavy.onnx".to_string()),
            specialist_model: None,
            class_to_idx: None,
            temperatures: None,
        }
    }

    #[test]
    fn test_global_args_conversion() {
        let config: BaseConfig = global(true, false).into();
        assert!(config.sources.is_empty());
        assert_eq!(config.device, "cpu");
        assert_eq!(config.output_dir.as_deref(), Some("/out"));
        assert!(config.skip_metadata);
        assert!(!config.strict);
    }

    #[test]
    fn test_classify_command_conversion() {
        let config =
            ClassifyConfig::from_args_with(global(false, true), classify_cmd(), |_| None).unwrap();
        assert_eq!(config.base.sources, vec!["leaf.jpg"]);
        assert!(config.base.strict);
        assert!(!config.base.skip_metadata);
        assert!(config.details);
        assert_eq!(config.timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.paths.heavy_model.as_deref(), Some("/models/heavy.onnx"));
        assert!(config.rules.is_none());
        assert!(!config.allow_demo);
    }

    #[test]
    fn test_rules_and_demo_from_env() {
        let lookup = |key: &str| match key {
            RULES_ENV => Some("/etc/leafscan/rules.toml".to_string()),
            ALLOW_DEMO_ENV => Some("1".to_string()),
            _ => None,
        };
        let config = ClassifyConfig::from_args_with(global(false, false), classify_cmd(), lookup).unwrap();
        assert_eq!(config.rules, Some(PathBuf::from("/etc/leafscan/rules.toml")));
        assert!(config.allow_demo);

        let mut cmd = classify_cmd();
        cmd.rules = Some(PathBuf::from("cli.toml"));
        let config = ClassifyConfig::from_args_with(global(false, false), cmd, lookup).unwrap();
        assert_eq!(config.rules, Some(PathBuf::from("cli.toml")));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut cmd = classify_cmd();
        cmd.timeout_ms = Some(0);
        assert!(ClassifyConfig::from_args_with(global(false, false), cmd, |_| None).is_err());
    }

    #[test]
    fn test_metrics_command_conversion() {
        let config = MetricsConfig::from_args(
            global(true, true),
            MetricsCommand {
                sources: vec!["dir/".to_string()],
            },
        );
        assert_eq!(config.base.sources, vec!["dir/"]);
        assert_eq!(config.tool_name(), "metrics");
    }
}
