//! Conditional terminal styling.
//!
//! Colors and emoji are disabled by any of:
//! - `--no-color`
//! - `NO_COLOR` (https://no-color.org/)
//! - `LEAFSCAN_NO_COLOR`
//! - `TERM=dumb`
//! - stderr not being a TTY

use colored::ColoredString;
use std::io::{stderr, IsTerminal};
use std::sync::OnceLock;

static COLOR_CONFIG: OnceLock<ColorConfig> = OnceLock::new();

fn env_set(key: &str) -> bool {
    !std::env::var(key).unwrap_or_default().is_empty()
}

fn should_disable_colors_from_env() -> bool {
    env_set("NO_COLOR")
        || env_set("LEAFSCAN_NO_COLOR")
        || std::env::var("TERM").unwrap_or_default() == "dumb"
        || !stderr().is_terminal()
}

#[derive(Debug, Clone)]
struct ColorConfig {
    colors_enabled: bool,
}

impl ColorConfig {
    fn new(no_color_flag: bool) -> Self {
        Self {
            colors_enabled: !no_color_flag && !should_disable_colors_from_env(),
        }
    }
}

/// Record the `--no-color` flag. Call once after parsing arguments.
pub fn init_color_config(no_color_flag: bool) {
    if COLOR_CONFIG.set(ColorConfig::new(no_color_flag)).is_err() {
        log::debug!("Color configuration already initialized");
    }
}

pub fn colors_enabled() -> bool {
    COLOR_CONFIG
        .get()
        .map(|config| config.colors_enabled)
        .unwrap_or_else(|| !should_disable_colors_from_env())
}

pub fn maybe_color_stderr<F>(text: &str, color_fn: F) -> String
where
    F: FnOnce(&str) -> ColoredString,
{
    if colors_enabled() {
        color_fn(text).to_string()
    } else {
        text.to_string()
    }
}

pub mod colors {
    use super::maybe_color_stderr;
    use colored::Colorize;

    pub fn error_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.red().bold())
    }

    pub fn accepted(text: &str) -> String {
        maybe_color_stderr(text, |s| s.green().bold())
    }

    pub fn rejected(text: &str) -> String {
        maybe_color_stderr(text, |s| s.yellow())
    }
}

/// Emoji prefixes, or plain tags when colors are off.
pub mod symbols {
    use super::colors_enabled;

    fn pick(fancy: &'static str, plain: &'static str) -> &'static str {
        if colors_enabled() {
            fancy
        } else {
            plain
        }
    }

    pub fn model_loaded() -> &'static str {
        pick("✅ ", "")
    }

    pub fn operation_failed() -> &'static str {
        pick("❌ ", "[FAILED] ")
    }

    pub fn system_setup() -> &'static str {
        pick("⚙️  ", "")
    }

    pub fn resources_found() -> &'static str {
        pick("🎯 ", "")
    }

    pub fn checking() -> &'static str {
        pick("🔍 ", "")
    }

    pub fn leaf() -> &'static str {
        pick("🌿 ", "")
    }

    pub fn completed_successfully() -> &'static str {
        pick("✅ ", "[SUCCESS] ")
    }

    pub fn completed_partially_successfully() -> &'static str {
        pick("⚠️  ", "[PARTIAL-SUCCESS] ")
    }

    pub fn warning() -> &'static str {
        pick("⚠️  ", "")
    }
}

/// Progress bars that only appear on an interactive stderr.
pub mod progress {
    use crate::progress::add_progress_bar;

    use super::colors_enabled;
    use indicatif::{ProgressBar, ProgressStyle};
    use std::io::{stderr, IsTerminal};

    pub fn create_batch_progress_bar(total: usize) -> Option<ProgressBar> {
        if total <= 1 || !stderr().is_terminal() {
            return None;
        }
        let pb = ProgressBar::new(total as u64);
        add_progress_bar(pb.clone());
        let (template, chars) = if colors_enabled() {
            (
                "[{elapsed_precise}] [{bar:30.green/black}] ({pos}/{len}) {msg}",
                "█▓▒░",
            )
        } else {
            ("[{elapsed_precise}] [{bar:30}] ({pos}/{len}) {msg}", "#> ")
        };
        let style = ProgressStyle::default_bar()
            .template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars(chars);
        pb.set_style(style);
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Some(pb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_color_flag_disables_colors() {
        assert!(!ColorConfig::new(true).colors_enabled);
    }

    #[test]
    fn test_app_specific_env_disables_colors() {
        std::env::set_var("LEAFSCAN_NO_COLOR", "1");
        assert!(!ColorConfig::new(false).colors_enabled);
        std::env::remove_var("LEAFSCAN_NO_COLOR");
    }

    #[test]
    fn test_term_dumb_disables_colors() {
        std::env::set_var("TERM", "dumb");
        assert!(!ColorConfig::new(false).colors_enabled);
        std::env::remove_var("TERM");
    }

    #[test]
    fn test_plain_text_when_disabled() {
        use colored::Colorize;
        COLOR_CONFIG
            .set(ColorConfig {
                colors_enabled: false,
            })
            .ok();
        assert_eq!(maybe_color_stderr("leaf", |s| s.red()), "leaf");
        assert_eq!(symbols::operation_failed(), "[FAILED] ");
    }
}
