use clap::Parser;
use env_logger::Builder;
use env_logger::Env;
use log::{error, info, Level};

use colored::*;
use leafscan::batch::{run_classify, run_metrics};
use leafscan::color_utils::{init_color_config, symbols};
use leafscan::config::{ClassifyCommand, ClassifyConfig, GlobalArgs, MetricsCommand, MetricsConfig};
use leafscan::model_access::ModelPaths;
use std::io::Write;

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Diagnose leaf images
    Classify(ClassifyCommand),

    /// Print leaf, color and texture metrics for images
    Metrics(MetricsCommand),

    /// Show version information
    Version,
}

#[derive(Parser)]
#[command(name = "leafscan")]
#[command(about = "Plant-leaf disease diagnosis")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

fn get_log_level_from_verbosity(
    verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::ErrorLevel>,
) -> log::LevelFilter {
    // -q -> ERROR, default -> WARN, then one level per -v
    if verbosity.is_silent() {
        return log::LevelFilter::Error;
    }
    match verbosity.log_level_filter() {
        log::LevelFilter::Off => log::LevelFilter::Off,
        log::LevelFilter::Error => log::LevelFilter::Warn,
        log::LevelFilter::Warn => log::LevelFilter::Info,
        log::LevelFilter::Info => log::LevelFilter::Debug,
        log::LevelFilter::Debug | log::LevelFilter::Trace => log::LevelFilter::Trace,
    }
}

fn init_logging(global: &GlobalArgs) {
    // If user didn't pass -v/-q and RUST_LOG is set, honor the env var.
    let use_env = !global.verbosity.is_present() && std::env::var_os("RUST_LOG").is_some();

    let mut logger = if use_env {
        Builder::from_env(Env::default())
    } else {
        let mut b = Builder::new();
        b.filter_level(get_log_level_from_verbosity(global.verbosity.clone()));
        b
    };

    let colorize = leafscan::color_utils::colors_enabled();
    logger
        .format(move |buf, record| {
            let level_str = if colorize {
                match record.level() {
                    Level::Error => "ERROR".red().bold().to_string(),
                    Level::Warn => "WARN".yellow().to_string(),
                    Level::Info => "INFO".green().to_string(),
                    Level::Debug => "DEBUG".blue().to_string(),
                    Level::Trace => "TRACE".magenta().to_string(),
                }
            } else {
                record.level().to_string()
            };
            writeln!(buf, "[{}] {}", level_str, record.args())
        })
        .init();
}

fn describe_sources(sources: &[String]) -> String {
    if sources.len() == 1 {
        sources[0].clone()
    } else {
        format!("{} inputs", sources.len())
    }
}

fn main() {
    let cli = Cli::parse();
    init_color_config(cli.global.no_color);
    init_logging(&cli.global);

    match &cli.command {
        Some(Commands::Classify(classify_cmd)) => {
            info!(
                "{}Classify: {} | device: {}",
                symbols::leaf(),
                describe_sources(&classify_cmd.sources),
                cli.global.device
            );
            let config = match ClassifyConfig::from_args(cli.global.clone(), classify_cmd.clone()) {
                Ok(config) => config,
                Err(e) => {
                    error!("{}{e}", symbols::operation_failed());
                    std::process::exit(2);
                }
            };
            if let Err(e) = run_classify(config) {
                error!("{}Classification failed: {e:#}", symbols::operation_failed());
                std::process::exit(1);
            }
        }
        Some(Commands::Metrics(metrics_cmd)) => {
            info!(
                "{}Metrics: {}",
                symbols::checking(),
                describe_sources(&metrics_cmd.sources)
            );
            let config = MetricsConfig::from_args(cli.global.clone(), metrics_cmd.clone());
            if let Err(e) = run_metrics(config) {
                error!("{}Metrics failed: {e:#}", symbols::operation_failed());
                std::process::exit(1);
            }
        }
        Some(Commands::Version) => {
            let paths = ModelPaths::from_env();
            println!("leafscan v{}", env!("CARGO_PKG_VERSION"));
            println!("Light model: {}", paths.light_model.display());
            println!("Heavy model: {}", paths.heavy_model.display());
            println!("Specialist model: {}", paths.specialist_model.display());
            println!("Repository: {}", env!("CARGO_PKG_REPOSITORY"));
        }
        None => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            if let Err(e) = cmd.print_help() {
                error!("{e}");
            }
        }
    }
}
