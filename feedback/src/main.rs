mod config;
mod dispatch;

use crate::{config::FeedbackConfig, dispatch::Dispatcher};
use clap::Parser;
use std::{path::PathBuf, process::exit};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Queue the next round of prediction-driven simulations, with the
/// submission budget split evenly over the configured systems
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Total number of new submissions to request across all systems
    #[arg(default_value_t = 100)]
    submissions: u64,

    /// Path to the feedback configuration file
    #[arg(short, long, default_value = "feedback.yml")]
    config: PathBuf,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match FeedbackConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load {}: {e}", cli.config.to_string_lossy());
            exit(1)
        }
    };

    if config.preflight_checks() {
        exit(1)
    }

    if Dispatcher::new(config).dispatch(cli.submissions).is_err() {
        exit(1)
    }
}
