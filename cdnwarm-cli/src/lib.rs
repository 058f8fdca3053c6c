//! # cdnwarm
//!
//! Pre-warms a CDN cache from an object store and measures the result.
//!
//! The binary wires five stages (`analysis`, `prewarm`, `errors`,
//! `loadtest`, `optimize`) into a [`warm_workflow::Coordinator`]. Bulk work
//! inside a stage runs on a size-aware [`warm_pool::WorkerPool`].

pub mod cli;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ffmpeg;
pub mod http;
pub mod interrupt;
pub mod logging;
pub mod report;
pub mod stages;
pub mod stats;
pub mod storage;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cli::{Args, Command};
use crate::config::WarmConfig;
use crate::error::Result;

/// Merge file, environment and flag configuration.
pub fn resolve_config(args: &Args) -> Result<WarmConfig> {
    let mut config = WarmConfig::load(args.config.as_deref())?;
    args.overrides.apply(&mut config);
    config.validate()?;
    debug!(?config, "Resolved configuration");
    Ok(config)
}

/// Execute the parsed command line.
pub async fn run(args: Args, token: CancellationToken) -> Result<()> {
    let config = resolve_config(&args)?;

    match &args.command {
        Command::Workflow(workflow) => {
            let result = commands::run_workflow(&config, workflow, token).await?;
            if !result.success {
                debug!("Workflow completed with failed stages");
            }
            Ok(())
        }
        Command::Analyze => commands::run_single_stage(stages::ANALYSIS, &config, token).await,
        Command::Prewarm => commands::run_single_stage(stages::PREWARM, &config, token).await,
        Command::Errors => commands::run_single_stage(stages::ERRORS, &config, token).await,
        Command::Loadtest => commands::run_single_stage(stages::LOADTEST, &config, token).await,
        Command::Optimize => commands::run_single_stage(stages::OPTIMIZE, &config, token).await,
        Command::Progress { discard } => commands::show_progress(&config, *discard).await,
        Command::ShowConfig => commands::show_config(&config),
    }
}
