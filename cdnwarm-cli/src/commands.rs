//! Subcommand implementations.

use tokio_util::sync::CancellationToken;
use tracing::info;
use warm_workflow::{
    Coordinator, CoordinatorOptions, ProgressStore, StageContext, WorkflowError, WorkflowResult,
};

use crate::cli::WorkflowArgs;
use crate::config::WarmConfig;
use crate::error::{AppError, Result};
use crate::stages::{STAGE_NAMES, build_workflow, stage_by_name};

/// Run the full workflow and print a per-stage summary.
pub async fn run_workflow(
    config: &WarmConfig,
    args: &WorkflowArgs,
    token: CancellationToken,
) -> Result<WorkflowResult> {
    let options = CoordinatorOptions {
        resume_from: args.resume_from.clone(),
        continue_on_error: args.continue_on_error,
        progress_path: config.checkpoint_path(),
    };
    let coordinator =
        Coordinator::new(build_workflow(&args.skip_flags()), options).with_cancellation(token);

    match coordinator.run(config).await {
        Ok(result) => {
            print_summary(&result);
            Ok(result)
        }
        Err(e @ WorkflowError::Aborted { .. }) => {
            eprintln!(
                "Progress was saved to {}. Fix the failure and rerun with --resume-from {}, \
                 or pass --continue-on-error true to carry on past failing stages.",
                coordinator.store().path().display(),
                e.stage().unwrap_or(STAGE_NAMES[0])
            );
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_summary(result: &WorkflowResult) {
    println!();
    println!("Workflow finished in {:.1}s", result.duration.as_secs_f64());
    for stage in &result.stages {
        match &stage.error {
            Some(error) => println!("  {:<10} {} ({error})", stage.name, stage.status),
            None if stage.status.executed() => println!(
                "  {:<10} {} in {:.1}s",
                stage.name,
                stage.status,
                stage.duration.as_secs_f64()
            ),
            None => println!("  {:<10} {}", stage.name, stage.status),
        }
    }
    if !result.output_files.is_empty() {
        println!("Output files:");
        for (name, path) in &result.output_files {
            println!("  {name}: {}", path.display());
        }
    }
    if !result.success {
        let failed: Vec<_> = result.failed_stages().map(|s| s.name.as_str()).collect();
        println!("Failed stages: {}", failed.join(", "));
    }
}

/// Run one stage on its own, without touching the checkpoint.
pub async fn run_single_stage(
    name: &str,
    config: &WarmConfig,
    token: CancellationToken,
) -> Result<()> {
    let stage = stage_by_name(name)
        .ok_or_else(|| AppError::config(format!("unknown stage '{name}'")))?;

    info!(stage = name, "Running single stage");
    let ctx = StageContext::new(name, token.clone());
    match stage.stage.execute(&ctx, config).await {
        Ok(()) => {
            for (_, path) in stage.stage.output_files(config) {
                println!("{}", path.display());
            }
            Ok(())
        }
        Err(_) if token.is_cancelled() => Err(WorkflowError::Cancelled {
            stage: name.to_string(),
        }
        .into()),
        Err(source) => Err(WorkflowError::Aborted {
            stage: name.to_string(),
            source,
        }
        .into()),
    }
}

/// Print the checkpoint, or delete it with `discard`.
pub async fn show_progress(config: &WarmConfig, discard: bool) -> Result<()> {
    let store = ProgressStore::new(config.checkpoint_path());

    if discard {
        store.delete().await?;
        println!("Discarded checkpoint {}", store.path().display());
        return Ok(());
    }

    let progress = match store.load().await {
        Ok(progress) => progress,
        Err(e) if e.is_not_found() => {
            println!("No checkpoint at {}", store.path().display());
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    println!("Checkpoint {}", store.path().display());
    println!("  started:      {}", progress.start_time.to_rfc3339());
    println!("  last update:  {}", progress.last_update.to_rfc3339());
    if !progress.current_stage.is_empty() {
        println!("  current:      {}", progress.current_stage);
    }
    for name in STAGE_NAMES {
        let mark = if progress.is_completed(name) { "done" } else { "-" };
        println!("  {name:<10} {mark}");
    }
    for (name, path) in &progress.output_files {
        println!("  {name}: {}", path.display());
    }
    if let Some(next) = STAGE_NAMES.iter().find(|s| !progress.is_completed(s)) {
        println!("Resume with: cdnwarm workflow --resume-from {next}");
    }
    Ok(())
}

/// Print the effective configuration.
pub fn show_config(config: &WarmConfig) -> Result<()> {
    let text = toml::to_string_pretty(config)
        .map_err(|e| AppError::config(format!("cannot render configuration: {e}")))?;
    print!("{text}");
    Ok(())
}
