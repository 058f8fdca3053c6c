use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;
use warm_pool::{BoxError, SizeCategory, Task, WorkerPool};
use warm_workflow::{Stage, StageContext};

use super::{OPTIMIZE_REPORT, list_objects, progress_span, report_writer};
use crate::config::{OptimizeConfig, WarmConfig, normalize_extension};
use crate::dispatch;
use crate::ffmpeg::{self, EncodeSettings};
use crate::report::markdown_table;
use crate::stats::format_bytes;
use crate::storage::{FileInfo, ObjectStore, filter_by_extension};

const MIB: u64 = 1024 * 1024;

/// Re-encodes large videos with ffmpeg.
#[derive(Debug, Default, Clone, Copy)]
pub struct OptimizeStage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeRecord {
    pub path: String,
    pub category: SizeCategory,
    pub original_bytes: u64,
    pub optimized_bytes: Option<u64>,
    /// `1 - optimized / original`; negative when the output grew.
    pub savings_ratio: Option<f64>,
    pub output: Option<PathBuf>,
    pub uploaded: bool,
    pub elapsed_secs: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeReport {
    pub generated_at: DateTime<Utc>,
    pub settings: EncodeSettings,
    pub candidates: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub uploaded: usize,
    pub original_bytes: u64,
    pub optimized_bytes: u64,
    /// Savings over successfully optimized files only.
    pub savings_ratio: f64,
    pub results: Vec<OptimizeRecord>,
}

impl OptimizeReport {
    fn new(settings: EncodeSettings, mut results: Vec<OptimizeRecord>) -> Self {
        results.sort_by(|a, b| a.path.cmp(&b.path));
        let mut report = Self {
            generated_at: Utc::now(),
            settings,
            candidates: results.len(),
            succeeded: 0,
            failed: 0,
            uploaded: 0,
            original_bytes: 0,
            optimized_bytes: 0,
            savings_ratio: 0.0,
            results: Vec::new(),
        };
        for record in &results {
            match record.optimized_bytes {
                Some(optimized) if record.error.is_none() => {
                    report.succeeded += 1;
                    report.original_bytes += record.original_bytes;
                    report.optimized_bytes += optimized;
                }
                _ => report.failed += 1,
            }
            if record.uploaded {
                report.uploaded += 1;
            }
        }
        report.savings_ratio = savings_ratio(report.original_bytes, report.optimized_bytes);
        report.results = results;
        report
    }

    pub fn to_markdown(&self) -> String {
        let mut md = format!(
            "# Media optimization\n\n{} candidates, {} optimized, {} failed, {} uploaded.\n\n",
            self.candidates, self.succeeded, self.failed, self.uploaded
        );
        md.push_str(&markdown_table(
            &["Metric", "Value"],
            &[
                vec!["Codec".into(), self.settings.video_codec.to_string()],
                vec!["CRF".into(), self.settings.crf.to_string()],
                vec!["Original".into(), format_bytes(self.original_bytes)],
                vec!["Optimized".into(), format_bytes(self.optimized_bytes)],
                vec!["Savings".into(), format!("{:.1}%", self.savings_ratio * 100.0)],
            ],
        ));

        if !self.results.is_empty() {
            md.push_str("\n## Files\n\n");
            let rows: Vec<Vec<String>> = self
                .results
                .iter()
                .map(|r| {
                    vec![
                        r.path.clone(),
                        format_bytes(r.original_bytes),
                        r.optimized_bytes.map(format_bytes).unwrap_or_else(|| "-".into()),
                        r.savings_ratio
                            .map(|s| format!("{:.1}%", s * 100.0))
                            .unwrap_or_else(|| "-".into()),
                        if r.uploaded { "yes" } else { "no" }.to_string(),
                        r.error.clone().unwrap_or_default(),
                    ]
                })
                .collect();
            md.push_str(&markdown_table(
                &["Path", "Original", "Optimized", "Savings", "Uploaded", "Error"],
                &rows,
            ));
        }
        md
    }
}

fn savings_ratio(original: u64, optimized: u64) -> f64 {
    if original == 0 {
        0.0
    } else {
        1.0 - optimized as f64 / original as f64
    }
}

/// Video objects at least `min_size_mib` large.
pub fn select_candidates(files: Vec<FileInfo>, config: &OptimizeConfig) -> Vec<FileInfo> {
    let allowed: Vec<String> = config.extensions.iter().map(|e| normalize_extension(e)).collect();
    let min_bytes = config.min_size_mib.saturating_mul(MIB);
    filter_by_extension(files, &allowed)
        .into_iter()
        .filter(|f| f.size >= min_bytes)
        .collect()
}

fn join_relative(root: &Path, rel: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for segment in rel.split('/').filter(|s| !s.is_empty() && *s != "..") {
        path.push(segment);
    }
    path
}

struct Job {
    store: Arc<dyn ObjectStore>,
    file: FileInfo,
    config: Arc<OptimizeConfig>,
    output_root: PathBuf,
    scratch_root: PathBuf,
}

struct Optimized {
    output: PathBuf,
    optimized_bytes: u64,
    uploaded: bool,
}

async fn optimize_one(job: Job, token: CancellationToken) -> anyhow::Result<Optimized> {
    let Job {
        store,
        file,
        config,
        output_root,
        scratch_root,
    } = job;

    let local = store.local_path(&file.path).filter(|p| p.is_file());
    let (input, downloaded) = match local {
        Some(path) => (path, false),
        None => {
            let target = join_relative(&scratch_root, &file.path);
            store
                .download_object(&file.path, &target)
                .await
                .with_context(|| format!("downloading {}", file.path))?;
            (target, true)
        }
    };

    let output = join_relative(&output_root, &file.path);
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let encoded = ffmpeg::encode(&config.ffmpeg_path, &input, &output, &config.encode, &token).await;
    if downloaded && let Err(e) = tokio::fs::remove_file(&input).await {
        debug!(path = %input.display(), error = %e, "Failed to remove scratch copy");
    }
    encoded.with_context(|| format!("encoding {}", file.path))?;

    let optimized_bytes = tokio::fs::metadata(&output)
        .await
        .with_context(|| format!("reading {}", output.display()))?
        .len();

    let mut uploaded = false;
    if config.upload {
        if optimized_bytes < file.size {
            store
                .upload_object(&output, &file.path)
                .await
                .with_context(|| format!("uploading {}", file.path))?;
            uploaded = true;
        } else {
            info!(path = %file.path, "Optimized file is not smaller, keeping the original");
        }
    }

    Ok(Optimized {
        output,
        optimized_bytes,
        uploaded,
    })
}

#[async_trait]
impl Stage<WarmConfig> for OptimizeStage {
    async fn execute(&self, ctx: &StageContext, config: &WarmConfig) -> anyhow::Result<()> {
        let (store, files) = list_objects(config).await?;
        let candidates = select_candidates(files, &config.optimize);
        let writer = report_writer(config);

        if candidates.is_empty() {
            info!(
                min_size_mib = config.optimize.min_size_mib,
                "No files qualify for optimization"
            );
            let report = OptimizeReport::new(config.optimize.encode.clone(), Vec::new());
            writer.write(OPTIMIZE_REPORT, &report, &report.to_markdown()).await?;
            return Ok(());
        }

        // Large files get their own workers regardless of `optimize_by_size`.
        let thresholds = config.pool.thresholds()?;
        let pool: WorkerPool<Optimized> =
            WorkerPool::new(config.pool.pool_config())?.with_cancellation(&ctx.token);

        let shared = Arc::new(config.optimize.clone());
        let output_root = config.output_dir.join("optimized");
        let scratch_root = config.output_dir.join(".scratch");

        let mut sizes = HashMap::new();
        let tasks: Vec<Task<Optimized>> = candidates
            .into_iter()
            .map(|file| {
                sizes.insert(file.path.clone(), file.size);
                let job = Job {
                    store: store.clone(),
                    file: file.clone(),
                    config: shared.clone(),
                    output_root: output_root.clone(),
                    scratch_root: scratch_root.clone(),
                };
                Task::new(file.path, file.size, &thresholds, job, |job, task_ctx| async move {
                    optimize_one(job, task_ctx.token).await.map_err(BoxError::from)
                })
            })
            .collect();

        info!(
            candidates = tasks.len(),
            codec = %config.optimize.encode.video_codec,
            crf = config.optimize.encode.crf,
            "Starting optimization"
        );

        let span = progress_span(&ctx.name, tasks.len() as u64);
        pool.start()?;

        let mut records = Vec::with_capacity(tasks.len());
        dispatch::run_all(&pool, tasks, &ctx.token, |outcome| {
            let original_bytes = sizes.get(&outcome.id).copied().unwrap_or(0);
            let mut record = OptimizeRecord {
                path: outcome.id.clone(),
                category: outcome.category,
                original_bytes,
                optimized_bytes: None,
                savings_ratio: None,
                output: None,
                uploaded: false,
                elapsed_secs: outcome.elapsed.as_secs_f64(),
                error: None,
            };
            match outcome.result {
                Ok(done) => {
                    record.savings_ratio = Some(savings_ratio(original_bytes, done.optimized_bytes));
                    record.optimized_bytes = Some(done.optimized_bytes);
                    record.output = Some(done.output);
                    record.uploaded = done.uploaded;
                }
                Err(e) => {
                    warn!(path = %outcome.id, error = %e, "Optimization failed");
                    record.error = Some(e.to_string());
                }
            }
            records.push(record);
            span.pb_inc(1);
        })
        .instrument(span.clone())
        .await;
        pool.shutdown().await;

        let _ = tokio::fs::remove_dir_all(&scratch_root).await;

        let report = OptimizeReport::new(config.optimize.encode.clone(), records);
        writer.write(OPTIMIZE_REPORT, &report, &report.to_markdown()).await?;

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            uploaded = report.uploaded,
            saved = %format_bytes(report.original_bytes.saturating_sub(report.optimized_bytes)),
            "Optimization complete"
        );

        if ctx.token.is_cancelled() {
            anyhow::bail!("optimization interrupted");
        }
        if report.succeeded == 0 {
            anyhow::bail!("all {} optimizations failed", report.candidates);
        }
        Ok(())
    }

    fn output_files(&self, config: &WarmConfig) -> Vec<(String, PathBuf)> {
        report_writer(config).output_files(OPTIMIZE_REPORT)
    }
}
