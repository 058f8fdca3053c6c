use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warm_workflow::{Stage, StageContext};

use super::prewarm::{PrewarmResults, build_url};
use super::{LOAD_TEST_REPORT, PREWARM_RESULTS, list_objects, report_writer};
use crate::config::{LoadTestConfig, WarmConfig};
use crate::http::retry::RetryPolicy;
use crate::http::{FetchResult, WarmClient};
use crate::report::markdown_table;
use crate::stats::LatencySummary;

/// Replays warmed URLs from a fixed number of concurrent workers.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoadTestStage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlStats {
    pub url: String,
    pub requests: u64,
    pub errors: u64,
    pub mean_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadTestReport {
    pub generated_at: DateTime<Utc>,
    /// `prewarm` or `listing`.
    pub url_source: String,
    pub urls: usize,
    pub concurrency: usize,
    pub duration_secs: f64,
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub requests_per_sec: f64,
    pub latency_ms: LatencySummary,
    pub ttfb_ms: LatencySummary,
    pub bytes: u64,
    /// Keyed by HTTP status, or `error` when no response arrived.
    pub status_codes: BTreeMap<String, u64>,
    pub cache_status: BTreeMap<String, u64>,
    pub per_url: Vec<UrlStats>,
}

/// Folds request results as they arrive.
#[derive(Debug, Default)]
struct LoadAccumulator {
    total: u64,
    successful: u64,
    bytes: u64,
    latencies: Vec<f64>,
    ttfbs: Vec<f64>,
    status_codes: BTreeMap<String, u64>,
    cache_status: BTreeMap<String, u64>,
    per_url: HashMap<String, (u64, u64, f64)>,
}

impl LoadAccumulator {
    fn add(&mut self, result: FetchResult) {
        self.total += 1;
        let ok = result.is_success();
        if ok {
            self.successful += 1;
            self.latencies.push(result.total_ms);
            self.ttfbs.push(result.ttfb_ms);
        }
        self.bytes += result.bytes;

        let status = result
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "error".to_string());
        *self.status_codes.entry(status).or_default() += 1;
        if let Some(cache) = result.cache_status {
            *self.cache_status.entry(cache.to_ascii_uppercase()).or_default() += 1;
        }

        let entry = self.per_url.entry(result.url).or_default();
        entry.0 += 1;
        if ok {
            entry.2 += result.total_ms;
        } else {
            entry.1 += 1;
        }
    }

    fn finish(self, url_source: &str, urls: usize, concurrency: usize, elapsed: Duration) -> LoadTestReport {
        let duration_secs = elapsed.as_secs_f64();
        let failed = self.total - self.successful;

        let mut per_url: Vec<UrlStats> = self
            .per_url
            .into_iter()
            .map(|(url, (requests, errors, sum_ms))| {
                let ok = requests - errors;
                UrlStats {
                    url,
                    requests,
                    errors,
                    mean_ms: if ok > 0 { sum_ms / ok as f64 } else { 0.0 },
                }
            })
            .collect();
        per_url.sort_by(|a, b| a.url.cmp(&b.url));

        LoadTestReport {
            generated_at: Utc::now(),
            url_source: url_source.to_string(),
            urls,
            concurrency,
            duration_secs,
            total_requests: self.total,
            successful: self.successful,
            failed,
            success_rate: if self.total > 0 {
                self.successful as f64 / self.total as f64
            } else {
                0.0
            },
            requests_per_sec: if duration_secs > 0.0 {
                self.total as f64 / duration_secs
            } else {
                0.0
            },
            latency_ms: LatencySummary::from_samples(self.latencies),
            ttfb_ms: LatencySummary::from_samples(self.ttfbs),
            bytes: self.bytes,
            status_codes: self.status_codes,
            cache_status: self.cache_status,
            per_url,
        }
    }
}

impl LoadTestReport {
    pub fn to_markdown(&self) -> String {
        let mut md = format!(
            "# Load test\n\n{} requests against {} URLs (from {}) with {} workers in {:.1}s.\n\n",
            self.total_requests, self.urls, self.url_source, self.concurrency, self.duration_secs
        );
        md.push_str(&markdown_table(
            &["Metric", "Value"],
            &[
                vec!["Requests/sec".into(), format!("{:.1}", self.requests_per_sec)],
                vec!["Success rate".into(), format!("{:.1}%", self.success_rate * 100.0)],
                vec!["Failed".into(), self.failed.to_string()],
            ],
        ));

        md.push_str("\n## Latency (ms)\n\n");
        let row = |name: &str, l: &LatencySummary| {
            vec![
                name.to_string(),
                format!("{:.1}", l.min),
                format!("{:.1}", l.mean),
                format!("{:.1}", l.p50),
                format!("{:.1}", l.p90),
                format!("{:.1}", l.p95),
                format!("{:.1}", l.p99),
                format!("{:.1}", l.max),
            ]
        };
        md.push_str(&markdown_table(
            &["", "min", "mean", "p50", "p90", "p95", "p99", "max"],
            &[row("total", &self.latency_ms), row("ttfb", &self.ttfb_ms)],
        ));

        md.push_str("\n## Status codes\n\n");
        let rows: Vec<Vec<String>> = self
            .status_codes
            .iter()
            .map(|(k, v)| vec![k.clone(), v.to_string()])
            .collect();
        md.push_str(&markdown_table(&["Status", "Count"], &rows));

        if !self.cache_status.is_empty() {
            md.push_str("\n## Cache status\n\n");
            let rows: Vec<Vec<String>> = self
                .cache_status
                .iter()
                .map(|(k, v)| vec![k.clone(), v.to_string()])
                .collect();
            md.push_str(&markdown_table(&["Cache", "Count"], &rows));
        }

        md.push_str("\n## Per URL\n\n");
        let rows: Vec<Vec<String>> = self
            .per_url
            .iter()
            .map(|u| {
                vec![
                    u.url.clone(),
                    u.requests.to_string(),
                    u.errors.to_string(),
                    format!("{:.1}", u.mean_ms),
                ]
            })
            .collect();
        md.push_str(&markdown_table(&["URL", "Requests", "Errors", "Mean ms"], &rows));
        md
    }
}

/// Pick at most `limit` URLs spread evenly over `urls`. `0` keeps all.
fn sample_urls(urls: Vec<String>, limit: usize) -> Vec<String> {
    if limit == 0 || urls.len() <= limit {
        return urls;
    }
    let step = urls.len() as f64 / limit as f64;
    (0..limit)
        .map(|i| urls[(i as f64 * step) as usize].clone())
        .collect()
}

/// Successfully warmed URLs, deduplicated in order.
fn warmed_urls(results: &PrewarmResults) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    results
        .results
        .iter()
        .filter(|r| r.is_success())
        .filter(|r| seen.insert(r.url.clone()))
        .map(|r| r.url.clone())
        .collect()
}

async fn target_urls(config: &WarmConfig, stage: &str) -> anyhow::Result<(Vec<String>, &'static str)> {
    let path = report_writer(config).json_path(PREWARM_RESULTS);
    match tokio::fs::read(&path).await {
        Ok(raw) => {
            let results: PrewarmResults = serde_json::from_slice(&raw)
                .with_context(|| format!("parsing {}", path.display()))?;
            let urls = warmed_urls(&results);
            if !urls.is_empty() {
                return Ok((urls, "prewarm"));
            }
            warn!("No successful pre-warm results, building URLs from the source listing");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No pre-warm results, building URLs from the source listing");
        }
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    }

    let base_url = config.require_base_url(stage)?;
    let (_, files) = list_objects(config).await?;
    let mut urls = Vec::with_capacity(files.len() * config.cdn.derivatives.len());
    for file in &files {
        for derivative in &config.cdn.derivatives {
            urls.push(build_url(base_url, derivative, &file.path)?);
        }
    }
    Ok((urls, "listing"))
}

/// Drive `concurrency` workers over `urls` round-robin until the time or
/// request budget runs out, folding results in a single consumer.
async fn run_load(
    client: Arc<WarmClient>,
    urls: Arc<Vec<String>>,
    settings: &LoadTestConfig,
    token: &CancellationToken,
) -> (LoadAccumulator, Duration) {
    let stop = token.child_token();
    let issued = Arc::new(AtomicU64::new(0));
    let (tx, mut rx) = mpsc::channel::<FetchResult>(settings.concurrency.max(1) * 4);

    if settings.duration_secs > 0 {
        let stop = stop.clone();
        let limit = Duration::from_secs(settings.duration_secs);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(limit) => stop.cancel(),
                _ = stop.cancelled() => {}
            }
        });
    }

    let started = Instant::now();
    let mut workers = JoinSet::new();
    for worker in 0..settings.concurrency.max(1) {
        let client = client.clone();
        let urls = urls.clone();
        let issued = issued.clone();
        let stop = stop.clone();
        let tx = tx.clone();
        let max_requests = settings.max_requests;

        workers.spawn(async move {
            loop {
                let n = issued.fetch_add(1, Ordering::Relaxed);
                if max_requests.is_some_and(|max| n >= max) {
                    break;
                }
                let url = &urls[(n % urls.len() as u64) as usize];

                let result = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    result = client.fetch(url, &stop) => result,
                };
                if tx.send(result).await.is_err() {
                    break;
                }
            }
            debug!(worker, "Load worker finished");
        });
    }
    drop(tx);

    let mut acc = LoadAccumulator::default();
    while let Some(result) = rx.recv().await {
        acc.add(result);
    }
    let elapsed = started.elapsed();
    stop.cancel();

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Load worker panicked");
        }
    }
    (acc, elapsed)
}

#[async_trait]
impl Stage<WarmConfig> for LoadTestStage {
    async fn execute(&self, ctx: &StageContext, config: &WarmConfig) -> anyhow::Result<()> {
        let settings = &config.load_test;
        let (urls, url_source) = target_urls(config, &ctx.name).await?;
        let urls = sample_urls(urls, settings.sample_size);
        if urls.is_empty() {
            anyhow::bail!("no URLs to load-test");
        }

        // Retries would hide the latency being measured.
        let client = Arc::new(WarmClient::new(&config.http)?.with_retry_policy(RetryPolicy::none()));

        info!(
            urls = urls.len(),
            source = url_source,
            concurrency = settings.concurrency,
            duration_secs = settings.duration_secs,
            max_requests = ?settings.max_requests,
            "Starting load test"
        );

        let url_count = urls.len();
        let (acc, elapsed) = run_load(client, Arc::new(urls), settings, &ctx.token).await;
        let report = acc.finish(url_source, url_count, settings.concurrency, elapsed);

        report_writer(config)
            .write(LOAD_TEST_REPORT, &report, &report.to_markdown())
            .await?;

        info!(
            requests = report.total_requests,
            rps = report.requests_per_sec,
            p50_ms = report.latency_ms.p50,
            p99_ms = report.latency_ms.p99,
            success_rate = report.success_rate,
            "Load test complete"
        );

        if ctx.token.is_cancelled() {
            anyhow::bail!("load test interrupted");
        }
        Ok(())
    }

    fn output_files(&self, config: &WarmConfig) -> Vec<(String, PathBuf)> {
        report_writer(config).output_files(LOAD_TEST_REPORT)
    }
}
