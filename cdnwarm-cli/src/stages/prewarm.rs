use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, info, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;
use url::Url;
use warm_pool::{BoxError, SizeCategory, Task, TaskOutcome, WorkerPool};
use warm_workflow::{Stage, StageContext};

use super::{PREWARM_REPORT, PREWARM_RESULTS, list_objects, progress_span, report_writer};
use crate::config::{Derivative, WarmConfig};
use crate::dispatch::{self, DispatchSummary};
use crate::http::{FetchResult, WarmClient};
use crate::report::markdown_table;
use crate::stats::format_bytes;

/// Failures listed individually in the Markdown report.
const MARKDOWN_FAILURE_LIMIT: usize = 50;

/// Requests every (object, derivative) pair through the CDN.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrewarmStage;

/// One warm-up request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrewarmRecord {
    pub path: String,
    pub derivative: String,
    pub url: String,
    pub size_bytes: u64,
    pub category: SizeCategory,
    pub status: Option<u16>,
    pub bytes: u64,
    pub ttfb_ms: f64,
    pub total_ms: f64,
    pub cache_status: Option<String>,
    pub attempts: u32,
    pub error: Option<String>,
    #[serde(default)]
    pub timed_out: bool,
}

impl PrewarmRecord {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status.is_some_and(|s| (200..400).contains(&s))
    }

    fn is_cache_hit(&self) -> Option<bool> {
        let status = self.cache_status.as_deref()?.to_ascii_uppercase();
        Some(status.contains("HIT"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts {
    pub total: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrewarmSummary {
    pub objects: usize,
    pub requests: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub not_submitted: usize,
    /// Requests still running when an interrupted run stopped waiting.
    #[serde(default)]
    pub abandoned: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub bytes: u64,
    pub duration_secs: f64,
    pub by_category: BTreeMap<SizeCategory, CategoryCounts>,
}

impl PrewarmSummary {
    fn from_records(records: &[PrewarmRecord], dispatch: &DispatchSummary) -> Self {
        let mut summary = Self {
            requests: records.len(),
            timed_out: dispatch.timed_out,
            not_submitted: dispatch.not_submitted,
            abandoned: dispatch.abandoned,
            ..Self::default()
        };
        let mut objects = std::collections::HashSet::new();
        for record in records {
            objects.insert(record.path.as_str());
            let counts = summary.by_category.entry(record.category).or_default();
            counts.total += 1;
            if record.is_success() {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
                counts.failed += 1;
            }
            match record.is_cache_hit() {
                Some(true) => summary.cache_hits += 1,
                Some(false) => summary.cache_misses += 1,
                None => {}
            }
            summary.bytes += record.bytes;
        }
        summary.objects = objects.len();
        summary
    }
}

/// Contents of `prewarm_results.json`, read back by later stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrewarmResults {
    pub generated_at: DateTime<Utc>,
    pub base_url: String,
    pub summary: PrewarmSummary,
    pub results: Vec<PrewarmRecord>,
}

impl PrewarmResults {
    pub fn to_markdown(&self) -> String {
        let s = &self.summary;
        let mut md = format!(
            "# Pre-warm results\n\nGenerated {} against `{}`.\n\n",
            self.generated_at.to_rfc3339(),
            self.base_url
        );
        md.push_str(&markdown_table(
            &["Metric", "Value"],
            &[
                vec!["Objects".into(), s.objects.to_string()],
                vec!["Requests".into(), s.requests.to_string()],
                vec!["Succeeded".into(), s.succeeded.to_string()],
                vec!["Failed".into(), s.failed.to_string()],
                vec!["Timed out".into(), s.timed_out.to_string()],
                vec!["Not submitted".into(), s.not_submitted.to_string()],
                vec!["Abandoned".into(), s.abandoned.to_string()],
                vec!["Cache hits".into(), s.cache_hits.to_string()],
                vec!["Cache misses".into(), s.cache_misses.to_string()],
                vec!["Transferred".into(), format_bytes(s.bytes)],
                vec!["Duration".into(), format!("{:.1}s", s.duration_secs)],
            ],
        ));

        md.push_str("\n## By size category\n\n");
        let rows: Vec<Vec<String>> = s
            .by_category
            .iter()
            .map(|(c, n)| vec![c.to_string(), n.total.to_string(), n.failed.to_string()])
            .collect();
        md.push_str(&markdown_table(&["Category", "Requests", "Failed"], &rows));

        let failures: Vec<&PrewarmRecord> =
            self.results.iter().filter(|r| !r.is_success()).collect();
        if !failures.is_empty() {
            md.push_str(&format!("\n## Failures ({})\n\n", failures.len()));
            let rows: Vec<Vec<String>> = failures
                .iter()
                .take(MARKDOWN_FAILURE_LIMIT)
                .map(|r| {
                    vec![
                        r.url.clone(),
                        r.status.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                        r.error.clone().unwrap_or_default(),
                    ]
                })
                .collect();
            md.push_str(&markdown_table(&["URL", "Status", "Error"], &rows));
            if failures.len() > MARKDOWN_FAILURE_LIMIT {
                md.push_str(&format!(
                    "\n{} more in `{PREWARM_RESULTS}.json`.\n",
                    failures.len() - MARKDOWN_FAILURE_LIMIT
                ));
            }
        }
        md
    }
}

/// CDN URL of `path` under `derivative`.
///
/// Path segments are percent-encoded; an existing path on `base_url` is kept.
pub fn build_url(base_url: &str, derivative: &Derivative, path: &str) -> anyhow::Result<String> {
    let mut url = Url::parse(base_url).with_context(|| format!("invalid base URL '{base_url}'"))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| anyhow::anyhow!("base URL '{base_url}' cannot carry a path"))?;
        segments.pop_if_empty();
        if let Some(prefix) = &derivative.path_prefix {
            segments.extend(prefix.split('/').filter(|s| !s.is_empty()));
        }
        segments.extend(path.split('/').filter(|s| !s.is_empty()));
    }
    if let Some(query) = derivative.query.as_deref().filter(|q| !q.is_empty()) {
        url.set_query(Some(query.trim_start_matches('?')));
    }
    Ok(url.into())
}

/// What a task carries besides its URL.
struct RequestMeta {
    path: String,
    derivative: String,
    url: String,
    size_bytes: u64,
}

fn to_record(meta: RequestMeta, outcome: TaskOutcome<FetchResult>) -> PrewarmRecord {
    let mut record = PrewarmRecord {
        path: meta.path,
        derivative: meta.derivative,
        url: meta.url,
        size_bytes: meta.size_bytes,
        category: outcome.category,
        status: None,
        bytes: 0,
        ttfb_ms: 0.0,
        total_ms: outcome.elapsed.as_secs_f64() * 1000.0,
        cache_status: None,
        attempts: 0,
        error: None,
        timed_out: outcome.timed_out,
    };
    match outcome.result {
        Ok(fetched) => {
            record.status = fetched.status;
            record.bytes = fetched.bytes;
            record.ttfb_ms = fetched.ttfb_ms;
            record.total_ms = fetched.total_ms;
            record.cache_status = fetched.cache_status;
            record.attempts = fetched.attempts;
            record.error = fetched.error;
        }
        Err(e) => record.error = Some(e.to_string()),
    }
    record
}

#[async_trait]
impl Stage<WarmConfig> for PrewarmStage {
    async fn execute(&self, ctx: &StageContext, config: &WarmConfig) -> anyhow::Result<()> {
        let base_url = config.require_base_url(&ctx.name)?.to_string();
        let (_, files) = list_objects(config).await?;
        if files.is_empty() {
            anyhow::bail!("no objects matched the source filters");
        }

        let client = Arc::new(WarmClient::new(&config.http)?);
        let (thresholds, pool_config) = config.pool.dispatch_plan()?;
        let pool: WorkerPool<FetchResult> =
            WorkerPool::new(pool_config)?.with_cancellation(&ctx.token);

        let mut meta = HashMap::new();
        let mut tasks = Vec::with_capacity(files.len() * config.cdn.derivatives.len());
        for file in &files {
            for derivative in &config.cdn.derivatives {
                let url = build_url(&base_url, derivative, &file.path)?;
                let id = tasks.len().to_string();
                let client = client.clone();
                tasks.push(Task::new(
                    id.clone(),
                    file.size,
                    &thresholds,
                    url.clone(),
                    move |url, task_ctx| async move {
                        Ok::<_, BoxError>(client.fetch(&url, &task_ctx.token).await)
                    },
                ));
                meta.insert(
                    id,
                    RequestMeta {
                        path: file.path.clone(),
                        derivative: derivative.name.clone(),
                        url,
                        size_bytes: file.size,
                    },
                );
            }
        }

        info!(
            objects = files.len(),
            requests = tasks.len(),
            derivatives = config.cdn.derivatives.len(),
            optimize_by_size = config.pool.optimize_by_size,
            "Starting pre-warm"
        );

        let started = Instant::now();
        let span = progress_span(&ctx.name, tasks.len() as u64);
        pool.start()?;

        let mut records = Vec::with_capacity(tasks.len());
        let dispatch_summary = dispatch::run_all(&pool, tasks, &ctx.token, |outcome| {
            if let Some(m) = meta.remove(&outcome.id) {
                records.push(to_record(m, outcome));
            }
            span.pb_inc(1);
        })
        .instrument(span.clone())
        .await;
        pool.shutdown().await;

        records.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.derivative.cmp(&b.derivative)));

        let mut summary = PrewarmSummary::from_records(&records, &dispatch_summary);
        summary.duration_secs = started.elapsed().as_secs_f64();

        let results = PrewarmResults {
            generated_at: Utc::now(),
            base_url,
            summary,
            results: records,
        };

        let writer = report_writer(config);
        writer.write_json(PREWARM_RESULTS, &results).await?;
        if config.report.format.markdown() {
            writer
                .write_markdown(PREWARM_REPORT, &results.to_markdown())
                .await?;
        }

        let s = &results.summary;
        info!(
            succeeded = s.succeeded,
            failed = s.failed,
            timed_out = s.timed_out,
            cache_hits = s.cache_hits,
            duration_secs = s.duration_secs,
            "Pre-warm complete"
        );

        if ctx.token.is_cancelled() {
            anyhow::bail!("pre-warm interrupted after {} requests", s.requests);
        }
        if s.succeeded == 0 {
            anyhow::bail!("all {} pre-warm requests failed", s.requests);
        }
        if s.failed > 0 {
            warn!(failed = s.failed, "Some pre-warm requests failed, see the errors stage");
        }
        Ok(())
    }

    fn output_files(&self, config: &WarmConfig) -> Vec<(String, PathBuf)> {
        let writer = report_writer(config);
        let mut files = vec![(
            format!("{PREWARM_RESULTS}.json"),
            writer.json_path(PREWARM_RESULTS),
        )];
        if config.report.format.markdown() {
            files.push((format!("{PREWARM_REPORT}.md"), writer.markdown_path(PREWARM_REPORT)));
        }
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use warm_pool::TaskError;

    fn derivative(prefix: Option<&str>, query: Option<&str>) -> Derivative {
        Derivative {
            name: "d".into(),
            path_prefix: prefix.map(Into::into),
            query: query.map(Into::into),
        }
    }

    #[test]
    fn test_build_url_encodes_segments() {
        let url = build_url("https://cdn.example.com", &Derivative::original(), "a b/c#1.jpg").unwrap();
        assert_eq!(url, "https://cdn.example.com/a%20b/c%231.jpg");
    }

    #[test]
    fn test_build_url_keeps_base_path_and_adds_derivative() {
        let url = build_url(
            "https://cdn.example.com/media/",
            &derivative(Some("/thumbs/200/"), Some("?w=200&fmt=webp")),
            "/x.jpg",
        )
        .unwrap();
        assert_eq!(url, "https://cdn.example.com/media/thumbs/200/x.jpg?w=200&fmt=webp");
    }

    #[test]
    fn test_build_url_rejects_bad_base() {
        assert!(build_url("not a url", &Derivative::original(), "x").is_err());
        assert!(build_url("mailto:ops@example.com", &Derivative::original(), "x").is_err());
    }

    fn meta() -> RequestMeta {
        RequestMeta {
            path: "a.jpg".into(),
            derivative: "original".into(),
            url: "https://cdn/a.jpg".into(),
            size_bytes: 10,
        }
    }

    #[test]
    fn test_to_record_from_task_error() {
        let outcome = TaskOutcome::<FetchResult> {
            id: "0".into(),
            category: SizeCategory::Small,
            result: Err(TaskError::Panicked("boom".into())),
            elapsed: Duration::from_millis(5),
            timed_out: false,
        };
        let record = to_record(meta(), outcome);
        assert!(!record.is_success());
        assert!(record.error.unwrap().contains("boom"));
    }

    #[test]
    fn test_summary_counts() {
        let ok = PrewarmRecord {
            path: "a.jpg".into(),
            derivative: "original".into(),
            url: "u".into(),
            size_bytes: 1,
            category: SizeCategory::Small,
            status: Some(200),
            bytes: 10,
            ttfb_ms: 1.0,
            total_ms: 2.0,
            cache_status: Some("HIT".into()),
            attempts: 1,
            error: None,
            timed_out: false,
        };
        let miss = PrewarmRecord {
            derivative: "thumb".into(),
            cache_status: Some("MISS".into()),
            ..ok.clone()
        };
        let failed = PrewarmRecord {
            path: "b.mp4".into(),
            category: SizeCategory::Large,
            status: Some(404),
            error: Some("HTTP 404".into()),
            cache_status: None,
            ..ok.clone()
        };
        let summary =
            PrewarmSummary::from_records(&[ok, miss, failed], &DispatchSummary::default());
        assert_eq!(summary.objects, 2);
        assert_eq!((summary.succeeded, summary.failed), (2, 1));
        assert_eq!((summary.cache_hits, summary.cache_misses), (1, 1));
        assert_eq!(summary.by_category[&SizeCategory::Large].failed, 1);
        assert_eq!(summary.bytes, 30);
    }
}
