use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::info;
use warm_pool::SizeCategory;
use warm_workflow::{Stage, StageContext};

use super::prewarm::PrewarmResults;
use super::{ERROR_REPORT, PREWARM_RESULTS, report_writer};
use crate::config::WarmConfig;
use crate::report::markdown_table;

/// Objects listed in [`ErrorReport::top_failing`].
const TOP_FAILING: usize = 20;

/// Groups the failures recorded by the pre-warm stage.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorsStage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailingObject {
    pub path: String,
    pub failures: usize,
    pub last_error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub generated_at: DateTime<Utc>,
    pub total_requests: usize,
    pub failed: usize,
    pub success_rate: f64,
    /// Keyed by HTTP status, or `no response`.
    pub by_status: BTreeMap<String, usize>,
    pub by_derivative: BTreeMap<String, usize>,
    pub by_category: BTreeMap<SizeCategory, usize>,
    pub by_error: BTreeMap<String, usize>,
    pub top_failing: Vec<FailingObject>,
}

/// Group the failed requests in `results`.
pub fn analyze_failures(results: &PrewarmResults) -> ErrorReport {
    let total_requests = results.results.len();
    let mut report = ErrorReport {
        generated_at: Utc::now(),
        total_requests,
        failed: 0,
        success_rate: 0.0,
        by_status: BTreeMap::new(),
        by_derivative: BTreeMap::new(),
        by_category: BTreeMap::new(),
        by_error: BTreeMap::new(),
        top_failing: Vec::new(),
    };

    let mut per_object: HashMap<&str, FailingObject> = HashMap::new();
    for record in results.results.iter().filter(|r| !r.is_success()) {
        report.failed += 1;

        let status = record
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "no response".to_string());
        *report.by_status.entry(status).or_default() += 1;
        *report.by_derivative.entry(record.derivative.clone()).or_default() += 1;
        *report.by_category.entry(record.category).or_default() += 1;

        let error = record.error.clone().unwrap_or_else(|| "unknown error".to_string());
        *report.by_error.entry(error.clone()).or_default() += 1;

        let entry = per_object
            .entry(record.path.as_str())
            .or_insert_with(|| FailingObject {
                path: record.path.clone(),
                failures: 0,
                last_error: String::new(),
            });
        entry.failures += 1;
        entry.last_error = error;
    }

    let mut top: Vec<FailingObject> = per_object.into_values().collect();
    top.sort_by(|a, b| b.failures.cmp(&a.failures).then_with(|| a.path.cmp(&b.path)));
    top.truncate(TOP_FAILING);
    report.top_failing = top;

    if total_requests > 0 {
        report.success_rate = (total_requests - report.failed) as f64 / total_requests as f64;
    }
    report
}

impl ErrorReport {
    pub fn to_markdown(&self) -> String {
        let mut md = format!(
            "# Pre-warm errors\n\n{} of {} requests failed (success rate {:.1}%).\n",
            self.failed,
            self.total_requests,
            self.success_rate * 100.0
        );
        if self.failed == 0 {
            return md;
        }

        let counts = |map: &BTreeMap<String, usize>| -> Vec<Vec<String>> {
            let mut rows: Vec<_> = map.iter().collect();
            rows.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
            rows.into_iter()
                .map(|(k, v)| vec![k.clone(), v.to_string()])
                .collect()
        };

        md.push_str("\n## By status\n\n");
        md.push_str(&markdown_table(&["Status", "Failures"], &counts(&self.by_status)));
        md.push_str("\n## By derivative\n\n");
        md.push_str(&markdown_table(&["Derivative", "Failures"], &counts(&self.by_derivative)));
        md.push_str("\n## By size category\n\n");
        let rows: Vec<Vec<String>> = self
            .by_category
            .iter()
            .map(|(c, n)| vec![c.to_string(), n.to_string()])
            .collect();
        md.push_str(&markdown_table(&["Category", "Failures"], &rows));
        md.push_str("\n## By error\n\n");
        md.push_str(&markdown_table(&["Error", "Failures"], &counts(&self.by_error)));

        md.push_str("\n## Most frequently failing objects\n\n");
        let rows: Vec<Vec<String>> = self
            .top_failing
            .iter()
            .map(|o| vec![o.path.clone(), o.failures.to_string(), o.last_error.clone()])
            .collect();
        md.push_str(&markdown_table(&["Path", "Failures", "Last error"], &rows));
        md
    }
}

#[async_trait]
impl Stage<WarmConfig> for ErrorsStage {
    async fn execute(&self, _ctx: &StageContext, config: &WarmConfig) -> anyhow::Result<()> {
        let writer = report_writer(config);
        let path = writer.json_path(PREWARM_RESULTS);
        let raw = tokio::fs::read(&path).await.with_context(|| {
            format!(
                "pre-warm results not found at {}; run the prewarm stage first",
                path.display()
            )
        })?;
        let results: PrewarmResults = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;

        let report = analyze_failures(&results);
        writer
            .write(ERROR_REPORT, &report, &report.to_markdown())
            .await?;

        info!(
            failed = report.failed,
            total = report.total_requests,
            distinct_errors = report.by_error.len(),
            "Error analysis complete"
        );
        Ok(())
    }

    fn output_files(&self, config: &WarmConfig) -> Vec<(String, PathBuf)> {
        report_writer(config).output_files(ERROR_REPORT)
    }
}
