//! The five workflow stages and how they are assembled.

mod analysis;
mod errors;
mod loadtest;
mod optimize;
mod prewarm;

pub use analysis::{AnalysisReport, AnalysisStage};
pub use errors::{ErrorReport, ErrorsStage, analyze_failures};
pub use loadtest::{LoadTestReport, LoadTestStage};
pub use optimize::{OptimizeRecord, OptimizeReport, OptimizeStage, select_candidates};
pub use prewarm::{PrewarmRecord, PrewarmResults, PrewarmStage, PrewarmSummary, build_url};

use anyhow::Context;
use indicatif::ProgressStyle;
use std::sync::Arc;
use tracing::{Span, info_span};
use tracing_indicatif::span_ext::IndicatifSpanExt;
use warm_workflow::WorkflowStage;

use crate::config::WarmConfig;
use crate::report::ReportWriter;
use crate::storage::{FileInfo, ObjectStore, list_source, open_store};

pub const ANALYSIS: &str = "analysis";
pub const PREWARM: &str = "prewarm";
pub const ERRORS: &str = "errors";
pub const LOADTEST: &str = "loadtest";
pub const OPTIMIZE: &str = "optimize";

/// Stage names in execution order.
pub const STAGE_NAMES: [&str; 5] = [ANALYSIS, PREWARM, ERRORS, LOADTEST, OPTIMIZE];

// Report base names under `output_dir`.
pub(crate) const ANALYSIS_REPORT: &str = "analysis";
pub(crate) const PREWARM_RESULTS: &str = "prewarm_results";
pub(crate) const PREWARM_REPORT: &str = "prewarm";
pub(crate) const ERROR_REPORT: &str = "error_report";
pub(crate) const LOAD_TEST_REPORT: &str = "load_test";
pub(crate) const OPTIMIZE_REPORT: &str = "optimization";

/// Stages switched off with `--skip-*`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipFlags {
    pub analysis: bool,
    pub prewarm: bool,
    pub errors: bool,
    pub loadtest: bool,
    pub optimize: bool,
}

impl SkipFlags {
    fn skips(&self, name: &str) -> bool {
        match name {
            ANALYSIS => self.analysis,
            PREWARM => self.prewarm,
            ERRORS => self.errors,
            LOADTEST => self.loadtest,
            OPTIMIZE => self.optimize,
            _ => false,
        }
    }
}

/// A single stage by name, enabled.
pub fn stage_by_name(name: &str) -> Option<WorkflowStage<WarmConfig>> {
    let stage = match name {
        ANALYSIS => WorkflowStage::new(ANALYSIS, "Analyze source object sizes", AnalysisStage),
        PREWARM => WorkflowStage::new(PREWARM, "Request every object through the CDN", PrewarmStage),
        ERRORS => WorkflowStage::new(ERRORS, "Summarize pre-warm failures", ErrorsStage),
        LOADTEST => WorkflowStage::new(LOADTEST, "Measure CDN latency under load", LoadTestStage),
        OPTIMIZE => WorkflowStage::new(OPTIMIZE, "Re-encode large videos", OptimizeStage),
        _ => return None,
    };
    Some(stage)
}

/// The full ordered workflow with `skip` applied.
pub fn build_workflow(skip: &SkipFlags) -> Vec<WorkflowStage<WarmConfig>> {
    STAGE_NAMES
        .iter()
        .filter_map(|name| stage_by_name(name))
        .map(|stage| {
            let enabled = !skip.skips(&stage.name);
            stage.enabled(enabled)
        })
        .collect()
}

pub(crate) fn report_writer(config: &WarmConfig) -> ReportWriter {
    ReportWriter::new(&config.output_dir, config.report.format)
}

/// Open the configured source and list it.
pub(crate) async fn list_objects(
    config: &WarmConfig,
) -> anyhow::Result<(Arc<dyn ObjectStore>, Vec<FileInfo>)> {
    let store = open_store(&config.source);
    let files = list_source(store.as_ref(), &config.source, Some(&config.output_dir))
        .await
        .with_context(|| format!("listing {} source '{}'", store.name(), config.source.root))?;
    Ok((store, files))
}

/// A span that renders as a progress bar while instrumented work runs.
pub(crate) fn progress_span(stage: &str, total: u64) -> Span {
    let span = info_span!("progress", stage);
    if let Ok(style) = ProgressStyle::with_template(
        "{span_child_prefix}{spinner:.green} {msg} [{bar:30.green/white}] {pos}/{len} ({eta})",
    ) {
        span.pb_set_style(&style.progress_chars("=> "));
    }
    span.pb_set_length(total);
    span.pb_set_message(stage);
    span
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_order_and_skips() {
        let skip = SkipFlags {
            errors: true,
            optimize: true,
            ..SkipFlags::default()
        };
        let stages = build_workflow(&skip);
        let names: Vec<_> = stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, STAGE_NAMES);

        let enabled: Vec<_> = stages.iter().map(|s| s.enabled).collect();
        assert_eq!(enabled, vec![true, true, false, true, false]);
    }

    #[test]
    fn test_stage_by_name() {
        assert!(stage_by_name("loadtest").is_some());
        assert!(stage_by_name("nope").is_none());
    }
}
