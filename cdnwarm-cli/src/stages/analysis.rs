use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;
use warm_pool::{NormalizedPoolConfig, SizeCategory, SizeThresholds};
use warm_workflow::{Stage, StageContext};

use super::{ANALYSIS_REPORT, list_objects, report_writer};
use crate::config::WarmConfig;
use crate::report::markdown_table;
use crate::stats::{SizeStats, format_bytes};

/// Lists the source and describes its size distribution.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnalysisStage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub generated_at: DateTime<Utc>,
    pub source: String,
    pub thresholds: SizeThresholds,
    pub optimize_by_size: bool,
    pub stats: SizeStats,
    /// Worker allocation the size-aware pool would use.
    pub recommended_pool: NormalizedPoolConfig,
    pub notes: Vec<String>,
}

impl AnalysisReport {
    fn notes(stats: &SizeStats, optimize_by_size: bool) -> Vec<String> {
        let mut notes = Vec::new();
        if stats.count == 0 {
            notes.push("No objects matched the source filters.".to_string());
            return notes;
        }

        let large = stats
            .by_category
            .get(&SizeCategory::Large)
            .map(|c| c.total_bytes)
            .unwrap_or(0);
        if !optimize_by_size && large * 2 > stats.total_bytes {
            notes.push(
                "Large objects hold most of the bytes; --optimize-by-size keeps them from \
                 occupying every worker."
                    .to_string(),
            );
        }
        for category in SizeCategory::ALL {
            if stats.by_category.get(&category).is_none_or(|c| c.count == 0) {
                notes.push(format!("No {category} objects: their workers would sit idle."));
            }
        }
        notes
    }

    pub fn to_markdown(&self) -> String {
        let s = &self.stats;
        let mut md = format!(
            "# Source analysis\n\nGenerated {} for `{}`.\n\n",
            self.generated_at.to_rfc3339(),
            self.source
        );

        md.push_str(&markdown_table(
            &["Metric", "Value"],
            &[
                vec!["Objects".into(), s.count.to_string()],
                vec!["Total size".into(), format_bytes(s.total_bytes)],
                vec!["Smallest".into(), format_bytes(s.min_bytes)],
                vec!["Largest".into(), format_bytes(s.max_bytes)],
                vec!["Mean".into(), format_bytes(s.mean_bytes as u64)],
                vec!["p50".into(), format_bytes(s.p50_bytes)],
                vec!["p90".into(), format_bytes(s.p90_bytes)],
                vec!["p99".into(), format_bytes(s.p99_bytes)],
            ],
        ));

        md.push_str(&format!(
            "\n## Size categories\n\nSmall is at most {}, medium at most {}.\n\n",
            format_bytes(self.thresholds.small_max_bytes),
            format_bytes(self.thresholds.medium_max_bytes)
        ));
        let rows: Vec<Vec<String>> = s
            .by_category
            .iter()
            .map(|(category, c)| {
                vec![
                    category.to_string(),
                    c.count.to_string(),
                    format_bytes(c.total_bytes),
                    self.recommended_pool.workers_for(*category).to_string(),
                ]
            })
            .collect();
        md.push_str(&markdown_table(
            &["Category", "Objects", "Bytes", "Recommended workers"],
            &rows,
        ));

        md.push_str("\n## Extensions\n\n");
        let rows: Vec<Vec<String>> = s
            .by_extension
            .iter()
            .map(|(ext, n)| vec![ext.clone(), n.to_string()])
            .collect();
        md.push_str(&markdown_table(&["Extension", "Objects"], &rows));

        md.push_str("\n## Largest objects\n\n");
        let rows: Vec<Vec<String>> = s
            .largest
            .iter()
            .map(|f| vec![f.path.clone(), format_bytes(f.size)])
            .collect();
        md.push_str(&markdown_table(&["Path", "Size"], &rows));

        if !self.notes.is_empty() {
            md.push_str("\n## Notes\n\n");
            for note in &self.notes {
                md.push_str(&format!("- {note}\n"));
            }
        }
        md
    }
}

#[async_trait]
impl Stage<WarmConfig> for AnalysisStage {
    async fn execute(&self, _ctx: &StageContext, config: &WarmConfig) -> anyhow::Result<()> {
        let (_, files) = list_objects(config).await?;

        let thresholds = config.pool.thresholds()?;
        let stats = SizeStats::from_files(&files, &thresholds);
        let recommended_pool = config.pool.pool_config().normalize()?;

        let report = AnalysisReport {
            generated_at: Utc::now(),
            source: config.source.root.clone(),
            thresholds,
            optimize_by_size: config.pool.optimize_by_size,
            notes: AnalysisReport::notes(&stats, config.pool.optimize_by_size),
            stats,
            recommended_pool,
        };

        report_writer(config)
            .write(ANALYSIS_REPORT, &report, &report.to_markdown())
            .await?;

        info!(
            objects = report.stats.count,
            total = %format_bytes(report.stats.total_bytes),
            "Analysis complete"
        );
        Ok(())
    }

    fn output_files(&self, config: &WarmConfig) -> Vec<(String, PathBuf)> {
        report_writer(config).output_files(ANALYSIS_REPORT)
    }
}
