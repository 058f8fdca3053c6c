//! Summary statistics shared by the reports.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use warm_pool::{SizeCategory, SizeThresholds};

use crate::storage::FileInfo;

/// Nearest-rank percentile of an ascending slice. `p` is in `0..=100`.
pub fn percentile<T: Copy>(sorted: &[T], p: f64) -> Option<T> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

/// Latency distribution in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: usize,
    pub min: f64,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

impl LatencySummary {
    pub fn from_samples(mut samples: Vec<f64>) -> Self {
        samples.retain(|s| s.is_finite());
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_by(|a, b| a.total_cmp(b));

        let pct = |p| percentile(&samples, p).unwrap_or_default();
        Self {
            count: samples.len(),
            min: samples[0],
            mean: samples.iter().sum::<f64>() / samples.len() as f64,
            p50: pct(50.0),
            p90: pct(90.0),
            p95: pct(95.0),
            p99: pct(99.0),
            max: samples[samples.len() - 1],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub count: usize,
    pub total_bytes: u64,
}

/// Size distribution of a listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SizeStats {
    pub count: usize,
    pub total_bytes: u64,
    pub min_bytes: u64,
    pub max_bytes: u64,
    pub mean_bytes: f64,
    pub p50_bytes: u64,
    pub p90_bytes: u64,
    pub p99_bytes: u64,
    pub by_category: BTreeMap<SizeCategory, CategoryStats>,
    pub by_extension: BTreeMap<String, usize>,
    pub largest: Vec<FileInfo>,
}

/// Number of entries kept in [`SizeStats::largest`].
pub const LARGEST_FILES: usize = 10;

impl SizeStats {
    pub fn from_files(files: &[FileInfo], thresholds: &SizeThresholds) -> Self {
        if files.is_empty() {
            return Self::default();
        }

        let mut sizes: Vec<u64> = files.iter().map(|f| f.size).collect();
        sizes.sort_unstable();
        let total_bytes: u64 = sizes.iter().sum();

        let mut by_category: BTreeMap<SizeCategory, CategoryStats> = SizeCategory::ALL
            .into_iter()
            .map(|c| (c, CategoryStats::default()))
            .collect();
        let mut by_extension = BTreeMap::new();
        for file in files {
            let entry = by_category.entry(thresholds.classify(file.size)).or_default();
            entry.count += 1;
            entry.total_bytes += file.size;

            let ext = file.extension().unwrap_or_else(|| "(none)".to_string());
            *by_extension.entry(ext).or_insert(0) += 1;
        }

        let mut largest = files.to_vec();
        largest.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.path.cmp(&b.path)));
        largest.truncate(LARGEST_FILES);

        Self {
            count: files.len(),
            total_bytes,
            min_bytes: sizes[0],
            max_bytes: sizes[sizes.len() - 1],
            mean_bytes: total_bytes as f64 / files.len() as f64,
            p50_bytes: percentile(&sizes, 50.0).unwrap_or_default(),
            p90_bytes: percentile(&sizes, 90.0).unwrap_or_default(),
            p99_bytes: percentile(&sizes, 99.0).unwrap_or_default(),
            by_category,
            by_extension,
            largest,
        }
    }
}

/// Human-readable byte count (`1.5 MiB`).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_nearest_rank() {
        let data: Vec<u32> = (1..=100).collect();
        assert_eq!(percentile(&data, 50.0), Some(50));
        assert_eq!(percentile(&data, 99.0), Some(99));
        assert_eq!(percentile(&data, 100.0), Some(100));
        assert_eq!(percentile(&data, 0.0), Some(1));
        assert_eq!(percentile::<u32>(&[], 50.0), None);
        assert_eq!(percentile(&[7], 90.0), Some(7));
    }

    #[test]
    fn test_latency_summary() {
        let summary = LatencySummary::from_samples(vec![40.0, 10.0, 30.0, 20.0, f64::NAN]);
        assert_eq!(summary.count, 4);
        assert_eq!(summary.min, 10.0);
        assert_eq!(summary.max, 40.0);
        assert_eq!(summary.mean, 25.0);
        assert_eq!(summary.p50, 20.0);
        assert_eq!(LatencySummary::from_samples(Vec::new()), LatencySummary::default());
    }

    #[test]
    fn test_size_stats() {
        let thresholds = SizeThresholds::new(100, 1000).unwrap();
        let files = vec![
            FileInfo::new("a.jpg", 50),
            FileInfo::new("b.jpg", 100),
            FileInfo::new("c.mp4", 500),
            FileInfo::new("d.mp4", 5000),
            FileInfo::new("README", 10),
        ];
        let stats = SizeStats::from_files(&files, &thresholds);

        assert_eq!(stats.count, 5);
        assert_eq!(stats.total_bytes, 5660);
        assert_eq!((stats.min_bytes, stats.max_bytes), (10, 5000));
        assert_eq!(stats.by_category[&SizeCategory::Small].count, 3);
        assert_eq!(stats.by_category[&SizeCategory::Medium].count, 1);
        assert_eq!(stats.by_category[&SizeCategory::Large].total_bytes, 5000);
        assert_eq!(stats.by_extension["jpg"], 2);
        assert_eq!(stats.by_extension["(none)"], 1);
        assert_eq!(stats.largest[0].path, "d.mp4");
        assert_eq!(stats.p50_bytes, 100);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }
}
