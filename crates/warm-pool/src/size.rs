//! Size categories and the classifier that assigns them.

use serde::{Deserialize, Serialize};

use crate::PoolError;

const MIB: u64 = 1024 * 1024;

/// Size bucket of a task. Each bucket is served by its own queue and workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeCategory {
    Small,
    Medium,
    Large,
}

impl SizeCategory {
    /// All categories, in ascending size order.
    pub const ALL: [SizeCategory; 3] = [Self::Small, Self::Medium, Self::Large];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Small => 0,
            Self::Medium => 1,
            Self::Large => 2,
        }
    }
}

impl std::fmt::Display for SizeCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upper bounds (inclusive) of the small and medium bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeThresholds {
    pub small_max_bytes: u64,
    pub medium_max_bytes: u64,
}

impl Default for SizeThresholds {
    fn default() -> Self {
        Self {
            small_max_bytes: 5 * MIB,
            medium_max_bytes: 50 * MIB,
        }
    }
}

impl SizeThresholds {
    /// Create thresholds from byte values.
    ///
    /// Fails when the medium bound is below the small bound, since the
    /// medium band would then be empty and misleading.
    pub fn new(small_max_bytes: u64, medium_max_bytes: u64) -> Result<Self, PoolError> {
        if medium_max_bytes < small_max_bytes {
            return Err(PoolError::config(format!(
                "medium threshold ({medium_max_bytes} bytes) is below small threshold ({small_max_bytes} bytes)"
            )));
        }
        Ok(Self {
            small_max_bytes,
            medium_max_bytes,
        })
    }

    /// Create thresholds from MiB values as accepted on the command line.
    pub fn from_mib(small_mib: u64, medium_mib: u64) -> Result<Self, PoolError> {
        Self::new(
            small_mib.saturating_mul(MIB),
            medium_mib.saturating_mul(MIB),
        )
    }

    /// Thresholds that put every object in [`SizeCategory::Small`].
    pub fn uniform() -> Self {
        Self {
            small_max_bytes: u64::MAX,
            medium_max_bytes: u64::MAX,
        }
    }

    /// Map a byte count to its category.
    pub fn classify(&self, size_bytes: u64) -> SizeCategory {
        if size_bytes <= self.small_max_bytes {
            SizeCategory::Small
        } else if size_bytes <= self.medium_max_bytes {
            SizeCategory::Medium
        } else {
            SizeCategory::Large
        }
    }
}

/// Free-function form of [`SizeThresholds::classify`].
pub fn classify(size_bytes: u64, thresholds: &SizeThresholds) -> SizeCategory {
    thresholds.classify(size_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn thresholds() -> SizeThresholds {
        SizeThresholds::new(100, 1_000).unwrap()
    }

    #[test]
    fn test_boundaries_are_inclusive() {
        let t = thresholds();
        assert_eq!(t.classify(0), SizeCategory::Small);
        assert_eq!(t.classify(100), SizeCategory::Small);
        assert_eq!(t.classify(101), SizeCategory::Medium);
        assert_eq!(t.classify(1_000), SizeCategory::Medium);
        assert_eq!(t.classify(1_001), SizeCategory::Large);
        assert_eq!(t.classify(u64::MAX), SizeCategory::Large);
    }

    #[test]
    fn test_from_mib() {
        let t = SizeThresholds::from_mib(1, 10).unwrap();
        assert_eq!(t.small_max_bytes, MIB);
        assert_eq!(t.medium_max_bytes, 10 * MIB);
        assert_eq!(classify(MIB, &t), SizeCategory::Small);
        assert_eq!(classify(MIB + 1, &t), SizeCategory::Medium);
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        assert!(matches!(
            SizeThresholds::new(10, 5),
            Err(PoolError::Config(_))
        ));
    }

    #[test]
    fn test_uniform_is_always_small() {
        let t = SizeThresholds::uniform();
        assert_eq!(t.classify(u64::MAX), SizeCategory::Small);
    }

    #[test]
    fn test_category_display() {
        assert_eq!(SizeCategory::Small.to_string(), "small");
        assert_eq!(SizeCategory::Large.to_string(), "large");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn prop_classify_is_monotonic(
            small in 0u64..10_000,
            extra in 0u64..10_000,
            a in 0u64..50_000,
            b in 0u64..50_000,
        ) {
            let t = SizeThresholds::new(small, small + extra).unwrap();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(t.classify(lo) <= t.classify(hi));
        }

        #[test]
        fn prop_classify_respects_bands(
            small in 0u64..10_000,
            extra in 0u64..10_000,
            size in 0u64..50_000,
        ) {
            let t = SizeThresholds::new(small, small + extra).unwrap();
            let expected = if size <= t.small_max_bytes {
                SizeCategory::Small
            } else if size <= t.medium_max_bytes {
                SizeCategory::Medium
            } else {
                SizeCategory::Large
            };
            prop_assert_eq!(t.classify(size), expected);
        }
    }
}
