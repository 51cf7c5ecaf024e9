//! Mergeable duration histogram
//!
//! Log-linear buckets: values below 128 get an exact bucket each, larger
//! values keep their top 7 significant bits. Every bucket therefore spans at
//! most 1/64 of its lower bound, and the whole `u64` range fits in
//! [`MAX_BUCKETS`] buckets, so memory is bounded no matter how many samples
//! are recorded or how many histograms are merged together.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

const SUB_BUCKET_BITS: u32 = 7;
const SUB_BUCKET_COUNT: u64 = 1 << SUB_BUCKET_BITS;
const SUB_BUCKET_HALF: u64 = SUB_BUCKET_COUNT / 2;

/// Upper bound on the number of distinct buckets a histogram can hold
pub const MAX_BUCKETS: usize = 3776;

/// Histogram of nanosecond durations with bounded relative error
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "HistogramRepr", into = "HistogramRepr")]
pub struct DurationHistogram {
    /// Sparse bucket counts keyed by bucket index
    counts: BTreeMap<u16, u64>,
    total_count: u64,
    min: Option<u64>,
    max: Option<u64>,
}

/// Wire form: `(bucket index, count)` pairs, ascending.
///
/// Pairs rather than a map keep the encoding readable inside internally
/// tagged enums, where map keys are buffered as strings.
#[derive(Serialize, Deserialize)]
struct HistogramRepr {
    #[serde(default)]
    buckets: Vec<(u16, u64)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    min: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max: Option<u64>,
}

impl From<DurationHistogram> for HistogramRepr {
    fn from(histogram: DurationHistogram) -> Self {
        Self {
            buckets: histogram.counts.into_iter().collect(),
            min: histogram.min,
            max: histogram.max,
        }
    }
}

impl TryFrom<HistogramRepr> for DurationHistogram {
    type Error = String;

    fn try_from(repr: HistogramRepr) -> std::result::Result<Self, Self::Error> {
        let mut histogram = Self::new();
        for (index, count) in repr.buckets {
            if usize::from(index) >= MAX_BUCKETS {
                return Err(format!("histogram bucket index {index} out of range"));
            }
            if count == 0 {
                continue;
            }
            let slot = histogram.counts.entry(index).or_insert(0);
            *slot = slot.saturating_add(count);
            histogram.total_count = histogram.total_count.saturating_add(count);
        }

        let (Some(&first), Some(&last)) =
            (histogram.counts.keys().next(), histogram.counts.keys().next_back())
        else {
            return Ok(histogram);
        };
        // extremes must lie inside the outermost buckets
        let (first_lower, first_upper) = bucket_bounds(first);
        let (last_lower, last_upper) = bucket_bounds(last);
        let min = repr
            .min
            .map_or(first_lower, |min| min.clamp(first_lower, first_upper));
        let max = repr
            .max
            .map_or(last_upper, |max| max.clamp(last_lower, last_upper));
        histogram.min = Some(min);
        histogram.max = Some(max.max(min));
        Ok(histogram)
    }
}

impl DurationHistogram {
    /// Create an empty histogram
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a histogram from raw duration samples
    pub fn from_values(values: impl IntoIterator<Item = u64>) -> Self {
        let mut histogram = Self::new();
        for value in values {
            histogram.add(value);
        }
        histogram
    }

    /// Record a single duration
    pub fn add(&mut self, value: u64) {
        self.add_count(value, 1);
    }

    /// Record `count` occurrences of the same duration
    pub fn add_count(&mut self, value: u64, count: u64) {
        if count == 0 {
            return;
        }
        let slot = self.counts.entry(bucket_index(value)).or_insert(0);
        *slot = slot.saturating_add(count);
        self.total_count = self.total_count.saturating_add(count);
        self.min = Some(self.min.map_or(value, |min| min.min(value)));
        self.max = Some(self.max.map_or(value, |max| max.max(value)));
    }

    /// Fold another histogram into this one
    pub fn merge(&mut self, other: &DurationHistogram) {
        for (&index, &count) in &other.counts {
            let slot = self.counts.entry(index).or_insert(0);
            *slot = slot.saturating_add(count);
        }
        self.total_count = self.total_count.saturating_add(other.total_count);
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    /// Number of recorded samples
    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.total_count == 0
    }

    /// Number of non-empty buckets
    pub fn bucket_count(&self) -> usize {
        self.counts.len()
    }

    /// Smallest recorded value
    pub fn min(&self) -> Option<u64> {
        self.min
    }

    /// Largest recorded value
    pub fn max(&self) -> Option<u64> {
        self.max
    }

    /// Value at the given percentile (0 to 100).
    ///
    /// Returns the upper bound of the bucket holding the requested rank,
    /// clamped to the observed min/max. An empty histogram returns 0.
    pub fn value_at_percentile(&self, percentile: f64) -> u64 {
        let (Some(min), Some(max)) = (self.min, self.max) else {
            return 0;
        };
        if self.total_count == 0 {
            return max;
        }
        let percentile = percentile.clamp(0.0, 100.0);
        if percentile == 0.0 {
            return min;
        }

        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let rank = ((percentile / 100.0) * self.total_count as f64).ceil() as u64;
        let rank = rank.clamp(1, self.total_count);

        let mut seen: u64 = 0;
        for (&index, &count) in &self.counts {
            seen = seen.saturating_add(count);
            if seen >= rank {
                let (_, upper) = bucket_bounds(index);
                return upper.clamp(min, max);
            }
        }
        max
    }
}

fn bucket_index(value: u64) -> u16 {
    let index = if value < SUB_BUCKET_COUNT {
        value
    } else {
        let msb = 63 - value.leading_zeros();
        let shift = msb - (SUB_BUCKET_BITS - 1);
        u64::from(shift) * SUB_BUCKET_HALF + (value >> shift)
    };
    // at most MAX_BUCKETS - 1
    #[allow(clippy::cast_possible_truncation)]
    let index = index as u16;
    index
}

/// Inclusive value range covered by a bucket
fn bucket_bounds(index: u16) -> (u64, u64) {
    let index = u64::from(index);
    if index < SUB_BUCKET_COUNT {
        return (index, index);
    }
    let shift = index / SUB_BUCKET_HALF - 1;
    let mantissa = index - shift * SUB_BUCKET_HALF;
    let lower = mantissa << shift;
    (lower, lower + ((1u64 << shift) - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_single_value_is_exact() {
        let histogram = DurationHistogram::from_values([1_000_000]);
        assert_eq!(histogram.value_at_percentile(95.0), 1_000_000);
        assert_eq!(histogram.value_at_percentile(0.0), 1_000_000);
        assert_eq!(histogram.value_at_percentile(100.0), 1_000_000);
    }

    #[test]
    fn test_value_just_below_threshold_stays_below() {
        let histogram = DurationHistogram::from_values([999_000]);
        assert!(histogram.value_at_percentile(95.0) < 1_000_000);
    }

    #[test]
    fn test_empty_histogram() {
        let histogram = DurationHistogram::new();
        assert!(histogram.is_empty());
        assert_eq!(histogram.value_at_percentile(50.0), 0);
    }

    #[test]
    fn test_bucket_bounds_are_contiguous() {
        let mut expected_lower = 0u64;
        for index in 0..MAX_BUCKETS {
            let (lower, upper) = bucket_bounds(u16::try_from(index).unwrap());
            assert_eq!(lower, expected_lower, "gap before bucket {index}");
            assert!(upper >= lower);
            if index + 1 < MAX_BUCKETS {
                expected_lower = upper + 1;
            } else {
                assert_eq!(upper, u64::MAX);
            }
        }
        assert_eq!(usize::from(bucket_index(u64::MAX)), MAX_BUCKETS - 1);
    }

    #[test]
    fn test_percentiles_of_uniform_range() {
        let histogram = DurationHistogram::from_values(1..=10_000);
        let p50 = histogram.value_at_percentile(50.0);
        let p99 = histogram.value_at_percentile(99.0);
        assert!((p50 as f64 - 5_000.0).abs() / 5_000.0 < 1.0 / 64.0, "p50 = {p50}");
        assert!((p99 as f64 - 9_900.0).abs() / 9_900.0 < 1.0 / 64.0, "p99 = {p99}");
    }

    #[test]
    fn test_merge_accumulates_counts_and_extremes() {
        let mut a = DurationHistogram::from_values([10, 20]);
        let b = DurationHistogram::from_values([5, 5_000]);
        a.merge(&b);
        assert_eq!(a.total_count(), 4);
        assert_eq!(a.min(), Some(5));
        assert_eq!(a.max(), Some(5_000));
        assert_eq!(a.value_at_percentile(100.0), 5_000);
    }

    #[test]
    fn test_serde_keeps_buckets() {
        let histogram = DurationHistogram::from_values([1, 1_234, 2_345, 9_999_999]);
        let json = serde_json::to_string(&histogram).unwrap();
        let restored: DurationHistogram = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, histogram);
    }

    #[test]
    fn test_serde_shape_is_bucket_pairs() {
        let histogram = DurationHistogram::from_values([5, 5, 7]);
        assert_eq!(
            serde_json::to_value(&histogram).unwrap(),
            serde_json::json!({"buckets": [[5, 2], [7, 1]], "min": 5, "max": 7})
        );
    }

    #[test]
    fn test_deserialize_rejects_out_of_range_bucket() {
        let err = serde_json::from_str::<DurationHistogram>(
            r#"{"buckets": [[5000, 1]], "min": 1, "max": 2}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err}");
    }

    #[test]
    fn test_deserialize_empty_ignores_stray_extremes() {
        let histogram: DurationHistogram =
            serde_json::from_str(r#"{"buckets": [], "min": 1, "max": 2}"#).unwrap();
        assert!(histogram.is_empty());
        assert_eq!(histogram.min(), None);
        assert_eq!(histogram.value_at_percentile(95.0), 0);
    }

    #[test]
    fn test_deserialize_recomputes_count_and_clamps_extremes() {
        let histogram: DurationHistogram = serde_json::from_str(
            r#"{"buckets": [[3, 2], [0, 0], [10, 1]], "min": 0, "max": 99}"#,
        )
        .unwrap();
        assert_eq!(histogram.total_count(), 3);
        assert_eq!(histogram.bucket_count(), 2);
        assert_eq!(histogram.min(), Some(3));
        assert_eq!(histogram.max(), Some(10));
        assert_eq!(histogram.value_at_percentile(100.0), 10);
    }

    #[test]
    fn test_deserialize_orders_inverted_extremes() {
        let histogram: DurationHistogram =
            serde_json::from_str(r#"{"buckets": [[200, 1]], "min": 999999, "max": 0}"#).unwrap();
        assert!(histogram.min() <= histogram.max());
        histogram.value_at_percentile(50.0);
    }

    proptest! {
        #[test]
        fn prop_merge_is_commutative(
            left in proptest::collection::vec(any::<u64>(), 0..64),
            right in proptest::collection::vec(any::<u64>(), 0..64),
        ) {
            let mut ab = DurationHistogram::from_values(left.iter().copied());
            ab.merge(&DurationHistogram::from_values(right.iter().copied()));
            let mut ba = DurationHistogram::from_values(right.iter().copied());
            ba.merge(&DurationHistogram::from_values(left.iter().copied()));
            prop_assert_eq!(ab, ba);
        }

        #[test]
        fn prop_merge_matches_direct_recording(
            left in proptest::collection::vec(0u64..10_000_000_000, 1..64),
            right in proptest::collection::vec(0u64..10_000_000_000, 1..64),
        ) {
            let mut merged = DurationHistogram::from_values(left.iter().copied());
            merged.merge(&DurationHistogram::from_values(right.iter().copied()));
            let direct = DurationHistogram::from_values(left.iter().chain(right.iter()).copied());
            prop_assert_eq!(merged, direct);
        }

        #[test]
        fn prop_relative_error_is_bounded(value in 1u64..u64::MAX / 2) {
            let (lower, upper) = bucket_bounds(bucket_index(value));
            prop_assert!(lower <= value && value <= upper);
            prop_assert!((upper - lower) <= lower / 64 + 1);
        }
    }
}
