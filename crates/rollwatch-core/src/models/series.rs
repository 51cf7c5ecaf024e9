//! Series, points and rollup work items

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

use super::histogram::DurationHistogram;

/// Identifies one series inside an agent scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SeriesKey {
    /// A sampled gauge, e.g. `java.lang:type=Memory:HeapMemoryUsage/used`
    Gauge {
        /// Full gauge name
        gauge_name: String,
    },
    /// Transaction aggregates for one type, optionally narrowed to one name.
    /// `transaction_name: None` is the overall series for the type.
    Transaction {
        /// Transaction type, e.g. `Web`
        transaction_type: String,
        /// Single transaction name; `None` for the overall series
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transaction_name: Option<String>,
    },
}

/// Kind of data a series carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesKind {
    /// Weighted gauge values
    Gauge,
    /// Transaction aggregates with duration histograms
    Transaction,
}

impl SeriesKey {
    /// Gauge series
    pub fn gauge(gauge_name: impl Into<String>) -> Self {
        Self::Gauge {
            gauge_name: gauge_name.into(),
        }
    }

    /// Overall series for a transaction type
    pub fn transaction_overall(transaction_type: impl Into<String>) -> Self {
        Self::Transaction {
            transaction_type: transaction_type.into(),
            transaction_name: None,
        }
    }

    /// Series for a single named transaction
    pub fn transaction(
        transaction_type: impl Into<String>,
        transaction_name: impl Into<String>,
    ) -> Self {
        Self::Transaction {
            transaction_type: transaction_type.into(),
            transaction_name: Some(transaction_name.into()),
        }
    }

    /// Kind of payload this series holds
    pub fn kind(&self) -> SeriesKind {
        match self {
            Self::Gauge { .. } => SeriesKind::Gauge,
            Self::Transaction { .. } => SeriesKind::Transaction,
        }
    }

    /// Stable string form used as a storage column
    pub fn storage_key(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the string produced by [`SeriesKey::storage_key`]
    pub fn from_storage_key(key: &str) -> Result<Self> {
        serde_json::from_str(key)
            .map_err(|e| Error::storage(format!("corrupt series key {key:?}: {e}")))
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gauge { gauge_name } => write!(f, "gauge:{gauge_name}"),
            Self::Transaction {
                transaction_type,
                transaction_name: None,
            } => write!(f, "transaction:{transaction_type}"),
            Self::Transaction {
                transaction_type,
                transaction_name: Some(name),
            } => write!(f, "transaction:{transaction_type}/{name}"),
        }
    }
}

/// A gauge observation, or a weighted mean of several
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaugeValue {
    /// Observed value, or the weighted mean
    pub value: f64,
    /// Number of raw observations represented
    pub weight: u64,
}

impl GaugeValue {
    /// Weight-weighted mean of the given values; `None` when the total weight is zero
    pub fn weighted_mean<'a>(values: impl IntoIterator<Item = &'a GaugeValue>) -> Option<Self> {
        let mut total_weighted_value = 0.0;
        let mut total_weight: u64 = 0;
        for gauge_value in values {
            #[allow(clippy::cast_precision_loss)]
            let weight = gauge_value.weight as f64;
            total_weighted_value += gauge_value.value * weight;
            total_weight = total_weight.saturating_add(gauge_value.weight);
        }
        if total_weight == 0 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let value = total_weighted_value / total_weight as f64;
        Some(Self {
            value,
            weight: total_weight,
        })
    }
}

/// Transaction counts and durations over an interval
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAggregate {
    /// Transactions represented
    pub transaction_count: u64,
    /// Transactions that ended in an error
    #[serde(default)]
    pub error_count: u64,
    /// Sum of all durations
    pub total_duration_nanos: u64,
    /// Duration distribution
    #[serde(default)]
    pub duration_nanos_histogram: DurationHistogram,
}

impl TransactionAggregate {
    /// Aggregate for a single transaction
    pub fn single(duration_nanos: u64, error: bool) -> Self {
        Self {
            transaction_count: 1,
            error_count: u64::from(error),
            total_duration_nanos: duration_nanos,
            duration_nanos_histogram: DurationHistogram::from_values([duration_nanos]),
        }
    }

    /// Fold another aggregate into this one
    pub fn merge(&mut self, other: &TransactionAggregate) {
        self.transaction_count = self.transaction_count.saturating_add(other.transaction_count);
        self.error_count = self.error_count.saturating_add(other.error_count);
        self.total_duration_nanos = self
            .total_duration_nanos
            .saturating_add(other.total_duration_nanos);
        self.duration_nanos_histogram
            .merge(&other.duration_nanos_histogram);
    }

    /// Mean duration, if any transaction was recorded
    pub fn average_duration_nanos(&self) -> Option<f64> {
        #[allow(clippy::cast_precision_loss)]
        (self.transaction_count > 0)
            .then(|| self.total_duration_nanos as f64 / self.transaction_count as f64)
    }
}

/// Value carried by a point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Gauge observation or weighted mean
    Gauge(GaugeValue),
    /// Transaction counts with a duration histogram
    Transaction(TransactionAggregate),
}

impl Payload {
    /// Kind of series this payload belongs to
    pub fn kind(&self) -> SeriesKind {
        match self {
            Self::Gauge(_) => SeriesKind::Gauge,
            Self::Transaction(_) => SeriesKind::Transaction,
        }
    }

    /// Number of raw observations represented
    pub fn weight(&self) -> u64 {
        match self {
            Self::Gauge(gauge_value) => gauge_value.weight,
            Self::Transaction(aggregate) => aggregate.transaction_count,
        }
    }

    /// Merge payloads of one series into a single payload.
    ///
    /// Payloads of another kind are ignored. Returns `None` when the merged
    /// weight is zero (nothing to roll up).
    pub fn merge_all<'a>(
        kind: SeriesKind,
        payloads: impl IntoIterator<Item = &'a Payload>,
    ) -> Option<Payload> {
        match kind {
            SeriesKind::Gauge => GaugeValue::weighted_mean(payloads.into_iter().filter_map(
                |payload| match payload {
                    Self::Gauge(gauge_value) => Some(gauge_value),
                    Self::Transaction(_) => None,
                },
            ))
            .map(Self::Gauge),
            SeriesKind::Transaction => {
                let mut merged = TransactionAggregate::default();
                for payload in payloads {
                    if let Self::Transaction(aggregate) = payload {
                        merged.merge(aggregate);
                    }
                }
                (merged.transaction_count > 0).then_some(Self::Transaction(merged))
            }
        }
    }
}

/// A point reported by an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    /// Series the point belongs to
    pub series_key: SeriesKey,
    /// Epoch millis
    pub capture_time: i64,
    /// Observed value
    pub payload: Payload,
}

impl MetricPoint {
    /// Gauge point
    pub fn gauge(
        gauge_name: impl Into<String>,
        capture_time: i64,
        value: f64,
        weight: u64,
    ) -> Self {
        Self {
            series_key: SeriesKey::gauge(gauge_name),
            capture_time,
            payload: Payload::Gauge(GaugeValue { value, weight }),
        }
    }

    /// Transaction aggregate point
    pub fn transaction(
        series_key: SeriesKey,
        capture_time: i64,
        aggregate: TransactionAggregate,
    ) -> Self {
        Self {
            series_key,
            capture_time,
            payload: Payload::Transaction(aggregate),
        }
    }

    /// Reject points whose payload does not match the series kind
    pub fn validate(&self) -> Result<()> {
        if self.series_key.kind() != self.payload.kind() {
            return Err(Error::validation(format!(
                "series {} cannot hold a {:?} payload",
                self.series_key,
                self.payload.kind()
            )));
        }
        Ok(())
    }
}

/// A stored point at some rollup level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatePoint {
    /// Agent scope
    pub agent_scope: String,
    /// Series the point belongs to
    pub series_key: SeriesKey,
    /// Rollup level, 0 for raw points
    pub level: usize,
    /// Capture time at level 0, bucket end time above it
    pub capture_time: i64,
    /// Raw or merged value
    pub payload: Payload,
    /// Epoch millis after which the row may be purged
    pub expires_at: i64,
}

/// "Needs rollup" marker for one bucket of one series
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RollupWorkItem {
    /// Agent scope
    pub agent_scope: String,
    /// Level whose bucket needs compacting
    pub level: usize,
    /// End of the bucket, epoch millis
    pub bucket_end_time: i64,
    /// Series to compact
    pub series_key: SeriesKey,
    /// Version stamp; only the holder of the current token may retire the item
    pub update_token: Uuid,
}
