//! Alert data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};

/// What an alert config watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    /// Percentile of the overall transaction duration for a transaction type
    Transaction,
    /// Weighted average of a gauge
    Gauge,
}

impl AlertKind {
    /// Lowercase name, as used in config files and the CLI
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transaction => "transaction",
            Self::Gauge => "gauge",
        }
    }
}

impl std::str::FromStr for AlertKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "transaction" => Ok(Self::Transaction),
            "gauge" => Ok(Self::Gauge),
            other => Err(Error::validation(format!("unknown alert kind: {other}"))),
        }
    }
}

/// A threshold alert rule.
///
/// Kind-specific fields are optional so a stored config can be incomplete;
/// the evaluator reports such configs as configuration errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Stable identifier
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    /// Agent scope the alert applies to
    pub agent_scope: String,

    /// What is being watched
    pub kind: AlertKind,

    // Transaction alerts
    /// Transaction type whose overall series is checked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_type: Option<String>,

    /// Percentile in [0, 100]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_percentile: Option<f64>,

    /// Percentile value above which the alert triggers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_threshold_millis: Option<u64>,

    /// Windows with fewer transactions never trigger
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_transaction_count: Option<u64>,

    // Gauge alerts
    /// Gauge whose average is checked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gauge_name: Option<String>,

    /// Average at or above which the alert triggers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gauge_threshold: Option<f64>,

    /// Evaluation window ending at the check time
    pub time_period_seconds: u64,

    /// Notification recipients
    #[serde(default)]
    pub email_addresses: Vec<String>,
}

/// Fields covered by the config version
#[derive(Serialize)]
struct VersionedFields<'a> {
    agent_scope: &'a str,
    kind: AlertKind,
    transaction_type: &'a Option<String>,
    transaction_percentile: Option<f64>,
    transaction_threshold_millis: Option<u64>,
    min_transaction_count: Option<u64>,
    gauge_name: &'a Option<String>,
    gauge_threshold: Option<f64>,
    time_period_seconds: u64,
    email_addresses: &'a [String],
}

/// Validated parameters of a transaction alert
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionCondition<'a> {
    /// Transaction type whose overall series is checked
    pub transaction_type: &'a str,
    /// Percentile in [0, 100]
    pub percentile: f64,
    /// Trigger threshold
    pub threshold_millis: u64,
    /// Minimum transactions in the window
    pub min_transaction_count: u64,
}

/// Validated parameters of a gauge alert
#[derive(Debug, Clone, PartialEq)]
pub struct GaugeCondition<'a> {
    /// Gauge name
    pub gauge_name: &'a str,
    /// Trigger threshold for the average
    pub threshold: f64,
}

impl AlertConfig {
    /// Content hash of every field except `id`.
    ///
    /// Any edit produces a new version, which resets the triggered state.
    pub fn version(&self) -> String {
        let fields = VersionedFields {
            agent_scope: &self.agent_scope,
            kind: self.kind,
            transaction_type: &self.transaction_type,
            transaction_percentile: self.transaction_percentile,
            transaction_threshold_millis: self.transaction_threshold_millis,
            min_transaction_count: self.min_transaction_count,
            gauge_name: &self.gauge_name,
            gauge_threshold: self.gauge_threshold,
            time_period_seconds: self.time_period_seconds,
            email_addresses: &self.email_addresses,
        };
        // plain strings and numbers only, serialization cannot fail
        let canonical = serde_json::to_vec(&fields).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }

    /// Window length in milliseconds
    pub fn time_period_millis(&self) -> i64 {
        i64::try_from(self.time_period_seconds.saturating_mul(1000)).unwrap_or(i64::MAX)
    }

    /// Check the fields a transaction alert needs
    pub fn transaction_condition(&self) -> Result<TransactionCondition<'_>> {
        let transaction_type = self
            .transaction_type
            .as_deref()
            .ok_or_else(|| self.missing("transaction_type"))?;
        let percentile = self
            .transaction_percentile
            .ok_or_else(|| self.missing("transaction_percentile"))?;
        let threshold_millis = self
            .transaction_threshold_millis
            .ok_or_else(|| self.missing("transaction_threshold_millis"))?;
        let min_transaction_count = self
            .min_transaction_count
            .ok_or_else(|| self.missing("min_transaction_count"))?;
        Ok(TransactionCondition {
            transaction_type,
            percentile,
            threshold_millis,
            min_transaction_count,
        })
    }

    /// Check the fields a gauge alert needs
    pub fn gauge_condition(&self) -> Result<GaugeCondition<'_>> {
        let gauge_name = self
            .gauge_name
            .as_deref()
            .ok_or_else(|| self.missing("gauge_name"))?;
        let threshold = self
            .gauge_threshold
            .ok_or_else(|| self.missing("gauge_threshold"))?;
        Ok(GaugeCondition {
            gauge_name,
            threshold,
        })
    }

    /// Reject configs that could never be evaluated
    pub fn validate(&self) -> Result<()> {
        if self.time_period_seconds == 0 {
            return Err(Error::validation("time_period_seconds must be positive"));
        }
        match self.kind {
            AlertKind::Transaction => {
                let condition = self.transaction_condition()?;
                if !(0.0..=100.0).contains(&condition.percentile) {
                    return Err(Error::validation(format!(
                        "transaction_percentile {} is outside [0, 100]",
                        condition.percentile
                    )));
                }
            }
            AlertKind::Gauge => {
                self.gauge_condition()?;
            }
        }
        Ok(())
    }

    fn missing(&self, field: &str) -> Error {
        Error::configuration(
            self.id.to_string(),
            format!("{} alert is missing {field}", self.kind.as_str()),
        )
    }
}

/// An alert currently in the triggered state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggeredAlert {
    /// Agent scope
    pub agent_scope: String,
    /// Version of the config that triggered
    pub alert_config_version: String,
    /// When the alert triggered
    pub triggered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transaction_config() -> AlertConfig {
        AlertConfig {
            id: Uuid::new_v4(),
            agent_scope: String::new(),
            kind: AlertKind::Transaction,
            transaction_type: Some("Web".to_string()),
            transaction_percentile: Some(95.0),
            transaction_threshold_millis: Some(1),
            min_transaction_count: Some(0),
            gauge_name: None,
            gauge_threshold: None,
            time_period_seconds: 60,
            email_addresses: vec!["to@example.org".to_string()],
        }
    }

    #[test]
    fn test_version_ignores_id() {
        let a = transaction_config();
        let mut b = a.clone();
        b.id = Uuid::new_v4();
        assert_eq!(a.version(), b.version());
        assert_eq!(a.version().len(), 64);
    }

    #[test]
    fn test_version_changes_on_edit() {
        let a = transaction_config();
        let mut b = a.clone();
        b.transaction_threshold_millis = Some(2);
        assert_ne!(a.version(), b.version());
    }

    #[test]
    fn test_missing_field_is_configuration_error() {
        let mut config = transaction_config();
        config.min_transaction_count = None;
        let err = config.transaction_condition().unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(err.to_string().contains("min_transaction_count"));
    }

    #[test]
    fn test_deserialize_defaults_id() {
        let config: AlertConfig = serde_json::from_str(
            r#"{"agent_scope":"","kind":"gauge","gauge_name":"g",
                "gauge_threshold":1.5,"time_period_seconds":60}"#,
        )
        .unwrap();
        assert_eq!(config.kind, AlertKind::Gauge);
        assert!(config.email_addresses.is_empty());
        assert!(config.validate().is_ok());
    }
}
