//! Alert evaluation with triggered-state hysteresis

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::db::{alert_configs_of_kind, AlertConfigSource, ScopeCatalog, TriggeredAlertRepository};
use crate::error::{Error, Result};
use crate::models::{
    AlertConfig, AlertKind, DurationHistogram, Gauge, GaugeValue, Payload, SeriesKey,
    TriggeredAlert,
};
use crate::rollup::{RollupLevelSelector, RollupStore};

use super::notifier::NotificationDispatcher;

/// Result of checking one alert config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertOutcome {
    /// NOT_TRIGGERED -> TRIGGERED, won by this caller
    Triggered,
    /// TRIGGERED -> NOT_TRIGGERED, won by this caller
    Resolved,
    /// No transition, or another caller won it
    Unchanged,
}

/// Counts for one pass over all scopes and configs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlertPassSummary {
    /// Configs checked
    pub evaluated: usize,
    /// Configs that moved into the triggered state
    pub triggered: usize,
    /// Configs that cleared
    pub resolved: usize,
    /// Configs skipped for bad data or storage errors
    pub failed: usize,
}

/// Evaluates alert configs against rolled-up data
pub struct AlertEvaluator {
    store: Arc<RollupStore>,
    selector: RollupLevelSelector,
    scopes: Arc<dyn ScopeCatalog>,
    configs: Arc<dyn AlertConfigSource>,
    triggered: Arc<dyn TriggeredAlertRepository>,
    dispatcher: NotificationDispatcher,
    max_concurrency: usize,
}

impl AlertEvaluator {
    /// Create a new alert evaluator
    pub fn new(
        store: Arc<RollupStore>,
        scopes: Arc<dyn ScopeCatalog>,
        configs: Arc<dyn AlertConfigSource>,
        triggered: Arc<dyn TriggeredAlertRepository>,
        dispatcher: NotificationDispatcher,
    ) -> Self {
        let selector = RollupLevelSelector::new(store.levels().clone());
        Self {
            store,
            selector,
            scopes,
            configs,
            triggered,
            dispatcher,
            max_concurrency: 8,
        }
    }

    /// Upper bound on pairs evaluated at once
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Check every transaction alert of every scope
    pub async fn check_transaction_alerts(&self, end_time: i64) -> Result<AlertPassSummary> {
        self.check_alerts(AlertKind::Transaction, end_time).await
    }

    /// Check every gauge alert of every scope
    pub async fn check_gauge_alerts(&self, end_time: i64) -> Result<AlertPassSummary> {
        self.check_alerts(AlertKind::Gauge, end_time).await
    }

    async fn check_alerts(&self, kind: AlertKind, end_time: i64) -> Result<AlertPassSummary> {
        let mut summary = AlertPassSummary::default();
        let mut pairs = Vec::new();
        for scope in self.scopes.scopes().await? {
            match alert_configs_of_kind(self.configs.as_ref(), &scope, kind).await {
                Ok(configs) => {
                    pairs.extend(configs.into_iter().map(|config| (scope.clone(), config)));
                }
                Err(e) => {
                    error!(scope = %scope, error = %e, "Error reading alert configs");
                    summary.failed += 1;
                }
            }
        }

        debug!(kind = kind.as_str(), count = pairs.len(), "Evaluating alert configs");

        let results: Vec<_> = stream::iter(pairs)
            .map(|(scope, config)| async move {
                let outcome = match kind {
                    AlertKind::Transaction => {
                        self.check_transaction_alert(&scope, &config, end_time).await
                    }
                    AlertKind::Gauge => self.check_gauge_alert(&scope, &config, end_time).await,
                };
                (scope, config, outcome)
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        for (scope, config, outcome) in results {
            summary.evaluated += 1;
            match outcome {
                Ok(AlertOutcome::Triggered) => summary.triggered += 1,
                Ok(AlertOutcome::Resolved) => summary.resolved += 1,
                Ok(AlertOutcome::Unchanged) => {}
                Err(e @ Error::Configuration { .. }) => {
                    warn!(
                        scope = %scope,
                        config_id = %config.id,
                        error = %e,
                        "Skipping misconfigured alert"
                    );
                    summary.failed += 1;
                }
                Err(e) => {
                    error!(
                        scope = %scope,
                        config_id = %config.id,
                        error = %e,
                        "Error evaluating alert"
                    );
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Percentile of the overall transaction series against the threshold
    pub async fn check_transaction_alert(
        &self,
        agent_scope: &str,
        config: &AlertConfig,
        end_time: i64,
    ) -> Result<AlertOutcome> {
        let condition = config.transaction_condition()?;
        let start_time = end_time - config.time_period_millis() + 1;
        let level = self.selector.select_level(start_time, end_time);

        let points = self
            .store
            .read_aggregates(
                agent_scope,
                &SeriesKey::transaction_overall(condition.transaction_type),
                start_time,
                end_time,
                level,
            )
            .await?;

        let mut transaction_count = 0;
        let mut histogram = DurationHistogram::new();
        for point in &points {
            if let Payload::Transaction(aggregate) = &point.payload {
                transaction_count += aggregate.transaction_count;
                histogram.merge(&aggregate.duration_nanos_histogram);
            }
        }

        if transaction_count < condition.min_transaction_count {
            debug!(
                scope = %agent_scope,
                config_id = %config.id,
                transaction_count,
                min = condition.min_transaction_count,
                "Not enough transactions to evaluate"
            );
            return Ok(AlertOutcome::Unchanged);
        }

        let observed_nanos = histogram.value_at_percentile(condition.percentile);
        let crossed = observed_nanos >= condition.threshold_millis.saturating_mul(1_000_000);

        debug!(
            scope = %agent_scope,
            config_id = %config.id,
            level,
            observed_nanos,
            crossed,
            "Evaluated transaction alert"
        );

        let outcome = self.transition(agent_scope, config, crossed).await?;
        if outcome != AlertOutcome::Unchanged {
            let message = self.dispatcher.transaction_message(
                agent_scope,
                config,
                &condition,
                observed_nanos,
                transaction_count,
                outcome == AlertOutcome::Resolved,
            );
            // state is already committed; a failed send is logged by the dispatcher
            let _ = self.dispatcher.dispatch(&message).await;
        }
        Ok(outcome)
    }

    /// Weighted gauge average against the threshold
    pub async fn check_gauge_alert(
        &self,
        agent_scope: &str,
        config: &AlertConfig,
        end_time: i64,
    ) -> Result<AlertOutcome> {
        let condition = config.gauge_condition()?;
        let start_time = end_time - config.time_period_millis() + 1;
        let level = self.selector.select_level(start_time, end_time);

        let points = self
            .store
            .read_aggregates(
                agent_scope,
                &SeriesKey::gauge(condition.gauge_name),
                start_time,
                end_time,
                level,
            )
            .await?;

        let average =
            GaugeValue::weighted_mean(points.iter().filter_map(|point| match &point.payload {
                Payload::Gauge(value) => Some(value),
                Payload::Transaction(_) => None,
            }));
        let Some(average) = average else {
            debug!(scope = %agent_scope, config_id = %config.id, "No gauge data in window");
            return Ok(AlertOutcome::Unchanged);
        };

        let crossed = average.value >= condition.threshold;
        debug!(
            scope = %agent_scope,
            config_id = %config.id,
            level,
            average = average.value,
            crossed,
            "Evaluated gauge alert"
        );

        let outcome = self.transition(agent_scope, config, crossed).await?;
        if outcome != AlertOutcome::Unchanged {
            let gauge = Gauge::parse(condition.gauge_name);
            let message = self.dispatcher.gauge_message(
                agent_scope,
                config,
                &gauge,
                average.value,
                outcome == AlertOutcome::Resolved,
            );
            let _ = self.dispatcher.dispatch(&message).await;
        }
        Ok(outcome)
    }

    /// Conditional state change; only the caller whose write lands gets a transition
    async fn transition(
        &self,
        agent_scope: &str,
        config: &AlertConfig,
        crossed: bool,
    ) -> Result<AlertOutcome> {
        let version = config.version();
        let currently_triggered = self.triggered.exists(agent_scope, &version).await?;

        let outcome = match (currently_triggered, crossed) {
            (false, true) => {
                let alert = TriggeredAlert {
                    agent_scope: agent_scope.to_string(),
                    alert_config_version: version,
                    triggered_at: Utc::now(),
                };
                if self.triggered.insert_if_absent(&alert).await? {
                    AlertOutcome::Triggered
                } else {
                    AlertOutcome::Unchanged
                }
            }
            (true, false) => {
                if self.triggered.delete_if_present(agent_scope, &version).await? {
                    AlertOutcome::Resolved
                } else {
                    AlertOutcome::Unchanged
                }
            }
            _ => AlertOutcome::Unchanged,
        };

        match outcome {
            AlertOutcome::Triggered => {
                metrics::counter!("rollwatch_alert_transitions_total", "transition" => "triggered")
                    .increment(1);
                info!(
                    scope = %agent_scope,
                    config_id = %config.id,
                    kind = config.kind.as_str(),
                    "Alert triggered"
                );
            }
            AlertOutcome::Resolved => {
                metrics::counter!("rollwatch_alert_transitions_total", "transition" => "resolved")
                    .increment(1);
                info!(
                    scope = %agent_scope,
                    config_id = %config.id,
                    kind = config.kind.as_str(),
                    "Alert resolved"
                );
            }
            AlertOutcome::Unchanged => {}
        }
        Ok(outcome)
    }
}
