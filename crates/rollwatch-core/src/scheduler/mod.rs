//! Background loops for compaction, alert checks, and retention
//!
//! A single task ticks three intervals. Each pass is independent and a
//! failed pass is logged and retried on the next tick.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::alerting::{AlertEvaluator, AlertPassSummary};
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::rollup::{now_millis, RollupStore, RollupSummary};

/// Outcome of one alert tick, both kinds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlertCycleSummary {
    /// End of the evaluated window, epoch millis
    pub end_time: i64,
    /// Transaction alert counts
    pub transaction: AlertPassSummary,
    /// Gauge alert counts
    pub gauge: AlertPassSummary,
}

/// Drives rollup, alerting and purging on configured cadences
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<RollupStore>,
    evaluator: Arc<AlertEvaluator>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Scheduler {
    /// Scheduler over `store` and `evaluator`; loops start with [`Scheduler::start`]
    pub fn new(
        config: SchedulerConfig,
        store: Arc<RollupStore>,
        evaluator: Arc<AlertEvaluator>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Self {
            config,
            store,
            evaluator,
            shutdown_tx,
            shutdown_rx: Mutex::new(Some(shutdown_rx)),
        }
    }

    /// Compact everything that is at least one base interval old
    pub async fn run_rollup(&self, now: i64) -> Result<Option<RollupSummary>> {
        let not_before = now - self.store.levels().base().interval_millis;
        self.store.try_rollup(not_before).await
    }

    /// Check both alert kinds with the window ending at the last base bucket
    pub async fn run_alerts(&self, now: i64) -> Result<AlertCycleSummary> {
        let end_time = self.store.levels().base().floor(now);
        let transaction = self.evaluator.check_transaction_alerts(end_time).await?;
        let gauge = self.evaluator.check_gauge_alerts(end_time).await?;
        Ok(AlertCycleSummary {
            end_time,
            transaction,
            gauge,
        })
    }

    /// Delete points whose retention has passed
    pub async fn run_purge(&self, now: i64) -> Result<u64> {
        self.store.purge_expired(now).await
    }

    /// Run until [`Scheduler::stop`] or Ctrl+C
    pub async fn start(&self) {
        let mut shutdown_rx = {
            let mut guard = self.shutdown_rx.lock();
            match guard.take() {
                Some(rx) => rx,
                None => {
                    error!("Scheduler already started");
                    return;
                }
            }
        };

        let mut rollup_tick = interval(self.config.rollup_interval);
        let mut alert_tick = interval(self.config.alert_interval);
        let mut purge_tick = interval(self.config.purge_interval);
        for tick in [&mut rollup_tick, &mut alert_tick, &mut purge_tick] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        info!(
            rollup = %humantime::format_duration(self.config.rollup_interval),
            alerts = %humantime::format_duration(self.config.alert_interval),
            purge = %humantime::format_duration(self.config.purge_interval),
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = rollup_tick.tick() => {
                    match self.run_rollup(now_millis()).await {
                        Ok(Some(summary)) => debug!(
                            buckets = summary.compaction.buckets_compacted,
                            failed_scopes = summary.failed_scopes,
                            "Rollup tick"
                        ),
                        Ok(None) => debug!("Rollup tick skipped"),
                        Err(e) => error!(error = %e, "Rollup tick failed"),
                    }
                }

                _ = alert_tick.tick() => {
                    match self.run_alerts(now_millis()).await {
                        Ok(summary) => {
                            let failed = summary.transaction.failed + summary.gauge.failed;
                            if failed > 0 {
                                warn!(
                                    failed,
                                    end_time = summary.end_time,
                                    "Some alert configs could not be evaluated"
                                );
                            }
                            debug!(
                                end_time = summary.end_time,
                                transaction = summary.transaction.evaluated,
                                gauge = summary.gauge.evaluated,
                                "Alert tick"
                            );
                        }
                        Err(e) => error!(error = %e, "Alert tick failed"),
                    }
                }

                _ = purge_tick.tick() => {
                    if let Err(e) = self.run_purge(now_millis()).await {
                        error!(error = %e, "Purge tick failed");
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl+C received, shutting down...");
                    break;
                }
            }
        }

        info!("Scheduler stopped");
    }

    /// Signal the running loops to exit
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::{LogTransport, NotificationDispatcher};
    use crate::config::{RollupConfig, SmtpConfig};
    use crate::db::MemoryBackend;
    use crate::models::{AlertConfig, AlertKind, MetricPoint, SeriesKey};
    use crate::rollup::RollupLevels;
    use std::time::Duration;
    use uuid::Uuid;

    const MINUTE: i64 = 60_000;

    fn scheduler(backend: Arc<MemoryBackend>) -> (Scheduler, Arc<RollupStore>) {
        let levels = RollupLevels::from_config(&RollupConfig::default().levels).unwrap();
        let store = Arc::new(RollupStore::new(backend.clone(), backend.clone(), levels));
        let evaluator = AlertEvaluator::new(
            store.clone(),
            backend.clone(),
            backend.clone(),
            backend,
            NotificationDispatcher::new(Arc::new(LogTransport), SmtpConfig::default()),
        );
        let scheduler = Scheduler::new(
            SchedulerConfig::default(),
            store.clone(),
            Arc::new(evaluator),
        );
        (scheduler, store)
    }

    #[tokio::test]
    async fn test_rollup_trails_by_one_base_interval() {
        let backend = Arc::new(MemoryBackend::new());
        let (scheduler, store) = scheduler(backend);
        store
            .store("", &[MetricPoint::gauge("g", 4 * MINUTE + 1, 1.0, 1)])
            .await
            .unwrap();

        // level 1 bucket ends at 5 min; 5:30 minus one minute is before it
        let summary = scheduler
            .run_rollup(5 * MINUTE + 30_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.compaction.buckets_compacted, 0);

        let summary = scheduler.run_rollup(6 * MINUTE).await.unwrap().unwrap();
        assert_eq!(summary.compaction.buckets_compacted, 1);
        let points = store
            .read_aggregates("", &SeriesKey::gauge("g"), 0, 5 * MINUTE, 1)
            .await
            .unwrap();
        assert_eq!(points.len(), 1);
    }

    #[tokio::test]
    async fn test_alert_window_ends_on_base_boundary() {
        let config = AlertConfig {
            id: Uuid::new_v4(),
            agent_scope: String::new(),
            kind: AlertKind::Gauge,
            transaction_type: None,
            transaction_percentile: None,
            transaction_threshold_millis: None,
            min_transaction_count: None,
            gauge_name: Some("g".to_string()),
            gauge_threshold: Some(10.0),
            time_period_seconds: 60,
            email_addresses: vec![],
        };
        let backend = Arc::new(MemoryBackend::with_alert_configs(vec![config]));
        let (scheduler, store) = scheduler(backend);
        store
            .store("", &[MetricPoint::gauge("g", 2 * MINUTE, 20.0, 1)])
            .await
            .unwrap();

        let summary = scheduler.run_alerts(2 * MINUTE + 59_000).await.unwrap();
        assert_eq!(summary.end_time, 2 * MINUTE);
        assert_eq!(summary.gauge.evaluated, 1);
        assert_eq!(summary.gauge.triggered, 1);
        assert_eq!(summary.transaction.evaluated, 0);
    }

    #[tokio::test]
    async fn test_purge_removes_expired_points() {
        let backend = Arc::new(MemoryBackend::new());
        let (scheduler, store) = scheduler(backend.clone());
        store
            .store("", &[MetricPoint::gauge("g", MINUTE, 1.0, 1)])
            .await
            .unwrap();
        assert_eq!(scheduler.run_purge(MINUTE).await.unwrap(), 0);
        assert_eq!(backend.point_count(), 1);

        let after_retention = MINUTE + 48 * 60 * MINUTE;
        assert_eq!(scheduler.run_purge(after_retention).await.unwrap(), 1);
        assert_eq!(backend.point_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_ends_loop() {
        let (scheduler, _) = scheduler(Arc::new(MemoryBackend::new()));
        let scheduler = Arc::new(scheduler);
        let handle = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.start().await }
        });

        scheduler.stop().await;
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
