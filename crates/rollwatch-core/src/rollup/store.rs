//! Rollup store: ingestion, compaction and reads

use std::collections::HashSet;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{RollupBackend, ScopeCatalog};
use crate::error::{Error, Result};
use crate::models::{AggregatePoint, MetricPoint, Payload, RollupWorkItem, SeriesKey};

use super::level::RollupLevels;

/// Process-local "a sweep is running" flag.
///
/// Never blocks: a caller that finds the flag set simply skips its sweep.
#[derive(Debug, Default)]
pub struct RollupGuard {
    running: AtomicBool,
}

/// Held while a guarded sweep runs; clears the flag on drop
#[derive(Debug)]
pub struct RollupLease<'a> {
    running: &'a AtomicBool,
}

impl RollupGuard {
    /// Set the flag, or `None` when a sweep already holds it
    pub fn try_acquire(&self) -> Option<RollupLease<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RollupLease {
                running: &self.running,
            })
    }

    /// Whether a guarded sweep currently holds the flag
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for RollupLease<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Outcome of compacting one level of one scope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactionSummary {
    /// Aggregates written
    pub buckets_compacted: usize,
    /// Buckets with zero total weight; retired without an aggregate
    pub empty_buckets: usize,
    /// Items whose token changed under us; left for the next pass
    pub retried: usize,
    /// Items that hit a storage error; kept queued for the next pass
    pub failed: usize,
}

/// Result of compacting a single work item
enum ItemOutcome {
    Compacted,
    Empty,
    Retried,
}

impl AddAssign for CompactionSummary {
    fn add_assign(&mut self, other: Self) {
        self.buckets_compacted += other.buckets_compacted;
        self.empty_buckets += other.empty_buckets;
        self.retried += other.retried;
        self.failed += other.failed;
    }
}

/// Outcome of a full sweep over all scopes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RollupSummary {
    /// Scopes visited
    pub scopes: usize,
    /// Scopes where some level failed and coarser levels were skipped
    pub failed_scopes: usize,
    /// Totals over every compacted level
    pub compaction: CompactionSummary,
}

/// Per-level storage with incremental compaction
pub struct RollupStore {
    backend: Arc<dyn RollupBackend>,
    scopes: Arc<dyn ScopeCatalog>,
    levels: RollupLevels,
    guard: RollupGuard,
    auto_rollup_on_store: bool,
}

impl RollupStore {
    /// Store over `backend`, sweeping the scopes listed by `scopes`
    pub fn new(
        backend: Arc<dyn RollupBackend>,
        scopes: Arc<dyn ScopeCatalog>,
        levels: RollupLevels,
    ) -> Self {
        Self {
            backend,
            scopes,
            levels,
            guard: RollupGuard::default(),
            auto_rollup_on_store: false,
        }
    }

    /// Run a guarded sweep after every successful store
    pub fn with_auto_rollup(mut self, enabled: bool) -> Self {
        self.auto_rollup_on_store = enabled;
        self
    }

    /// Configured level table
    pub fn levels(&self) -> &RollupLevels {
        &self.levels
    }

    /// Guard shared by every guarded sweep of this store
    pub fn guard(&self) -> &RollupGuard {
        &self.guard
    }

    /// Persist raw points at level 0 and enqueue their coarser buckets
    pub async fn store(&self, agent_scope: &str, points: &[MetricPoint]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        for point in points {
            point.validate()?;
        }

        let base = self.levels.base();
        let raw: Vec<AggregatePoint> = points
            .iter()
            .map(|point| AggregatePoint {
                agent_scope: agent_scope.to_string(),
                series_key: point.series_key.clone(),
                level: 0,
                capture_time: point.capture_time,
                payload: point.payload.clone(),
                expires_at: base.expires_at(point.capture_time),
            })
            .collect();

        let mut seen: HashSet<(usize, i64, &SeriesKey)> = HashSet::new();
        let mut work_items = Vec::new();
        for point in points {
            for (level_index, level) in self.levels.iter().skip(1) {
                let bucket_end_time = level.bucket_end(point.capture_time);
                if seen.insert((level_index, bucket_end_time, &point.series_key)) {
                    work_items.push(RollupWorkItem {
                        agent_scope: agent_scope.to_string(),
                        level: level_index,
                        bucket_end_time,
                        series_key: point.series_key.clone(),
                        update_token: Uuid::now_v7(),
                    });
                }
            }
        }

        let max_capture_time = points
            .iter()
            .map(|point| point.capture_time)
            .max()
            .unwrap_or_default();

        self.backend
            .write_batch(agent_scope, &raw, &work_items, max_capture_time)
            .await?;

        metrics::counter!("rollwatch_points_stored_total").increment(raw.len() as u64);
        debug!(
            scope = %agent_scope,
            points = raw.len(),
            work_items = work_items.len(),
            "Stored points"
        );

        if self.auto_rollup_on_store {
            let not_before_time = max_capture_time - base.interval_millis;
            if let Err(e) = self.try_rollup(not_before_time).await {
                warn!(scope = %agent_scope, error = %e, "Opportunistic rollup failed");
            }
        }

        Ok(())
    }

    /// Drain due work items of one level for one scope
    pub async fn compact(
        &self,
        level: usize,
        agent_scope: &str,
        not_before_time: i64,
    ) -> Result<CompactionSummary> {
        if level == 0 {
            return Err(Error::validation("level 0 holds raw data and is never compacted"));
        }
        self.levels.level(level)?;

        let items = self
            .backend
            .read_due_work_items(agent_scope, level, not_before_time)
            .await?;

        let mut summary = CompactionSummary::default();
        for item in items {
            match self.compact_item(level, agent_scope, &item).await {
                Ok(ItemOutcome::Compacted) => summary.buckets_compacted += 1,
                Ok(ItemOutcome::Empty) => summary.empty_buckets += 1,
                Ok(ItemOutcome::Retried) => summary.retried += 1,
                Err(e) => {
                    summary.failed += 1;
                    metrics::counter!("rollwatch_rollup_failures_total").increment(1);
                    error!(
                        scope = %agent_scope,
                        level,
                        bucket_end = item.bucket_end_time,
                        series = %item.series_key,
                        error = %e,
                        "Failed to compact bucket, leaving it for the next pass"
                    );
                }
            }
        }

        metrics::counter!("rollwatch_rollup_buckets_total", "level" => level.to_string())
            .increment(summary.buckets_compacted as u64);
        Ok(summary)
    }

    /// Merge the finer points of one bucket and retire its work item
    async fn compact_item(
        &self,
        level: usize,
        agent_scope: &str,
        item: &RollupWorkItem,
    ) -> Result<ItemOutcome> {
        let rollup_level = *self.levels.level(level)?;
        let bucket_end_time = item.bucket_end_time;
        let points = self
            .backend
            .read_points(
                agent_scope,
                &item.series_key,
                level - 1,
                bucket_end_time - rollup_level.interval_millis,
                bucket_end_time,
            )
            .await?;

        let merged = Payload::merge_all(
            item.series_key.kind(),
            points.iter().map(|point| &point.payload),
        );
        let outcome = match merged {
            Some(payload) => {
                self.backend
                    .upsert_point(&AggregatePoint {
                        agent_scope: agent_scope.to_string(),
                        series_key: item.series_key.clone(),
                        level,
                        capture_time: bucket_end_time,
                        payload,
                        expires_at: rollup_level.expires_at(bucket_end_time),
                    })
                    .await?;
                ItemOutcome::Compacted
            }
            None => ItemOutcome::Empty,
        };

        if self.backend.delete_work_item_if(item).await? {
            debug!(
                scope = %agent_scope,
                level,
                bucket_end = bucket_end_time,
                series = %item.series_key,
                "Compacted bucket"
            );
            Ok(outcome)
        } else {
            metrics::counter!("rollwatch_rollup_retries_total").increment(1);
            debug!(
                scope = %agent_scope,
                level,
                bucket_end = bucket_end_time,
                series = %item.series_key,
                "Work item refreshed during compaction, leaving it for the next pass"
            );
            Ok(ItemOutcome::Retried)
        }
    }

    /// Compact every level of every known scope, finest first
    pub async fn rollup(&self, not_before_time: i64) -> Result<RollupSummary> {
        let scopes = self.scopes.scopes().await?;
        let mut summary = RollupSummary::default();

        for scope in scopes {
            summary.scopes += 1;
            for (level_index, level) in self.levels.iter().skip(1) {
                let level_not_before = level.floor(not_before_time);
                match self.compact(level_index, &scope, level_not_before).await {
                    Ok(compaction) => summary.compaction += compaction,
                    Err(e) => {
                        error!(
                            scope = %scope,
                            level = level_index,
                            error = %e,
                            "Rollup failed, skipping coarser levels until the next pass"
                        );
                        summary.failed_scopes += 1;
                        break;
                    }
                }
            }
        }

        if summary.compaction.buckets_compacted > 0
            || summary.compaction.failed > 0
            || summary.failed_scopes > 0
        {
            info!(
                scopes = summary.scopes,
                buckets = summary.compaction.buckets_compacted,
                empty = summary.compaction.empty_buckets,
                retried = summary.compaction.retried,
                failed = summary.compaction.failed,
                failed_scopes = summary.failed_scopes,
                "Rollup pass complete"
            );
        }
        Ok(summary)
    }

    /// [`RollupStore::rollup`] unless a guarded sweep is already running.
    /// Returns `None` when skipped.
    pub async fn try_rollup(&self, not_before_time: i64) -> Result<Option<RollupSummary>> {
        let Some(_lease) = self.guard.try_acquire() else {
            debug!("Rollup already in progress, skipping");
            return Ok(None);
        };
        self.rollup(not_before_time).await.map(Some)
    }

    /// Points of a series at `level` with capture time in `[from_time, to_time]`
    pub async fn read_aggregates(
        &self,
        agent_scope: &str,
        series_key: &SeriesKey,
        from_time: i64,
        to_time: i64,
        level: usize,
    ) -> Result<Vec<AggregatePoint>> {
        self.levels.level(level)?;
        if from_time > to_time {
            return Ok(Vec::new());
        }
        self.backend
            .read_points(
                agent_scope,
                series_key,
                level,
                from_time.saturating_sub(1),
                to_time,
            )
            .await
    }

    /// Names of the gauges with stored points in `agent_scope`, sorted
    pub async fn gauge_names(&self, agent_scope: &str) -> Result<Vec<String>> {
        let series = self.scopes.series(agent_scope).await?;
        Ok(series
            .into_iter()
            .filter_map(|series_key| match series_key {
                SeriesKey::Gauge { gauge_name } => Some(gauge_name),
                SeriesKey::Transaction { .. } => None,
            })
            .collect())
    }

    /// Delete rows whose retention has passed
    pub async fn purge_expired(&self, now: i64) -> Result<u64> {
        let purged = self.backend.purge_expired(now).await?;
        if purged > 0 {
            info!(purged, "Purged expired points");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RollupConfig;
    use crate::db::MemoryBackend;
    use crate::models::{DurationHistogram, GaugeValue, TransactionAggregate};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    const MINUTE: i64 = 60_000;

    fn levels() -> RollupLevels {
        RollupLevels::from_config(&RollupConfig::default().levels).unwrap()
    }

    fn memory_store() -> (Arc<MemoryBackend>, RollupStore) {
        let backend = Arc::new(MemoryBackend::new());
        let store = RollupStore::new(backend.clone(), backend.clone(), levels());
        (backend, store)
    }

    fn gauge_value(point: &AggregatePoint) -> GaugeValue {
        match &point.payload {
            Payload::Gauge(value) => *value,
            other => panic!("expected gauge payload, got {other:?}"),
        }
    }

    fn transaction_points(capture_time: i64) -> Vec<MetricPoint> {
        let first = TransactionAggregate::single(1_234, false);
        let second = TransactionAggregate {
            transaction_count: 2,
            error_count: 1,
            total_duration_nanos: 2_345,
            duration_nanos_histogram: DurationHistogram::from_values([1_000, 1_345]),
        };
        let mut overall = first.clone();
        overall.merge(&second);
        vec![
            MetricPoint::transaction(SeriesKey::transaction("Web", "/a"), capture_time, first),
            MetricPoint::transaction(SeriesKey::transaction("Web", "/b"), capture_time, second),
            MetricPoint::transaction(SeriesKey::transaction_overall("Web"), capture_time, overall),
        ]
    }

    async fn named_aggregate(store: &RollupStore, name: &str) -> TransactionAggregate {
        let points = store
            .read_aggregates("", &SeriesKey::transaction("Web", name), 0, 300_000, 1)
            .await
            .unwrap();
        assert_eq!(points.len(), 1);
        match &points[0].payload {
            Payload::Transaction(aggregate) => aggregate.clone(),
            other => panic!("expected transaction payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transaction_rollup_scenario() {
        let (_, store) = memory_store();
        store.store("", &transaction_points(MINUTE)).await.unwrap();
        store.store("", &transaction_points(2 * MINUTE)).await.unwrap();

        let summary = store.rollup(300_001).await.unwrap();
        assert_eq!(summary.scopes, 1);
        assert_eq!(summary.compaction.buckets_compacted, 3);

        let overall = store
            .read_aggregates("", &SeriesKey::transaction_overall("Web"), 0, 300_000, 1)
            .await
            .unwrap();
        assert_eq!(overall.len(), 1);
        assert_eq!(overall[0].capture_time, 300_000);
        let Payload::Transaction(aggregate) = &overall[0].payload else {
            panic!("expected transaction payload");
        };
        assert_eq!(aggregate.transaction_count, 6);
        assert_eq!(aggregate.total_duration_nanos, 7_158);
        assert_eq!(aggregate.error_count, 2);
        assert_eq!(aggregate.duration_nanos_histogram.total_count(), 6);

        let a = named_aggregate(&store, "/a").await;
        assert_eq!(a.transaction_count, 2);
        assert_eq!(a.total_duration_nanos, 1_234 * 2);
        assert_eq!(a.error_count, 0);
        let b = named_aggregate(&store, "/b").await;
        assert_eq!(b.transaction_count, 4);
        assert_eq!(b.total_duration_nanos, 2_345 * 2);
        assert_eq!(b.error_count, 2);
    }

    #[tokio::test]
    async fn test_weighted_average_rollup() {
        let (backend, store) = memory_store();
        let points = [
            MetricPoint::gauge("heap", MINUTE, 10.0, 1),
            MetricPoint::gauge("heap", 2 * MINUTE, 40.0, 3),
        ];
        store.store("shop", &points).await.unwrap();
        store.rollup(5 * MINUTE).await.unwrap();

        let aggregates = store
            .read_aggregates("shop", &SeriesKey::gauge("heap"), 0, 5 * MINUTE, 1)
            .await
            .unwrap();
        let value = gauge_value(&aggregates[0]);
        assert!((value.value - 32.5).abs() < 1e-9);
        assert_eq!(value.weight, 4);
        // level 2 bucket (ends at 30 minutes) is not due yet
        assert_eq!(backend.work_item_count(), 1);
    }

    #[tokio::test]
    async fn test_boundary_point_belongs_to_bucket_ending_there() {
        let (_, store) = memory_store();
        let points = [
            MetricPoint::gauge("heap", 5 * MINUTE, 1.0, 1),
            MetricPoint::gauge("heap", 5 * MINUTE + 1, 100.0, 1),
        ];
        store.store("shop", &points).await.unwrap();
        store.rollup(10 * MINUTE).await.unwrap();

        let aggregates = store
            .read_aggregates("shop", &SeriesKey::gauge("heap"), 0, 10 * MINUTE, 1)
            .await
            .unwrap();
        let buckets: Vec<(i64, f64)> = aggregates
            .iter()
            .map(|point| (point.capture_time, gauge_value(point).value))
            .collect();
        assert_eq!(buckets, vec![(5 * MINUTE, 1.0), (10 * MINUTE, 100.0)]);
    }

    #[tokio::test]
    async fn test_compaction_is_idempotent() {
        let (_, store) = memory_store();
        let point = MetricPoint::gauge("heap", MINUTE, 7.0, 2);
        store.store("shop", &[point.clone()]).await.unwrap();
        store.compact(1, "shop", 5 * MINUTE).await.unwrap();
        let first = store
            .read_aggregates("shop", &SeriesKey::gauge("heap"), 0, 5 * MINUTE, 1)
            .await
            .unwrap();

        // re-ingesting the same point re-enqueues the bucket
        store.store("shop", &[point]).await.unwrap();
        let summary = store.compact(1, "shop", 5 * MINUTE).await.unwrap();
        assert_eq!(summary.buckets_compacted, 1);
        let second = store
            .read_aggregates("shop", &SeriesKey::gauge("heap"), 0, 5 * MINUTE, 1)
            .await
            .unwrap();
        assert_eq!(first, second);

        assert_eq!(
            store.compact(1, "shop", 5 * MINUTE).await.unwrap(),
            CompactionSummary::default()
        );
    }

    #[tokio::test]
    async fn test_zero_weight_bucket_is_retired_without_aggregate() {
        let (backend, store) = memory_store();
        store
            .store("shop", &[MetricPoint::gauge("idle", MINUTE, 3.0, 0)])
            .await
            .unwrap();
        let summary = store.compact(1, "shop", 5 * MINUTE).await.unwrap();
        assert_eq!(summary.empty_buckets, 1);
        assert_eq!(summary.buckets_compacted, 0);
        assert_eq!(backend.work_item_count(), 1); // level 2 only
        let aggregates = store
            .read_aggregates("shop", &SeriesKey::gauge("idle"), 0, 5 * MINUTE, 1)
            .await
            .unwrap();
        assert!(aggregates.is_empty());
    }

    #[tokio::test]
    async fn test_store_rejects_mismatched_payload() {
        let (backend, store) = memory_store();
        let mut point = MetricPoint::gauge("heap", MINUTE, 1.0, 1);
        point.series_key = SeriesKey::transaction_overall("Web");
        assert!(matches!(
            store.store("shop", &[point]).await,
            Err(Error::Validation(_))
        ));
        assert_eq!(backend.point_count(), 0);
        assert!(backend.scopes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_deduplicates_work_items() {
        let (backend, store) = memory_store();
        let points = [
            MetricPoint::gauge("heap", MINUTE, 1.0, 1),
            MetricPoint::gauge("heap", 2 * MINUTE, 2.0, 1),
            MetricPoint::gauge("heap", 3 * MINUTE, 3.0, 1),
        ];
        store.store("shop", &points).await.unwrap();
        // one level 1 bucket and one level 2 bucket
        assert_eq!(backend.work_item_count(), 2);
        assert_eq!(backend.point_count(), 3);
    }

    #[tokio::test]
    async fn test_read_aggregates_is_inclusive() {
        let (_, store) = memory_store();
        let points = [
            MetricPoint::gauge("heap", MINUTE, 1.0, 1),
            MetricPoint::gauge("heap", 2 * MINUTE, 2.0, 1),
            MetricPoint::gauge("heap", 3 * MINUTE, 3.0, 1),
        ];
        store.store("shop", &points).await.unwrap();
        let read = store
            .read_aggregates("shop", &SeriesKey::gauge("heap"), MINUTE, 2 * MINUTE, 0)
            .await
            .unwrap();
        assert_eq!(read.len(), 2);
        assert!(store
            .read_aggregates("shop", &SeriesKey::gauge("heap"), 0, MINUTE, 7)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_gauge_names_skip_transactions_and_other_scopes() {
        let (_, store) = memory_store();
        let mut points = transaction_points(MINUTE);
        points.push(MetricPoint::gauge("threads", MINUTE, 12.0, 1));
        points.push(MetricPoint::gauge("heap", MINUTE, 1.0, 1));
        points.push(MetricPoint::gauge("heap", 2 * MINUTE, 2.0, 1));
        store.store("shop", &points).await.unwrap();
        store
            .store("blog", &[MetricPoint::gauge("cpu", MINUTE, 0.5, 1)])
            .await
            .unwrap();

        assert_eq!(
            store.gauge_names("shop").await.unwrap(),
            vec!["heap".to_string(), "threads".to_string()]
        );
        assert_eq!(store.gauge_names("blog").await.unwrap(), vec!["cpu".to_string()]);
        assert!(store.gauge_names("none").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_expired_uses_level_retention() {
        let (backend, store) = memory_store();
        store
            .store("shop", &[MetricPoint::gauge("heap", MINUTE, 1.0, 1)])
            .await
            .unwrap();
        store.rollup(5 * MINUTE).await.unwrap();
        assert_eq!(backend.point_count(), 2);

        // past level 0 retention (48h) but within level 1 (14 days)
        let purged = store.purge_expired(MINUTE + 48 * 60 * MINUTE).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(backend.point_count(), 1);
    }

    #[tokio::test]
    async fn test_try_rollup_skips_while_guard_is_held() {
        let (_, store) = memory_store();
        store
            .store("shop", &[MetricPoint::gauge("heap", MINUTE, 1.0, 1)])
            .await
            .unwrap();

        let lease = store.guard().try_acquire().unwrap();
        assert!(store.guard().try_acquire().is_none());
        assert_eq!(store.try_rollup(5 * MINUTE).await.unwrap(), None);
        drop(lease);

        assert!(!store.guard().is_running());
        let summary = store.try_rollup(5 * MINUTE).await.unwrap().unwrap();
        assert_eq!(summary.compaction.buckets_compacted, 1);
    }

    #[tokio::test]
    async fn test_auto_rollup_on_store() {
        let backend = Arc::new(MemoryBackend::new());
        let store =
            RollupStore::new(backend.clone(), backend.clone(), levels()).with_auto_rollup(true);
        store
            .store("shop", &[MetricPoint::gauge("heap", MINUTE, 1.0, 1)])
            .await
            .unwrap();
        // bucket ending at 5 minutes is not due until a point at 6 minutes arrives
        assert_eq!(backend.point_count(), 1);
        store
            .store("shop", &[MetricPoint::gauge("heap", 6 * MINUTE, 2.0, 1)])
            .await
            .unwrap();
        let aggregates = store
            .read_aggregates("shop", &SeriesKey::gauge("heap"), 0, 5 * MINUTE, 1)
            .await
            .unwrap();
        assert_eq!(aggregates.len(), 1);
    }

    /// Memory backend that can simulate late data and targeted failures
    #[derive(Default)]
    struct FaultyBackend {
        inner: MemoryBackend,
        refresh_on_upsert: AtomicBool,
        failing_scope: Option<String>,
        failing_series: Option<SeriesKey>,
    }

    #[async_trait]
    impl RollupBackend for FaultyBackend {
        async fn write_batch(
            &self,
            agent_scope: &str,
            points: &[AggregatePoint],
            work_items: &[RollupWorkItem],
            last_capture_time: i64,
        ) -> Result<()> {
            self.inner
                .write_batch(agent_scope, points, work_items, last_capture_time)
                .await
        }

        async fn read_points(
            &self,
            agent_scope: &str,
            series_key: &SeriesKey,
            level: usize,
            after: i64,
            until: i64,
        ) -> Result<Vec<AggregatePoint>> {
            if self.failing_series.as_ref() == Some(series_key) {
                return Err(Error::storage("corrupt row"));
            }
            self.inner
                .read_points(agent_scope, series_key, level, after, until)
                .await
        }

        async fn upsert_point(&self, point: &AggregatePoint) -> Result<()> {
            self.inner.upsert_point(point).await?;
            if self.refresh_on_upsert.swap(false, Ordering::SeqCst) {
                let refreshed = RollupWorkItem {
                    agent_scope: point.agent_scope.clone(),
                    level: point.level,
                    bucket_end_time: point.capture_time,
                    series_key: point.series_key.clone(),
                    update_token: Uuid::now_v7(),
                };
                self.inner
                    .write_batch(&point.agent_scope, &[], &[refreshed], 0)
                    .await?;
            }
            Ok(())
        }

        async fn read_due_work_items(
            &self,
            agent_scope: &str,
            level: usize,
            not_after: i64,
        ) -> Result<Vec<RollupWorkItem>> {
            if level == 1 && self.failing_scope.as_deref() == Some(agent_scope) {
                return Err(Error::storage("timeout"));
            }
            self.inner
                .read_due_work_items(agent_scope, level, not_after)
                .await
        }

        async fn delete_work_item_if(&self, item: &RollupWorkItem) -> Result<bool> {
            self.inner.delete_work_item_if(item).await
        }

        async fn purge_expired(&self, now: i64) -> Result<u64> {
            self.inner.purge_expired(now).await
        }
    }

    #[async_trait]
    impl ScopeCatalog for FaultyBackend {
        async fn scopes(&self) -> Result<Vec<String>> {
            self.inner.scopes().await
        }

        async fn series(&self, agent_scope: &str) -> Result<Vec<SeriesKey>> {
            self.inner.series(agent_scope).await
        }
    }

    #[tokio::test]
    async fn test_refreshed_work_item_survives_compaction() {
        let backend = Arc::new(FaultyBackend::default());
        let store = RollupStore::new(backend.clone(), backend.clone(), levels());
        store
            .store("shop", &[MetricPoint::gauge("heap", MINUTE, 1.0, 1)])
            .await
            .unwrap();

        backend.refresh_on_upsert.store(true, Ordering::SeqCst);
        let summary = store.compact(1, "shop", 5 * MINUTE).await.unwrap();
        assert_eq!(summary.buckets_compacted, 1);
        assert_eq!(summary.retried, 1);

        let summary = store.compact(1, "shop", 5 * MINUTE).await.unwrap();
        assert_eq!(summary.retried, 0);
        assert_eq!(
            store.compact(1, "shop", 5 * MINUTE).await.unwrap(),
            CompactionSummary::default()
        );
    }

    #[tokio::test]
    async fn test_failing_scope_does_not_stop_the_sweep() {
        let backend = Arc::new(FaultyBackend {
            failing_scope: Some("bad".to_string()),
            ..FaultyBackend::default()
        });
        let store = RollupStore::new(backend.clone(), backend.clone(), levels());
        for scope in ["bad", "good"] {
            store
                .store(scope, &[MetricPoint::gauge("heap", MINUTE, 1.0, 1)])
                .await
                .unwrap();
        }

        let summary = store.rollup(30 * MINUTE).await.unwrap();
        assert_eq!(summary.scopes, 2);
        assert_eq!(summary.failed_scopes, 1);
        // good scope rolled up to both coarser levels, bad scope to neither
        assert_eq!(summary.compaction.buckets_compacted, 2);
        let bad_level_2 = store
            .read_aggregates("bad", &SeriesKey::gauge("heap"), 0, 30 * MINUTE, 2)
            .await
            .unwrap();
        assert!(bad_level_2.is_empty());
    }

    #[tokio::test]
    async fn test_failing_bucket_does_not_stop_its_level() {
        let backend = Arc::new(FaultyBackend {
            failing_series: Some(SeriesKey::gauge("a_bad")),
            ..FaultyBackend::default()
        });
        let store = RollupStore::new(backend.clone(), backend.clone(), levels());
        let points = [
            MetricPoint::gauge("a_bad", MINUTE, 1.0, 1),
            MetricPoint::gauge("b_good", MINUTE, 2.0, 1),
        ];
        store.store("shop", &points).await.unwrap();

        let summary = store.compact(1, "shop", 5 * MINUTE).await.unwrap();
        assert_eq!(summary.buckets_compacted, 1);
        assert_eq!(summary.failed, 1);
        let good = store
            .read_aggregates("shop", &SeriesKey::gauge("b_good"), 0, 5 * MINUTE, 1)
            .await
            .unwrap();
        assert_eq!(good.len(), 1);
        // the failed bucket stays queued next to both level 2 buckets
        assert_eq!(backend.inner.work_item_count(), 3);

        let summary = store.rollup(30 * MINUTE).await.unwrap();
        assert_eq!(summary.failed_scopes, 0);
        assert_eq!(summary.compaction.buckets_compacted, 1);
        assert_eq!(summary.compaction.failed, 2);
        let good_level_2 = store
            .read_aggregates("shop", &SeriesKey::gauge("b_good"), 0, 30 * MINUTE, 2)
            .await
            .unwrap();
        assert_eq!(good_level_2.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_compactions_agree() {
        let (backend, store) = memory_store();
        store
            .store("shop", &[MetricPoint::gauge("heap", MINUTE, 4.0, 2)])
            .await
            .unwrap();
        let (a, b) = tokio::join!(
            store.compact(1, "shop", 5 * MINUTE),
            store.compact(1, "shop", 5 * MINUTE)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.buckets_compacted + b.buckets_compacted >= 1);
        assert_eq!(backend.work_item_count(), 1);
        let aggregates = store
            .read_aggregates("shop", &SeriesKey::gauge("heap"), 0, 5 * MINUTE, 1)
            .await
            .unwrap();
        assert_eq!(aggregates.len(), 1);
        assert_eq!(gauge_value(&aggregates[0]).value, 4.0);
    }
}
