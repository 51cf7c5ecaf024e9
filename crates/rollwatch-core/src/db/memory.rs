//! In-process storage backend

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{AggregatePoint, AlertConfig, RollupWorkItem, SeriesKey, TriggeredAlert};

use super::{AlertConfigSource, RollupBackend, ScopeCatalog, TriggeredAlertRepository};

/// `(scope, series, level, capture_time)`
type PointKey = (String, SeriesKey, usize, i64);
/// `(scope, level, bucket_end_time, series)`
type WorkItemKey = (String, usize, i64, SeriesKey);

/// Everything kept in process memory.
///
/// Lock order is points, then work items. No lock is held across an await.
#[derive(Default)]
pub struct MemoryBackend {
    points: RwLock<BTreeMap<PointKey, AggregatePoint>>,
    work_items: Mutex<BTreeMap<WorkItemKey, Uuid>>,
    scopes: DashMap<String, i64>,
    triggered: DashMap<(String, String), DateTime<Utc>>,
    alert_configs: RwLock<Vec<AlertConfig>>,
}

impl MemoryBackend {
    /// Empty backend with no alert configs
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty backend serving the given alert configs
    pub fn with_alert_configs(alert_configs: Vec<AlertConfig>) -> Self {
        Self {
            alert_configs: RwLock::new(alert_configs),
            ..Self::default()
        }
    }

    /// Number of stored points across all levels
    pub fn point_count(&self) -> usize {
        self.points.read().len()
    }

    /// Number of pending work items
    pub fn work_item_count(&self) -> usize {
        self.work_items.lock().len()
    }

    fn point_key(point: &AggregatePoint) -> PointKey {
        (
            point.agent_scope.clone(),
            point.series_key.clone(),
            point.level,
            point.capture_time,
        )
    }

    fn work_item_key(item: &RollupWorkItem) -> WorkItemKey {
        (
            item.agent_scope.clone(),
            item.level,
            item.bucket_end_time,
            item.series_key.clone(),
        )
    }
}

#[async_trait]
impl RollupBackend for MemoryBackend {
    async fn write_batch(
        &self,
        agent_scope: &str,
        points: &[AggregatePoint],
        work_items: &[RollupWorkItem],
        last_capture_time: i64,
    ) -> Result<()> {
        {
            let mut stored_points = self.points.write();
            let mut stored_items = self.work_items.lock();
            for point in points {
                stored_points.insert(Self::point_key(point), point.clone());
            }
            for item in work_items {
                stored_items.insert(Self::work_item_key(item), item.update_token);
            }
        }
        self.scopes
            .entry(agent_scope.to_string())
            .and_modify(|latest| *latest = (*latest).max(last_capture_time))
            .or_insert(last_capture_time);
        Ok(())
    }

    async fn read_points(
        &self,
        agent_scope: &str,
        series_key: &SeriesKey,
        level: usize,
        after: i64,
        until: i64,
    ) -> Result<Vec<AggregatePoint>> {
        if after >= until {
            return Ok(Vec::new());
        }
        let start = (agent_scope.to_string(), series_key.clone(), level, after + 1);
        let end = (agent_scope.to_string(), series_key.clone(), level, until);
        Ok(self
            .points
            .read()
            .range(start..=end)
            .map(|(_, point)| point.clone())
            .collect())
    }

    async fn upsert_point(&self, point: &AggregatePoint) -> Result<()> {
        self.points
            .write()
            .insert(Self::point_key(point), point.clone());
        Ok(())
    }

    async fn read_due_work_items(
        &self,
        agent_scope: &str,
        level: usize,
        not_after: i64,
    ) -> Result<Vec<RollupWorkItem>> {
        Ok(self
            .work_items
            .lock()
            .iter()
            .filter(|((scope, item_level, bucket_end_time, _), _)| {
                scope == agent_scope && *item_level == level && *bucket_end_time <= not_after
            })
            .map(
                |((scope, item_level, bucket_end_time, series_key), token)| RollupWorkItem {
                    agent_scope: scope.clone(),
                    level: *item_level,
                    bucket_end_time: *bucket_end_time,
                    series_key: series_key.clone(),
                    update_token: *token,
                },
            )
            .collect())
    }

    async fn delete_work_item_if(&self, item: &RollupWorkItem) -> Result<bool> {
        let mut work_items = self.work_items.lock();
        let key = Self::work_item_key(item);
        if work_items.get(&key) == Some(&item.update_token) {
            work_items.remove(&key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn purge_expired(&self, now: i64) -> Result<u64> {
        let mut points = self.points.write();
        let before = points.len();
        points.retain(|_, point| point.expires_at > now);
        Ok((before - points.len()) as u64)
    }
}

#[async_trait]
impl ScopeCatalog for MemoryBackend {
    async fn scopes(&self) -> Result<Vec<String>> {
        let mut scopes: Vec<String> = self.scopes.iter().map(|entry| entry.key().clone()).collect();
        scopes.sort();
        Ok(scopes)
    }

    async fn series(&self, agent_scope: &str) -> Result<Vec<SeriesKey>> {
        let series: BTreeSet<SeriesKey> = self
            .points
            .read()
            .keys()
            .filter(|(scope, ..)| scope == agent_scope)
            .map(|(_, series_key, ..)| series_key.clone())
            .collect();
        Ok(series.into_iter().collect())
    }
}

#[async_trait]
impl TriggeredAlertRepository for MemoryBackend {
    async fn exists(&self, agent_scope: &str, alert_config_version: &str) -> Result<bool> {
        Ok(self
            .triggered
            .contains_key(&(agent_scope.to_string(), alert_config_version.to_string())))
    }

    async fn insert_if_absent(&self, alert: &TriggeredAlert) -> Result<bool> {
        let key = (alert.agent_scope.clone(), alert.alert_config_version.clone());
        match self.triggered.entry(key) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                entry.insert(alert.triggered_at);
                Ok(true)
            }
        }
    }

    async fn delete_if_present(
        &self,
        agent_scope: &str,
        alert_config_version: &str,
    ) -> Result<bool> {
        Ok(self
            .triggered
            .remove(&(agent_scope.to_string(), alert_config_version.to_string()))
            .is_some())
    }

    async fn list(&self, agent_scope: Option<&str>) -> Result<Vec<TriggeredAlert>> {
        let mut alerts: Vec<TriggeredAlert> = self
            .triggered
            .iter()
            .filter(|entry| agent_scope.map_or(true, |scope| entry.key().0 == scope))
            .map(|entry| TriggeredAlert {
                agent_scope: entry.key().0.clone(),
                alert_config_version: entry.key().1.clone(),
                triggered_at: *entry.value(),
            })
            .collect();
        alerts.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at));
        Ok(alerts)
    }
}

#[async_trait]
impl AlertConfigSource for MemoryBackend {
    async fn alert_configs(&self, agent_scope: &str) -> Result<Vec<AlertConfig>> {
        Ok(self
            .alert_configs
            .read()
            .iter()
            .filter(|config| config.agent_scope == agent_scope)
            .cloned()
            .collect())
    }

    async fn all_alert_configs(&self) -> Result<Vec<AlertConfig>> {
        Ok(self.alert_configs.read().clone())
    }

    async fn alert_config(&self, id: Uuid) -> Result<Option<AlertConfig>> {
        Ok(self
            .alert_configs
            .read()
            .iter()
            .find(|config| config.id == id)
            .cloned())
    }

    async fn save_alert_config(&self, config: &AlertConfig) -> Result<()> {
        let mut configs = self.alert_configs.write();
        match configs.iter_mut().find(|existing| existing.id == config.id) {
            Some(existing) => *existing = config.clone(),
            None => configs.push(config.clone()),
        }
        Ok(())
    }

    async fn delete_alert_config(&self, id: Uuid) -> Result<bool> {
        let mut configs = self.alert_configs.write();
        let before = configs.len();
        configs.retain(|config| config.id != id);
        Ok(configs.len() != before)
    }
}
