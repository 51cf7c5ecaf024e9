//! Storage layer for Rollwatch
//!
//! The engine only talks to the traits below. Two implementations exist:
//! PostgreSQL (durable, shared between processes) and an in-process store
//! used by tests and `--in-memory` runs.

mod memory;
mod postgres;

pub use memory::MemoryBackend;
pub use postgres::{PgRollupBackend, PostgresPool};

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::alerting::AlertRepository;
use crate::config::{Config, DatabaseBackend};
use crate::error::Result;
use crate::models::{
    AggregatePoint, AlertConfig, AlertKind, RollupWorkItem, SeriesKey, TriggeredAlert,
};

/// Points and rollup work items
#[async_trait]
pub trait RollupBackend: Send + Sync {
    /// Atomically write level-0 points, upsert work items and record the scope
    async fn write_batch(
        &self,
        agent_scope: &str,
        points: &[AggregatePoint],
        work_items: &[RollupWorkItem],
        last_capture_time: i64,
    ) -> Result<()>;

    /// Points of one series at one level with `after < capture_time <= until`,
    /// ordered by capture time
    async fn read_points(
        &self,
        agent_scope: &str,
        series_key: &SeriesKey,
        level: usize,
        after: i64,
        until: i64,
    ) -> Result<Vec<AggregatePoint>>;

    /// Insert or replace a single point
    async fn upsert_point(&self, point: &AggregatePoint) -> Result<()>;

    /// Work items at `level` whose bucket ends at or before `not_after`
    async fn read_due_work_items(
        &self,
        agent_scope: &str,
        level: usize,
        not_after: i64,
    ) -> Result<Vec<RollupWorkItem>>;

    /// Delete the work item only if its token still matches.
    /// Returns whether this call removed it.
    async fn delete_work_item_if(&self, item: &RollupWorkItem) -> Result<bool>;

    /// Delete points with `expires_at <= now`; returns the number removed
    async fn purge_expired(&self, now: i64) -> Result<u64>;
}

/// Agent scopes that have stored data
#[async_trait]
pub trait ScopeCatalog: Send + Sync {
    /// Every scope that has stored points, sorted
    async fn scopes(&self) -> Result<Vec<String>>;

    /// Distinct series with points at any level in one scope, sorted
    async fn series(&self, agent_scope: &str) -> Result<Vec<SeriesKey>>;
}

/// Durable triggered-alert state with conditional transitions
#[async_trait]
pub trait TriggeredAlertRepository: Send + Sync {
    async fn exists(&self, agent_scope: &str, alert_config_version: &str) -> Result<bool>;

    /// Returns true only if the row did not exist and this call created it
    async fn insert_if_absent(&self, alert: &TriggeredAlert) -> Result<bool>;

    /// Returns true only if the row existed and this call removed it
    async fn delete_if_present(&self, agent_scope: &str, alert_config_version: &str)
        -> Result<bool>;

    async fn list(&self, agent_scope: Option<&str>) -> Result<Vec<TriggeredAlert>>;
}

/// Where alert configs come from
#[async_trait]
pub trait AlertConfigSource: Send + Sync {
    /// Configs of a scope, all kinds
    async fn alert_configs(&self, agent_scope: &str) -> Result<Vec<AlertConfig>>;

    async fn all_alert_configs(&self) -> Result<Vec<AlertConfig>>;

    async fn alert_config(&self, id: Uuid) -> Result<Option<AlertConfig>>;

    /// Insert or replace by id
    async fn save_alert_config(&self, config: &AlertConfig) -> Result<()>;

    /// Returns whether a config was removed
    async fn delete_alert_config(&self, id: Uuid) -> Result<bool>;
}

/// Configs of one kind for a scope
pub async fn alert_configs_of_kind(
    source: &dyn AlertConfigSource,
    agent_scope: &str,
    kind: AlertKind,
) -> Result<Vec<AlertConfig>> {
    Ok(source
        .alert_configs(agent_scope)
        .await?
        .into_iter()
        .filter(|config| config.kind == kind)
        .collect())
}

/// Storage bundle
#[derive(Clone)]
pub struct Database {
    /// Points and work items
    pub rollups: Arc<dyn RollupBackend>,
    /// Scopes and their series
    pub scopes: Arc<dyn ScopeCatalog>,
    /// Triggered-state rows
    pub triggered_alerts: Arc<dyn TriggeredAlertRepository>,
    /// Alert configs
    pub alert_configs: Arc<dyn AlertConfigSource>,
    /// Present for the PostgreSQL backend
    pub postgres: Option<PostgresPool>,
}

impl Database {
    /// Connect to the configured backend
    pub async fn new(config: &Config) -> Result<Self> {
        match config.database.backend {
            DatabaseBackend::Postgres => {
                let pool = PostgresPool::new(&config.database).await?;
                let rollups = Arc::new(PgRollupBackend::new(&pool));
                let alerts = Arc::new(AlertRepository::new(&pool));
                Ok(Self {
                    rollups: rollups.clone(),
                    scopes: rollups,
                    triggered_alerts: alerts.clone(),
                    alert_configs: alerts,
                    postgres: Some(pool),
                })
            }
            DatabaseBackend::Memory => Ok(Self::in_memory(config.alerts.clone())),
        }
    }

    /// Process-local store seeded with static alert configs
    pub fn in_memory(alert_configs: Vec<AlertConfig>) -> Self {
        Self::from_memory(Arc::new(MemoryBackend::with_alert_configs(alert_configs)))
    }

    /// Wrap an existing in-memory store
    pub fn from_memory(backend: Arc<MemoryBackend>) -> Self {
        Self {
            rollups: backend.clone(),
            scopes: backend.clone(),
            triggered_alerts: backend.clone(),
            alert_configs: backend,
            postgres: None,
        }
    }

    /// Run database migrations; nothing to do in memory
    pub async fn migrate(&self) -> Result<()> {
        match &self.postgres {
            Some(pool) => pool.migrate().await,
            None => Ok(()),
        }
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<()> {
        match &self.postgres {
            Some(pool) => pool.health_check().await,
            None => Ok(()),
        }
    }
}
