//! Wiring of storage, rollup, alerting and scheduling from a [`Config`]

use std::sync::Arc;

use tracing::info;

use crate::alerting::{AlertEvaluator, NotificationDispatcher};
use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::rollup::{RollupLevelSelector, RollupLevels, RollupStore};
use crate::scheduler::Scheduler;

/// The assembled service
pub struct Engine {
    db: Database,
    store: Arc<RollupStore>,
    evaluator: Arc<AlertEvaluator>,
    scheduler: Arc<Scheduler>,
}

impl Engine {
    /// Connect to the configured backend and assemble the engine
    pub async fn new(config: &Config) -> Result<Self> {
        let db = Database::new(config).await?;
        Self::with_database(config, db)
    }

    /// Assemble the engine on an already opened database
    pub fn with_database(config: &Config, db: Database) -> Result<Self> {
        let levels = RollupLevels::from_config(&config.rollup.levels)?;
        let store = Arc::new(
            RollupStore::new(db.rollups.clone(), db.scopes.clone(), levels)
                .with_auto_rollup(config.rollup.auto_rollup_on_store),
        );

        let dispatcher = NotificationDispatcher::from_config(&config.smtp)?;
        let evaluator = Arc::new(
            AlertEvaluator::new(
                store.clone(),
                db.scopes.clone(),
                db.alert_configs.clone(),
                db.triggered_alerts.clone(),
                dispatcher,
            )
            .with_max_concurrency(config.alerting.max_concurrency),
        );

        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            store.clone(),
            evaluator.clone(),
        ));

        Ok(Self {
            db,
            store,
            evaluator,
            scheduler,
        })
    }

    /// Check storage, then run the background loops until shutdown
    pub async fn start(&self) -> Result<()> {
        info!("Starting Rollwatch...");
        self.db.health_check().await?;
        info!("Database connection healthy");

        self.scheduler.start().await;
        Ok(())
    }

    /// Ask the scheduler loops to exit
    pub async fn stop(&self) {
        self.scheduler.stop().await;
    }

    /// Storage bundle
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Rollup store
    pub fn store(&self) -> Arc<RollupStore> {
        self.store.clone()
    }

    /// Alert evaluator
    pub fn evaluator(&self) -> Arc<AlertEvaluator> {
        self.evaluator.clone()
    }

    /// Background scheduler
    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    /// Level serving a query over `[from_time, to_time]`
    pub fn select_level(&self, from_time: i64, to_time: i64) -> usize {
        RollupLevelSelector::new(self.store.levels().clone()).select_level(from_time, to_time)
    }
}
