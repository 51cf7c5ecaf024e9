//! # Rollwatch
//!
//! Hierarchical rollup storage and threshold alerting for APM metrics.
//!
//! Raw gauge samples and transaction aggregates are stored at the finest
//! level and compacted into progressively coarser levels. Alerts read the
//! coarsest level that covers their window.
//!
//! ## Architecture
//!
//! - **Rollup**: level table, bucket math, incremental compaction
//! - **Alerting**: transaction percentile and gauge average checks with
//!   triggered-state hysteresis, notification formatting and delivery
//! - **Storage**: PostgreSQL via sqlx, or process-local for development
//! - **Scheduler**: background loops for rollup, alerts, and retention
//!
//! ## Quick Start
//!
//! ```bash
//! # Run the background loops against an in-memory store
//! rollwatch --in-memory serve
//!
//! # Compact everything that is due
//! rollwatch rollup
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod alerting;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod rollup;
pub mod scheduler;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::alerting::{AlertEvaluator, NotificationDispatcher};
    pub use crate::config::Config;
    pub use crate::db::Database;
    pub use crate::engine::Engine;
    pub use crate::error::{Error, Result};
    pub use crate::models::*;
    pub use crate::rollup::{RollupLevelSelector, RollupLevels, RollupStore};
    pub use crate::scheduler::Scheduler;
}
