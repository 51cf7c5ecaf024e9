//! Hierarchical rollup engine
//!
//! Raw points land at level 0. Every store enqueues a work item for each
//! coarser bucket the point falls into, and compaction passes turn those
//! items into aggregates built from the next finer level.

mod level;
mod store;

pub use level::{RollupLevel, RollupLevelSelector, RollupLevels};
pub use store::{CompactionSummary, RollupGuard, RollupLease, RollupStore, RollupSummary};

/// Current wall clock time in epoch millis
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
