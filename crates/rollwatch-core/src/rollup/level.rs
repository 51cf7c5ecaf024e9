//! Rollup levels and query level selection

use crate::config::RollupLevelConfig;
use crate::error::{Error, Result};

const MILLIS_PER_HOUR: i64 = 60 * 60 * 1000;

/// One rollup level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollupLevel {
    /// Bucket width; level 0 is the raw capture resolution
    pub interval_millis: i64,
    /// Smallest query range served from this level
    pub view_threshold_millis: i64,
    /// Hours a point at this level is kept
    pub retention_hours: u64,
}

impl RollupLevel {
    /// End of the bucket containing `time`: `ceil(time / interval) * interval`.
    ///
    /// A time exactly on a boundary belongs to the bucket ending there.
    pub fn bucket_end(&self, time: i64) -> i64 {
        let remainder = time.rem_euclid(self.interval_millis);
        if remainder == 0 {
            time
        } else {
            time - remainder + self.interval_millis
        }
    }

    /// Latest bucket end at or before `time`
    pub fn floor(&self, time: i64) -> i64 {
        time - time.rem_euclid(self.interval_millis)
    }

    /// Expiry for a row captured (or bucketed) at `time`
    pub fn expires_at(&self, time: i64) -> i64 {
        let retention = i64::try_from(self.retention_hours)
            .unwrap_or(i64::MAX)
            .saturating_mul(MILLIS_PER_HOUR);
        time.saturating_add(retention)
    }
}

/// Validated, ordered rollup level table (level 0 first)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupLevels {
    levels: Vec<RollupLevel>,
}

impl RollupLevels {
    /// Validate and convert the configured levels.
    ///
    /// Intervals must strictly increase with each a multiple of the previous;
    /// view thresholds and retention must not decrease.
    pub fn from_config(levels: &[RollupLevelConfig]) -> Result<Self> {
        let levels = levels
            .iter()
            .map(|level| {
                Ok(RollupLevel {
                    interval_millis: duration_millis(level.interval)?,
                    view_threshold_millis: duration_millis(level.view_threshold)?,
                    retention_hours: level.retention_hours,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(levels)
    }

    /// Validate an explicit level table
    pub fn new(levels: Vec<RollupLevel>) -> Result<Self> {
        let Some(first) = levels.first() else {
            return Err(Error::config("at least one rollup level is required"));
        };
        if first.interval_millis <= 0 {
            return Err(Error::config("rollup level 0 interval must be positive"));
        }
        for (i, pair) in levels.windows(2).enumerate() {
            let (finer, coarser) = (pair[0], pair[1]);
            let level = i + 1;
            if coarser.interval_millis <= finer.interval_millis {
                return Err(Error::config(format!(
                    "rollup level {level} interval must be greater than level {i}"
                )));
            }
            if coarser.interval_millis % finer.interval_millis != 0 {
                return Err(Error::config(format!(
                    "rollup level {level} interval must be a multiple of level {i}"
                )));
            }
            if coarser.view_threshold_millis < finer.view_threshold_millis {
                return Err(Error::config(format!(
                    "rollup level {level} view threshold is smaller than level {i}"
                )));
            }
            if coarser.retention_hours < finer.retention_hours {
                return Err(Error::config(format!(
                    "rollup level {level} retention is shorter than level {i}"
                )));
            }
        }
        Ok(Self { levels })
    }

    /// Number of levels, including level 0
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Always false for a validated table
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Level by index
    pub fn get(&self, level: usize) -> Option<&RollupLevel> {
        self.levels.get(level)
    }

    /// Look up a level, failing with a validation error when out of range
    pub fn level(&self, level: usize) -> Result<&RollupLevel> {
        self.levels.get(level).ok_or_else(|| {
            Error::validation(format!(
                "rollup level {level} does not exist (0..{})",
                self.levels.len()
            ))
        })
    }

    /// Raw level
    pub fn base(&self) -> &RollupLevel {
        &self.levels[0]
    }

    /// Levels with their indices, finest first
    pub fn iter(&self) -> impl Iterator<Item = (usize, &RollupLevel)> {
        self.levels.iter().enumerate()
    }
}

fn duration_millis(duration: std::time::Duration) -> Result<i64> {
    i64::try_from(duration.as_millis())
        .map_err(|_| Error::config(format!("duration {duration:?} is too large")))
}

/// Maps a query range to the coarsest level that still has enough resolution
#[derive(Debug, Clone)]
pub struct RollupLevelSelector {
    levels: RollupLevels,
}

impl RollupLevelSelector {
    /// Selector over a validated level table
    pub fn new(levels: RollupLevels) -> Self {
        Self { levels }
    }

    /// Coarsest level whose view threshold fits in `to_time - from_time`, else 0
    pub fn select_level(&self, from_time: i64, to_time: i64) -> usize {
        let width = to_time.saturating_sub(from_time);
        self.levels
            .iter()
            .skip(1)
            .filter(|(_, level)| width >= level.view_threshold_millis)
            .map(|(index, _)| index)
            .last()
            .unwrap_or(0)
    }
}
