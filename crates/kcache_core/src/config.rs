//! Topic configuration.

use crate::error::{CacheError, CacheResult};
use kcache_storage::SIZEOF_INDEX_RECORD;
use serde::Deserialize;

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// What happens to segments once they age out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// Delete whole segments after the retention window.
    #[default]
    Delete,
    /// Compact superseded entries away.
    Compact,
    /// Compact, and also delete after the retention window.
    CompactAndDelete,
}

impl CleanupPolicy {
    /// Returns `true` if this policy compacts.
    #[must_use]
    pub const fn compact(self) -> bool {
        matches!(self, Self::Compact | Self::CompactAndDelete)
    }

    /// Returns `true` if this policy deletes by retention.
    #[must_use]
    pub const fn delete(self) -> bool {
        matches!(self, Self::Delete | Self::CompactAndDelete)
    }
}

/// Per-topic cache configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    /// Maximum size of a segment's log and delta files.
    pub segment_bytes: u32,

    /// Maximum size of each of a segment's index files.
    pub segment_index_bytes: u32,

    /// How long a segment is retained before rolling.
    pub segment_millis: i64,

    /// How long entries are retained before deletion.
    pub retention_millis: i64,

    /// Dirty ratio above which a segment becomes cleanable.
    pub min_cleanable_dirty_ratio: f64,

    /// Minimum time an entry stays uncompacted after becoming dirty.
    pub min_compaction_lag_millis: i64,

    /// Maximum time a dirty entry may stay uncompacted.
    pub max_compaction_lag_millis: i64,

    /// Cleanup policy.
    pub cleanup_policy: CleanupPolicy,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            segment_bytes: 0x4000_0000,       // 1 GiB
            segment_index_bytes: 0xA0_0000,   // 10 MiB
            segment_millis: 7 * DAY_MILLIS,
            retention_millis: 7 * DAY_MILLIS,
            min_cleanable_dirty_ratio: 0.5,
            min_compaction_lag_millis: 0,
            max_compaction_lag_millis: i64::MAX,
            cleanup_policy: CleanupPolicy::Delete,
        }
    }
}

impl TopicConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum log and delta file size.
    #[must_use]
    pub const fn segment_bytes(mut self, bytes: u32) -> Self {
        self.segment_bytes = bytes;
        self
    }

    /// Sets the maximum index file size.
    #[must_use]
    pub const fn segment_index_bytes(mut self, bytes: u32) -> Self {
        self.segment_index_bytes = bytes;
        self
    }

    /// Sets the segment roll interval.
    #[must_use]
    pub const fn segment_millis(mut self, millis: i64) -> Self {
        self.segment_millis = millis;
        self
    }

    /// Sets the retention window.
    #[must_use]
    pub const fn retention_millis(mut self, millis: i64) -> Self {
        self.retention_millis = millis;
        self
    }

    /// Sets the dirty ratio threshold for compaction.
    #[must_use]
    pub const fn min_cleanable_dirty_ratio(mut self, ratio: f64) -> Self {
        self.min_cleanable_dirty_ratio = ratio;
        self
    }

    /// Sets the minimum compaction lag.
    #[must_use]
    pub const fn min_compaction_lag_millis(mut self, millis: i64) -> Self {
        self.min_compaction_lag_millis = millis;
        self
    }

    /// Sets the maximum compaction lag.
    #[must_use]
    pub const fn max_compaction_lag_millis(mut self, millis: i64) -> Self {
        self.max_compaction_lag_millis = millis;
        self
    }

    /// Sets the cleanup policy.
    #[must_use]
    pub const fn cleanup_policy(mut self, policy: CleanupPolicy) -> Self {
        self.cleanup_policy = policy;
        self
    }

    /// Returns the number of index records the freeze-time sort may hold.
    #[must_use]
    pub const fn sort_space_limit(&self) -> usize {
        (self.segment_index_bytes / SIZEOF_INDEX_RECORD) as usize
    }

    /// Checks the configuration for values the cache cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> CacheResult<()> {
        if self.segment_bytes == 0 || self.segment_bytes > i32::MAX as u32 - 1 {
            return Err(CacheError::invalid_config(format!(
                "segment_bytes must be in 1..{}, got {}",
                i32::MAX - 1,
                self.segment_bytes
            )));
        }
        if self.segment_index_bytes == 0 || self.segment_index_bytes % SIZEOF_INDEX_RECORD != 0 {
            return Err(CacheError::invalid_config(format!(
                "segment_index_bytes must be a positive multiple of {SIZEOF_INDEX_RECORD}, got {}",
                self.segment_index_bytes
            )));
        }
        if !(0.0..=1.0).contains(&self.min_cleanable_dirty_ratio) {
            return Err(CacheError::invalid_config(format!(
                "min_cleanable_dirty_ratio must be within [0, 1], got {}",
                self.min_cleanable_dirty_ratio
            )));
        }
        if self.min_compaction_lag_millis > self.max_compaction_lag_millis {
            return Err(CacheError::invalid_config(
                "min_compaction_lag_millis exceeds max_compaction_lag_millis",
            ));
        }
        Ok(())
    }
}
