//! Monotonic clock source with skew mitigation
//!
//! Provides a wall-clock millisecond timestamp that never goes backward,
//! and a configurable safety margin for retention decisions.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// A clock source that guarantees monotonically non-decreasing timestamps
/// and provides skew-aware retention cut-offs.
#[derive(Debug)]
pub struct BoundedClock {
    /// High-water mark: the largest timestamp we've ever returned (millis)
    high_water_ms: AtomicI64,
    /// Maximum tolerated clock skew (millis). Retention cut-offs are pushed
    /// back by this much so shards are never deleted early.
    max_skew_ms: i64,
}

impl BoundedClock {
    pub fn new(max_skew: Duration) -> Self {
        Self {
            high_water_ms: AtomicI64::new(0),
            max_skew_ms: max_skew.as_millis() as i64,
        }
    }

    /// Current time in epoch millis. If the wall clock has gone backward
    /// (e.g. NTP adjustment) the previous high-water mark is returned.
    pub fn now_millis(&self) -> i64 {
        let wall = Utc::now().timestamp_millis();
        let prev = self.high_water_ms.fetch_max(wall, Ordering::AcqRel);
        wall.max(prev)
    }

    pub fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.now_millis()).unwrap_or_default()
    }

    /// Shards whose partition ended before this instant are past a
    /// retention age of `days`.
    pub fn retention_cutoff_millis(&self, days: u32) -> i64 {
        self.now_millis() - days as i64 * MILLIS_PER_DAY - self.max_skew_ms
    }

    pub fn max_skew(&self) -> Duration {
        Duration::from_millis(self.max_skew_ms as u64)
    }
}

impl Default for BoundedClock {
    fn default() -> Self {
        // 30 second default, generous enough for most NTP-synced environments
        Self::new(Duration::from_secs(30))
    }
}
