//! Storage statistics.
//!
//! - [`Counters`] - Monotonic counters living in the shared header
//! - [`StatsSnapshot`] - Point-in-time copy of the counters
//! - [`StorageInfo`] - Sizing plus a snapshot, returned by `Storage::info`
//!
//! Counters are shared by every process attached to a region and only reset
//! when the region is created again.

use crate::sync::{AtomicU64, Ordering};
use std::fmt;

/// Shared operation counters.
#[repr(C)]
#[derive(Debug)]
pub struct Counters {
    /// Lookups that returned an entry.
    pub hits: AtomicU64,
    /// Lookups that returned nothing, for any reason.
    pub miss: AtomicU64,
    /// Misses caused by an expired TTL.
    pub expired: AtomicU64,
    /// Misses caused by a failed integrity check.
    pub corrupted: AtomicU64,
    /// Writes rejected for lack of space.
    pub fails: AtomicU64,
    /// Entries evicted by a colliding key.
    pub kicks: AtomicU64,
    /// Arena cursor wraparounds.
    pub recycles: AtomicU64,
}

impl Counters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            miss: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            corrupted: AtomicU64::new(0),
            fails: AtomicU64::new(0),
            kicks: AtomicU64::new(0),
            recycles: AtomicU64::new(0),
        }
    }

    /// Record a hit.
    #[inline]
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a plain miss (absent key).
    #[inline]
    pub fn record_miss(&self) {
        self.miss.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a miss caused by expiry.
    #[inline]
    pub fn record_expired(&self) {
        self.miss.fetch_add(1, Ordering::Relaxed);
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a miss caused by an integrity failure.
    #[inline]
    pub fn record_corrupted(&self) {
        self.miss.fetch_add(1, Ordering::Relaxed);
        self.corrupted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed allocation.
    #[inline]
    pub fn record_fail(&self) {
        self.fails.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an eviction.
    #[inline]
    pub fn record_kick(&self) {
        self.kicks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cursor wraparound.
    #[inline]
    pub fn record_recycle(&self) {
        self.recycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the current counter values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            miss: self.miss.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            corrupted: self.corrupted.load(Ordering::Relaxed),
            fails: self.fails.load(Ordering::Relaxed),
            kicks: self.kicks.load(Ordering::Relaxed),
            recycles: self.recycles.load(Ordering::Relaxed),
        }
    }
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}

/// Counter values at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Lookups that returned an entry.
    pub hits: u64,
    /// Lookups that returned nothing.
    pub miss: u64,
    /// Misses caused by an expired TTL.
    pub expired: u64,
    /// Misses caused by a failed integrity check.
    pub corrupted: u64,
    /// Writes rejected for lack of space.
    pub fails: u64,
    /// Collision evictions.
    pub kicks: u64,
    /// Arena wraparounds.
    pub recycles: u64,
}

impl StatsSnapshot {
    /// Hit rate as a percentage (0.0 - 100.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.miss;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Difference between two snapshots (self - other).
    ///
    /// Useful for computing rates over an interval.
    pub fn diff(&self, other: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.saturating_sub(other.hits),
            miss: self.miss.saturating_sub(other.miss),
            expired: self.expired.saturating_sub(other.expired),
            corrupted: self.corrupted.saturating_sub(other.corrupted),
            fails: self.fails.saturating_sub(other.fails),
            kicks: self.kicks.saturating_sub(other.kicks),
            recycles: self.recycles.saturating_sub(other.recycles),
        }
    }
}

/// Sizing and statistics of a storage region.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageInfo {
    /// Backend that mapped the region.
    pub backend: &'static str,
    /// Number of key slots.
    pub slots_num: usize,
    /// Slots currently holding a key, expired or not.
    pub slots_used: usize,
    /// Size of one slot in bytes.
    pub slot_size: usize,
    /// Number of value segments.
    pub segments_num: usize,
    /// Size of each value segment but the last.
    pub segment_size: usize,
    /// Size of the key region in bytes.
    pub key_region_size: usize,
    /// Size of the value region in bytes.
    pub value_region_size: usize,
    /// Largest accepted value.
    pub max_value_size: usize,
    /// Payloads shorter than this are checksummed in full.
    pub full_checksum_threshold: usize,
    /// Counter values when the info was taken.
    pub stats: StatsSnapshot,
}

impl StorageInfo {
    /// Total mapped bytes.
    pub fn total_size(&self) -> usize {
        self.key_region_size + self.value_region_size
    }
}

impl fmt::Display for StorageInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "backend:           {}", self.backend)?;
        writeln!(f, "total size:        {}", self.total_size())?;
        writeln!(f, "key region size:   {}", self.key_region_size)?;
        writeln!(f, "value region size: {}", self.value_region_size)?;
        writeln!(f, "slots:             {}", self.slots_num)?;
        writeln!(f, "slots used:        {}", self.slots_used)?;
        writeln!(f, "slot size:         {}", self.slot_size)?;
        writeln!(f, "segments:          {}", self.segments_num)?;
        writeln!(f, "segment size:      {}", self.segment_size)?;
        writeln!(f, "max value size:    {}", self.max_value_size)?;
        writeln!(f, "hits:              {}", self.stats.hits)?;
        writeln!(
            f,
            "miss:              {} (expired {}, corrupted {})",
            self.stats.miss, self.stats.expired, self.stats.corrupted
        )?;
        writeln!(f, "hit rate:          {:.2}%", self.stats.hit_rate())?;
        writeln!(f, "fails:             {}", self.stats.fails)?;
        writeln!(f, "kicks:             {}", self.stats.kicks)?;
        write!(f, "recycles:          {}", self.stats.recycles)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let counters = Counters::new();
        counters.record_hit();
        counters.record_hit();
        counters.record_miss();
        counters.record_expired();
        counters.record_corrupted();
        counters.record_fail();
        counters.record_kick();
        counters.record_recycle();

        let snapshot = counters.snapshot();
        assert_eq!(
            snapshot,
            StatsSnapshot {
                hits: 2,
                miss: 3,
                expired: 1,
                corrupted: 1,
                fails: 1,
                kicks: 1,
                recycles: 1,
            }
        );
    }

    #[test]
    fn test_hit_rate() {
        assert_eq!(StatsSnapshot::default().hit_rate(), 0.0);

        let snapshot = StatsSnapshot {
            hits: 3,
            miss: 1,
            ..Default::default()
        };
        assert_eq!(snapshot.hit_rate(), 75.0);
    }

    #[test]
    fn test_diff() {
        let before = StatsSnapshot {
            hits: 10,
            miss: 5,
            kicks: 2,
            ..Default::default()
        };
        let after = StatsSnapshot {
            hits: 15,
            miss: 6,
            kicks: 2,
            recycles: 1,
            ..Default::default()
        };

        let delta = after.diff(&before);
        assert_eq!(delta.hits, 5);
        assert_eq!(delta.miss, 1);
        assert_eq!(delta.kicks, 0);
        assert_eq!(delta.recycles, 1);

        // Never underflows
        assert_eq!(before.diff(&after).hits, 0);
    }

    #[test]
    fn test_counters_layout() {
        assert_eq!(std::mem::size_of::<Counters>(), 56);
    }
}
