//! Statistics aggregator: lock-free counters observed by every component
//!
//! Counters are monotonically increasing for the lifetime of one cache
//! session and are reset only on a STOP -> START cycle. Hot-path counters
//! are cache-line padded to avoid false sharing between concurrent
//! strategy calls.

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Phase-transition timestamps for one cache session.
#[derive(Debug, Default)]
struct Phases {
    /// Wall-clock start, plus the monotonic anchor the other phases are
    /// measured against.
    cache_start: Option<(SystemTime, Instant)>,
    prefetch_stop: Option<Instant>,
    read_stop: Option<Instant>,
    cache_stop: Option<Instant>,
}

/// Engine-wide statistics, updated in place by every component.
#[derive(Debug)]
pub struct Statistics {
    block_size: AtomicU64,

    // readahead
    pub(crate) initiated_reads: CachePadded<AtomicU64>,
    pub(crate) read_blocks: CachePadded<AtomicU64>,
    pub(crate) read_errors: AtomicU64,
    pub(crate) error_discards: AtomicU64,

    // inbound strategy calls
    pub(crate) strategy_calls: CachePadded<AtomicU64>,
    pub(crate) strategy_nonread: AtomicU64,
    pub(crate) strategy_bypassed: CachePadded<AtomicU64>,
    pub(crate) strategy_bypass_active: AtomicU64,
    pub(crate) strategy_blocked: AtomicU64,

    // extents
    pub(crate) total_extents: AtomicU64,
    pub(crate) extent_lookups: CachePadded<AtomicU64>,
    pub(crate) extent_hits: CachePadded<AtomicU64>,
    pub(crate) hit_blkmissing: AtomicU64,

    // block/page activity
    pub(crate) requested_blocks: CachePadded<AtomicU64>,
    pub(crate) hit_blocks: AtomicU64,
    pub(crate) write_discards: AtomicU64,
    pub(crate) spurious_blocks: AtomicU64,
    pub(crate) spurious_pages: AtomicU64,

    // history activity
    pub(crate) history_clusters: AtomicU64,

    /// Total time strategy calls spent blocked waiting for fetches, in µs.
    wait_time_us: CachePadded<AtomicU64>,

    phases: Mutex<Phases>,
}

impl Statistics {
    pub fn new() -> Self {
        Statistics {
            block_size: AtomicU64::new(0),
            initiated_reads: CachePadded::new(AtomicU64::new(0)),
            read_blocks: CachePadded::new(AtomicU64::new(0)),
            read_errors: AtomicU64::new(0),
            error_discards: AtomicU64::new(0),
            strategy_calls: CachePadded::new(AtomicU64::new(0)),
            strategy_nonread: AtomicU64::new(0),
            strategy_bypassed: CachePadded::new(AtomicU64::new(0)),
            strategy_bypass_active: AtomicU64::new(0),
            strategy_blocked: AtomicU64::new(0),
            total_extents: AtomicU64::new(0),
            extent_lookups: CachePadded::new(AtomicU64::new(0)),
            extent_hits: CachePadded::new(AtomicU64::new(0)),
            hit_blkmissing: AtomicU64::new(0),
            requested_blocks: CachePadded::new(AtomicU64::new(0)),
            hit_blocks: AtomicU64::new(0),
            write_discards: AtomicU64::new(0),
            spurious_blocks: AtomicU64::new(0),
            spurious_pages: AtomicU64::new(0),
            history_clusters: AtomicU64::new(0),
            wait_time_us: CachePadded::new(AtomicU64::new(0)),
            phases: Mutex::new(Phases::default()),
        }
    }

    /// Reset all counters for a new session and stamp the start time.
    ///
    /// Called only on the STOP -> START transition.
    pub(crate) fn reset(&self, block_size: u64) {
        for counter in [
            &*self.initiated_reads,
            &*self.read_blocks,
            &self.read_errors,
            &self.error_discards,
            &*self.strategy_calls,
            &self.strategy_nonread,
            &*self.strategy_bypassed,
            &self.strategy_bypass_active,
            &self.strategy_blocked,
            &self.total_extents,
            &*self.extent_lookups,
            &*self.extent_hits,
            &self.hit_blkmissing,
            &*self.requested_blocks,
            &self.hit_blocks,
            &self.write_discards,
            &self.spurious_blocks,
            &self.spurious_pages,
            &self.history_clusters,
            &*self.wait_time_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.block_size.store(block_size, Ordering::Relaxed);
        *self.phases.lock() = Phases {
            cache_start: Some((SystemTime::now(), Instant::now())),
            ..Phases::default()
        };
    }

    pub(crate) fn add_wait_time(&self, waited: Duration) {
        self.wait_time_us
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
    }

    pub(crate) fn mark_prefetch_stop(&self) {
        let mut phases = self.phases.lock();
        if phases.prefetch_stop.is_none() {
            phases.prefetch_stop = Some(Instant::now());
        }
    }

    pub(crate) fn mark_cache_stop(&self) {
        let now = Instant::now();
        let mut phases = self.phases.lock();
        if phases.read_stop.is_none() {
            phases.read_stop = Some(now);
        }
        if phases.cache_stop.is_none() {
            phases.cache_stop = Some(now);
        }
    }

    /// Immutable copy of all counters and timestamps.
    pub fn snapshot(&self) -> StatsSnapshot {
        let phases = self.phases.lock();
        let rel = |mark: Option<Instant>| {
            let (_, anchor) = phases.cache_start?;
            mark.map(|m| m.duration_since(anchor).as_micros() as u64)
        };
        StatsSnapshot {
            block_size: self.block_size.load(Ordering::Relaxed),
            initiated_reads: self.initiated_reads.load(Ordering::Relaxed),
            read_blocks: self.read_blocks.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            error_discards: self.error_discards.load(Ordering::Relaxed),
            strategy_calls: self.strategy_calls.load(Ordering::Relaxed),
            strategy_nonread: self.strategy_nonread.load(Ordering::Relaxed),
            strategy_bypassed: self.strategy_bypassed.load(Ordering::Relaxed),
            strategy_bypass_active: self.strategy_bypass_active.load(Ordering::Relaxed),
            strategy_blocked: self.strategy_blocked.load(Ordering::Relaxed),
            total_extents: self.total_extents.load(Ordering::Relaxed),
            extent_lookups: self.extent_lookups.load(Ordering::Relaxed),
            extent_hits: self.extent_hits.load(Ordering::Relaxed),
            hit_blkmissing: self.hit_blkmissing.load(Ordering::Relaxed),
            requested_blocks: self.requested_blocks.load(Ordering::Relaxed),
            hit_blocks: self.hit_blocks.load(Ordering::Relaxed),
            write_discards: self.write_discards.load(Ordering::Relaxed),
            spurious_blocks: self.spurious_blocks.load(Ordering::Relaxed),
            spurious_pages: self.spurious_pages.load(Ordering::Relaxed),
            history_clusters: self.history_clusters.load(Ordering::Relaxed),
            wait_time_us: self.wait_time_us.load(Ordering::Relaxed),
            cache_start_unix_us: phases.cache_start.map(|(wall, _)| {
                wall.duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::ZERO)
                    .as_micros() as u64
            }),
            prefetch_stop_us: rel(phases.prefetch_stop),
            read_stop_us: rel(phases.read_stop),
            cache_stop_us: rel(phases.cache_stop),
        }
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Statistics::new()
    }
}

/// Point-in-time copy of [`Statistics`], suitable for reporting.
///
/// Phase marks other than `cache_start_unix_us` are microseconds relative
/// to cache start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub block_size: u64,

    pub initiated_reads: u64,
    pub read_blocks: u64,
    pub read_errors: u64,
    pub error_discards: u64,

    pub strategy_calls: u64,
    pub strategy_nonread: u64,
    pub strategy_bypassed: u64,
    pub strategy_bypass_active: u64,
    pub strategy_blocked: u64,

    pub total_extents: u64,
    pub extent_lookups: u64,
    pub extent_hits: u64,
    pub hit_blkmissing: u64,

    pub requested_blocks: u64,
    pub hit_blocks: u64,
    pub write_discards: u64,
    pub spurious_blocks: u64,
    pub spurious_pages: u64,

    pub history_clusters: u64,
    pub wait_time_us: u64,

    pub cache_start_unix_us: Option<u64>,
    pub prefetch_stop_us: Option<u64>,
    pub read_stop_us: Option<u64>,
    pub cache_stop_us: Option<u64>,
}
