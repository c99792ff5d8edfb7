//! Extent index: per-mount interval lookup with per-extent fetch state
//!
//! Built once at cache start from a sorted and coalesced playlist. The
//! extent array itself is immutable afterwards, so classification is a
//! lock-free binary search; only the per-extent state slot (fetch
//! progress plus the cached data buffer) sits behind a lock, with its own
//! condition variable so a blocked reader waits on exactly one extent and
//! never serializes unrelated requests.

use crate::playlist::Extent;
use crate::stats::Statistics;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound on any single blocked wait for a fetching extent. A fetch
/// stuck behind a failing device resolves as a miss, never as a hang of
/// the boot path.
pub const FETCH_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetch lifecycle of one indexed extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentState {
    /// Queued for prefetch, no I/O issued yet
    Scheduled,
    /// A fetch worker is reading it from the device
    Fetching,
    /// Data is resident and servable
    Fetched,
    /// Data fully consumed by hits or evicted by a write
    Consumed,
    /// Terminal: fetch failed, classify treats it as uncovered
    Failed,
}

/// Outcome of an interval lookup for one inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// The whole request lies inside a single extent
    Covered(usize),
    /// Only part of the request overlaps cached extents
    PartiallyCovered(Vec<usize>),
    /// No usable extent overlaps the request
    Uncovered,
}

#[derive(Debug)]
struct Slot {
    state: ExtentState,
    data: Option<Vec<u8>>,
    /// Extent-relative sub-ranges already served to hits, disjoint and
    /// sorted. Distinct bytes, so repeated reads of the same range do
    /// not advance consumption.
    consumed: Vec<(u64, u64)>,
}

impl Slot {
    fn note_consumed(&mut self, start: u64, end: u64) {
        let i = self.consumed.partition_point(|&(s, _)| s < start);
        self.consumed.insert(i, (start, end));
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.consumed.len());
        for &(s, e) in &self.consumed {
            match merged.last_mut() {
                Some(last) if last.1 >= s => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        self.consumed = merged;
    }

    fn consumed_bytes(&self) -> u64 {
        self.consumed.iter().map(|&(s, e)| e - s).sum()
    }
}

#[derive(Debug)]
struct IndexedExtent {
    extent: Extent,
    slot: Mutex<Slot>,
    resolved: Condvar,
}

/// Interval index over the active playlist.
#[derive(Debug)]
pub struct ExtentIndex {
    extents: Vec<IndexedExtent>,
    block_size: u64,
    stats: Arc<Statistics>,
}

impl ExtentIndex {
    /// Build from a sorted, coalesced playlist.
    ///
    /// The caller guarantees non-overlapping, non-adjacent input; the
    /// binary search in [`classify`](Self::classify) relies on it.
    pub fn new(playlist: Vec<Extent>, block_size: u64, stats: Arc<Statistics>) -> Self {
        debug_assert!(block_size > 0);
        debug_assert!(playlist.windows(2).all(|w| w[0].end() < w[1].offset));
        stats
            .total_extents
            .store(playlist.len() as u64, Ordering::Relaxed);
        let extents = playlist
            .into_iter()
            .map(|extent| IndexedExtent {
                extent,
                slot: Mutex::new(Slot {
                    state: ExtentState::Scheduled,
                    data: None,
                    consumed: Vec::new(),
                }),
                resolved: Condvar::new(),
            })
            .collect();
        ExtentIndex {
            extents,
            block_size,
            stats,
        }
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn extent(&self, id: usize) -> &Extent {
        &self.extents[id].extent
    }

    /// Device-native unit conversion, rounding partial blocks up.
    pub fn blocks(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.block_size)
    }

    pub fn state(&self, id: usize) -> ExtentState {
        self.extents[id].slot.lock().state
    }

    /// Classify an inbound byte range against the index.
    ///
    /// Counts one lookup per call. `Failed` extents are invisible here:
    /// once a fetch has failed the range is treated as uncovered forever
    /// (fail-open), so a request against it takes the bypass path.
    pub fn classify(&self, offset: u64, length: u64) -> Classification {
        self.stats.extent_lookups.fetch_add(1, Ordering::Relaxed);
        if length == 0 || self.extents.is_empty() {
            return Classification::Uncovered;
        }
        // First extent that could overlap: the one before the partition
        // point may still reach past `offset`.
        let req_end = offset.saturating_add(length);
        let mut i = self
            .extents
            .partition_point(|e| e.extent.offset <= offset)
            .saturating_sub(1);
        let mut ids = Vec::new();
        while i < self.extents.len() && self.extents[i].extent.offset < req_end {
            let e = &self.extents[i];
            if e.extent.overlaps(offset, length) && e.slot.lock().state != ExtentState::Failed {
                ids.push(i);
            }
            i += 1;
        }
        match ids.as_slice() {
            [] => Classification::Uncovered,
            [id] if self.extents[*id].extent.covers(offset, length) => Classification::Covered(*id),
            _ => Classification::PartiallyCovered(ids),
        }
    }

    /// Scheduled -> Fetching. Returns false if the extent was already
    /// resolved or evicted, in which case the fetch must be skipped.
    pub fn begin_fetch(&self, id: usize) -> bool {
        let mut slot = self.extents[id].slot.lock();
        if slot.state == ExtentState::Scheduled {
            slot.state = ExtentState::Fetching;
            true
        } else {
            false
        }
    }

    /// Publish fetched data. A write may have evicted the extent while
    /// the read was in flight; in that case the data is dropped, the
    /// eviction stands.
    pub fn complete_fetch(&self, id: usize, data: Vec<u8>) {
        let entry = &self.extents[id];
        debug_assert_eq!(data.len() as u64, entry.extent.length);
        let mut slot = entry.slot.lock();
        if slot.state == ExtentState::Fetching {
            slot.state = ExtentState::Fetched;
            slot.data = Some(data);
        }
        entry.resolved.notify_all();
    }

    /// Transition to the terminal `Failed` state and wake any waiters.
    pub fn fail_fetch(&self, id: usize) {
        let entry = &self.extents[id];
        let mut slot = entry.slot.lock();
        if matches!(slot.state, ExtentState::Scheduled | ExtentState::Fetching) {
            slot.state = ExtentState::Failed;
            slot.data = None;
        }
        entry.resolved.notify_all();
    }

    /// Block the calling thread until the extent leaves its pending
    /// states, bounded by `timeout`. Returns the state observed last.
    pub fn wait_resolved(&self, id: usize, timeout: Duration) -> ExtentState {
        let entry = &self.extents[id];
        let deadline = Instant::now() + timeout;
        let mut slot = entry.slot.lock();
        while matches!(slot.state, ExtentState::Scheduled | ExtentState::Fetching) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            entry.resolved.wait_for(&mut slot, deadline - now);
        }
        slot.state
    }

    /// Copy the overlap between a fetched extent and the request range
    /// `[offset, offset + dst.len())` into `dst`, accounting the newly
    /// covered bytes as consumed. Returns the bytes copied, or `None`
    /// when the extent holds no servable data.
    ///
    /// An extent whose every distinct byte has been consumed transitions
    /// to `Consumed` and releases its buffer; re-reading an already
    /// served sub-range copies again without advancing consumption.
    pub fn consume(&self, id: usize, offset: u64, dst: &mut [u8]) -> Option<u64> {
        let entry = &self.extents[id];
        let ext = entry.extent;
        let mut slot = entry.slot.lock();
        if slot.state != ExtentState::Fetched {
            return None;
        }
        let data = slot.data.as_ref()?;

        let req_end = offset.saturating_add(dst.len() as u64);
        let o_start = offset.max(ext.offset);
        let o_end = req_end.min(ext.end());
        if o_start >= o_end {
            return Some(0);
        }
        let src = &data[(o_start - ext.offset) as usize..(o_end - ext.offset) as usize];
        dst[(o_start - offset) as usize..(o_end - offset) as usize].copy_from_slice(src);

        slot.note_consumed(o_start - ext.offset, o_end - ext.offset);
        if slot.consumed_bytes() >= ext.length {
            slot.state = ExtentState::Consumed;
            slot.data = None;
        }
        Some(o_end - o_start)
    }

    /// Evict every extent overlapping a written range so the cache can
    /// never serve stale data. Returns the unconsumed bytes discarded.
    pub fn evict_range(&self, offset: u64, length: u64) -> u64 {
        if length == 0 {
            return 0;
        }
        let req_end = offset.saturating_add(length);
        let mut discarded = 0;
        let mut i = self
            .extents
            .partition_point(|e| e.extent.offset <= offset)
            .saturating_sub(1);
        while i < self.extents.len() && self.extents[i].extent.offset < req_end {
            let entry = &self.extents[i];
            if entry.extent.overlaps(offset, length) {
                let mut slot = entry.slot.lock();
                if !matches!(slot.state, ExtentState::Consumed | ExtentState::Failed) {
                    discarded += entry.extent.length - slot.consumed_bytes();
                    slot.state = ExtentState::Consumed;
                    slot.data = None;
                }
                entry.resolved.notify_all();
            }
            i += 1;
        }
        discarded
    }

    /// Fail every still-pending extent and wake its waiters. Called at
    /// STOP so no reader is left blocked behind a fetch that will never
    /// complete.
    pub fn abort_unresolved(&self) {
        for id in 0..self.extents.len() {
            self.fail_fetch(id);
        }
    }

    /// Fetched-but-never-consumed bytes, tallied at STOP as spurious.
    pub fn spurious_bytes(&self) -> u64 {
        self.extents
            .iter()
            .map(|e| {
                let slot = e.slot.lock();
                if slot.state == ExtentState::Fetched {
                    e.extent.length - slot.consumed_bytes()
                } else {
                    0
                }
            })
            .sum()
    }

    /// Extent ids in fetch order: PREFETCH-flagged extents first (they
    /// hold foreground-critical data), each class in offset order.
    pub fn fetch_order(&self) -> Vec<usize> {
        use crate::playlist::ExtentFlags;
        let mut ids: Vec<usize> = (0..self.extents.len()).collect();
        ids.sort_by_key(|&id| {
            let e = &self.extents[id].extent;
            (!e.flags.contains(ExtentFlags::PREFETCH), e.offset)
        });
        ids
    }
}
