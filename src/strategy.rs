//! Strategy interceptor: per-request hit / miss / bypass / block decisions
//!
//! One [`CacheCore`] exists per active cache session. Every inbound read
//! is classified against the extent index and resolves to exactly one
//! terminal outcome: served from cache, bypassed to the device, or
//! blocked behind an in-flight fetch and then re-resolved. The read path
//! never fails because of the cache itself; every internal failure mode
//! falls back to a plain device read.

use crate::device::BlockDevice;
use crate::error::Result;
use crate::history::{HistoryEntry, HistoryKind, HistoryRecorder};
use crate::index::{Classification, ExtentIndex, ExtentState, FETCH_WAIT_TIMEOUT};
use crate::stats::Statistics;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

/// How one read request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Bytes served from cached extents
    pub hit_bytes: u64,
    /// Bytes read from the device
    pub bypassed_bytes: u64,
    /// Whether the caller blocked on an in-flight fetch
    pub blocked: bool,
}

impl ReadOutcome {
    /// Fully served from cache, no device I/O.
    pub fn is_hit(&self) -> bool {
        self.bypassed_bytes == 0 && self.hit_bytes > 0
    }
}

/// The per-session cache core shared by the strategy entry points and
/// the fetch workers.
pub struct CacheCore {
    index: ExtentIndex,
    history: HistoryRecorder,
    stats: Arc<Statistics>,
    device: Arc<dyn BlockDevice>,
}

impl CacheCore {
    pub fn new(
        index: ExtentIndex,
        history: HistoryRecorder,
        stats: Arc<Statistics>,
        device: Arc<dyn BlockDevice>,
    ) -> Self {
        CacheCore {
            index,
            history,
            stats,
            device,
        }
    }

    pub fn index(&self) -> &ExtentIndex {
        &self.index
    }

    pub fn history(&self) -> &HistoryRecorder {
        &self.history
    }

    pub(crate) fn stats(&self) -> &Arc<Statistics> {
        &self.stats
    }

    pub(crate) fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Intercept one inbound read of `buf.len()` bytes at `offset`.
    ///
    /// On success `buf` holds the requested data, whether it came from
    /// cache, device, or both. Errors are device errors on the bypass
    /// path only, identical to what an uncached read would have seen.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<ReadOutcome> {
        let length = buf.len() as u64;
        self.stats.strategy_calls.fetch_add(1, Ordering::Relaxed);
        self.stats
            .requested_blocks
            .fetch_add(self.index.blocks(length), Ordering::Relaxed);

        match self.index.classify(offset, length) {
            Classification::Uncovered => self.bypass(offset, buf, false),
            Classification::Covered(id) => self.serve_covered(id, offset, buf),
            Classification::PartiallyCovered(ids) => self.serve_partial(&ids, offset, buf),
        }
    }

    /// Intercept a write. The cache never serves stale data: every
    /// overlapping extent is evicted, and the write is always recorded
    /// in the history regardless of cache state.
    pub fn write(&self, offset: u64, length: u64) {
        self.stats.strategy_calls.fetch_add(1, Ordering::Relaxed);
        self.stats.strategy_nonread.fetch_add(1, Ordering::Relaxed);
        let discarded = self.index.evict_range(offset, length);
        if discarded > 0 {
            self.stats
                .write_discards
                .fetch_add(self.index.blocks(discarded), Ordering::Relaxed);
            trace!(offset, length, discarded, "write evicted cached extents");
        }
        self.history
            .record(HistoryEntry::new(offset, length, HistoryKind::Write));
    }

    /// Pass the request through to the device. `blocked` reads have
    /// already been counted against their terminal counter.
    fn bypass(&self, offset: u64, buf: &mut [u8], blocked: bool) -> Result<ReadOutcome> {
        self.device.read_at(offset, buf)?;
        self.history.record(HistoryEntry::new(
            offset,
            buf.len() as u64,
            HistoryKind::Miss,
        ));
        if !blocked {
            self.stats.strategy_bypassed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(ReadOutcome {
            hit_bytes: 0,
            bypassed_bytes: buf.len() as u64,
            blocked,
        })
    }

    /// Request lies entirely inside one extent: serve it from cache,
    /// blocking first if the fetch is still in flight.
    fn serve_covered(&self, id: usize, offset: u64, buf: &mut [u8]) -> Result<ReadOutcome> {
        let mut blocked = false;
        if matches!(
            self.index.state(id),
            ExtentState::Scheduled | ExtentState::Fetching
        ) {
            blocked = true;
            self.stats.strategy_blocked.fetch_add(1, Ordering::Relaxed);
            let start = Instant::now();
            let resolved = self.index.wait_resolved(id, FETCH_WAIT_TIMEOUT);
            self.stats.add_wait_time(start.elapsed());
            trace!(extent = id, ?resolved, "read resumed after blocking");
        }

        if let Some(copied) = self.index.consume(id, offset, buf) {
            if copied == buf.len() as u64 {
                self.history.record(HistoryEntry::new(
                    offset,
                    buf.len() as u64,
                    HistoryKind::Hit,
                ));
                self.stats
                    .hit_blocks
                    .fetch_add(self.index.blocks(copied), Ordering::Relaxed);
                self.stats
                    .strategy_bypass_active
                    .fetch_add(1, Ordering::Relaxed);
                if !blocked {
                    self.stats.extent_hits.fetch_add(1, Ordering::Relaxed);
                }
                return Ok(ReadOutcome {
                    hit_bytes: copied,
                    bypassed_bytes: 0,
                    blocked,
                });
            }
        }

        // Covered but unfillable: fetch failed or timed out, or the data
        // was consumed/evicted between classification and here.
        self.stats.hit_blkmissing.fetch_add(1, Ordering::Relaxed);
        self.bypass(offset, buf, blocked)
    }

    /// Request straddles cached and uncached ranges: fill whatever the
    /// overlapping extents can provide, read the remainder from the
    /// device. An extent still in flight is waited on first, exactly as
    /// on the covered path, so the fetch is never duplicated by a device
    /// read of the same bytes.
    fn serve_partial(&self, ids: &[usize], offset: u64, buf: &mut [u8]) -> Result<ReadOutcome> {
        let req_end = offset.saturating_add(buf.len() as u64);
        let mut hit_bytes = 0;
        let mut blocked = false;
        let mut served: Vec<(u64, u64)> = Vec::with_capacity(ids.len());

        for &id in ids {
            if matches!(
                self.index.state(id),
                ExtentState::Scheduled | ExtentState::Fetching
            ) {
                if !blocked {
                    blocked = true;
                    self.stats.strategy_blocked.fetch_add(1, Ordering::Relaxed);
                }
                let start = Instant::now();
                let resolved = self.index.wait_resolved(id, FETCH_WAIT_TIMEOUT);
                self.stats.add_wait_time(start.elapsed());
                trace!(extent = id, ?resolved, "partial read resumed after blocking");
            }
            match self.index.consume(id, offset, buf) {
                Some(copied) if copied > 0 => {
                    let sub_start = offset.max(self.index.extent(id).offset);
                    served.push((sub_start, copied));
                    hit_bytes += copied;
                    self.stats
                        .hit_blocks
                        .fetch_add(self.index.blocks(copied), Ordering::Relaxed);
                    self.history
                        .record(HistoryEntry::new(sub_start, copied, HistoryKind::Hit));
                }
                Some(_) => {}
                None => {
                    self.stats.hit_blkmissing.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        // Fill the gaps between served sub-ranges from the device.
        let mut cursor = offset;
        for &(sub_start, sub_len) in &served {
            if cursor < sub_start {
                self.read_gap(offset, cursor, sub_start, buf)?;
            }
            cursor = sub_start + sub_len;
        }
        if cursor < req_end {
            self.read_gap(offset, cursor, req_end, buf)?;
        }

        if !blocked {
            self.stats.strategy_bypassed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(ReadOutcome {
            hit_bytes,
            bypassed_bytes: buf.len() as u64 - hit_bytes,
            blocked,
        })
    }

    fn read_gap(&self, req_offset: u64, start: u64, end: u64, buf: &mut [u8]) -> Result<()> {
        let dst = &mut buf[(start - req_offset) as usize..(end - req_offset) as usize];
        self.device.read_at(start, dst)?;
        self.history
            .record(HistoryEntry::new(start, end - start, HistoryKind::Miss));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::playlist::{Extent, ExtentFlags};

    const BS: u64 = 4096;

    fn core(extents: Vec<Extent>) -> CacheCore {
        let stats = Arc::new(Statistics::new());
        stats.reset(BS);
        let device: Arc<dyn BlockDevice> = Arc::new(MemDevice::patterned(1 << 20));
        let index = ExtentIndex::new(extents, BS, Arc::clone(&stats));
        let history = HistoryRecorder::new(Arc::clone(&stats));
        CacheCore::new(index, history, stats, device)
    }

    fn ext(offset: u64, length: u64) -> Extent {
        Extent::new(offset, length, ExtentFlags::NONE)
    }

    fn expected(offset: u64, len: usize) -> Vec<u8> {
        (offset as usize..offset as usize + len)
            .map(|i| (i % 251) as u8)
            .collect()
    }

    /// Simulate the fetch pool for one extent.
    fn fetch(core: &CacheCore, id: usize) {
        assert!(core.index().begin_fetch(id));
        let e = *core.index().extent(id);
        let mut data = vec![0u8; e.length as usize];
        core.device().read_at(e.offset, &mut data).unwrap();
        core.index().complete_fetch(id, data);
    }

    #[test]
    fn test_uncovered_read_bypasses() {
        let core = core(vec![ext(0, 4096)]);
        let mut buf = vec![0u8; 512];
        let outcome = core.read(100_000, &mut buf).unwrap();
        assert_eq!(outcome.bypassed_bytes, 512);
        assert_eq!(buf, expected(100_000, 512));

        let snap = core.stats().snapshot();
        assert_eq!(snap.strategy_bypassed, 1);
        assert_eq!(snap.extent_hits, 0);
        let (entries, _) = core.history().drain();
        assert_eq!(entries, vec![HistoryEntry::new(100_000, 512, HistoryKind::Miss)]);
    }

    #[test]
    fn test_covered_read_hits_after_fetch() {
        let core = core(vec![ext(8192, 8192)]);
        fetch(&core, 0);

        let mut buf = vec![0u8; 4096];
        let outcome = core.read(8192, &mut buf).unwrap();
        assert!(outcome.is_hit());
        assert!(!outcome.blocked);
        assert_eq!(buf, expected(8192, 4096));

        let snap = core.stats().snapshot();
        assert_eq!(snap.extent_hits, 1);
        assert_eq!(snap.strategy_bypass_active, 1);
        assert_eq!(snap.hit_blocks, 1);
        assert_eq!(snap.strategy_bypassed, 0);
        let (entries, _) = core.history().drain();
        assert_eq!(entries[0].kind, HistoryKind::Hit);
    }

    #[test]
    fn test_consumed_extent_falls_back_to_bypass() {
        let core = core(vec![ext(0, 4096)]);
        fetch(&core, 0);
        let mut buf = vec![0u8; 4096];
        core.read(0, &mut buf).unwrap();
        // extent is now fully consumed; second read must bypass
        let outcome = core.read(0, &mut buf).unwrap();
        assert_eq!(outcome.bypassed_bytes, 4096);
        assert_eq!(buf, expected(0, 4096));

        let snap = core.stats().snapshot();
        assert_eq!(snap.hit_blkmissing, 1);
        assert_eq!(snap.strategy_bypassed, 1);
        assert_eq!(snap.extent_hits, 1);
    }

    #[test]
    fn test_partial_read_mixes_cache_and_device() {
        let core = core(vec![ext(0, 4096)]);
        fetch(&core, 0);

        let mut buf = vec![0u8; 8192];
        let outcome = core.read(0, &mut buf).unwrap();
        assert_eq!(outcome.hit_bytes, 4096);
        assert_eq!(outcome.bypassed_bytes, 4096);
        assert_eq!(buf, expected(0, 8192));

        let snap = core.stats().snapshot();
        assert_eq!(snap.strategy_bypassed, 1);
        assert_eq!(snap.hit_blocks, 1);
        let (entries, _) = core.history().drain();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], HistoryEntry::new(0, 4096, HistoryKind::Hit));
        assert_eq!(entries[1], HistoryEntry::new(4096, 4096, HistoryKind::Miss));
    }

    #[test]
    fn test_partial_read_with_gap_between_extents() {
        let core = core(vec![ext(0, 4096), ext(8192, 4096)]);
        fetch(&core, 0);
        fetch(&core, 1);

        let mut buf = vec![0u8; 12288];
        let outcome = core.read(0, &mut buf).unwrap();
        assert_eq!(outcome.hit_bytes, 8192);
        assert_eq!(outcome.bypassed_bytes, 4096);
        assert_eq!(buf, expected(0, 12288));

        let (entries, _) = core.history().drain();
        let kinds: Vec<HistoryKind> = entries.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![HistoryKind::Hit, HistoryKind::Hit, HistoryKind::Miss]
        );
    }

    #[test]
    fn test_partial_read_waits_for_inflight_fetch() {
        let core = Arc::new(core(vec![ext(0, 4096)]));
        assert!(core.index().begin_fetch(0));

        let reader = {
            let core = Arc::clone(&core);
            std::thread::spawn(move || {
                let mut buf = vec![0u8; 8192];
                let outcome = core.read(0, &mut buf).unwrap();
                (outcome, buf)
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(30));
        core.index().complete_fetch(0, expected(0, 4096));

        let (outcome, buf) = reader.join().unwrap();
        assert!(outcome.blocked);
        assert_eq!(outcome.hit_bytes, 4096);
        assert_eq!(outcome.bypassed_bytes, 4096);
        assert_eq!(buf, expected(0, 8192));

        let snap = core.stats().snapshot();
        // the covered sub-range came from the fetch, not a second device
        // read, and blocked is the terminal counter for the call
        assert_eq!(snap.strategy_blocked, 1);
        assert_eq!(snap.strategy_bypassed, 0);
        assert_eq!(snap.hit_blkmissing, 0);
        assert_eq!(snap.hit_blocks, 1);
        assert!(snap.wait_time_us > 0);
        let (entries, _) = core.history().drain();
        let kinds: Vec<HistoryKind> = entries.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![HistoryKind::Hit, HistoryKind::Miss]);
    }

    #[test]
    fn test_write_evicts_and_records() {
        let core = core(vec![ext(0, 4096)]);
        fetch(&core, 0);
        core.write(0, 512);

        let snap = core.stats().snapshot();
        assert_eq!(snap.strategy_nonread, 1);
        assert_eq!(snap.write_discards, 1);

        // subsequent read must not be served stale data from cache
        let mut buf = vec![0u8; 4096];
        let outcome = core.read(0, &mut buf).unwrap();
        assert!(!outcome.is_hit());

        let (entries, _) = core.history().drain();
        assert_eq!(entries[0].kind, HistoryKind::Write);
    }

    #[test]
    fn test_write_outside_cache_still_recorded() {
        let core = core(vec![ext(0, 4096)]);
        core.write(500_000, 512);
        let snap = core.stats().snapshot();
        assert_eq!(snap.write_discards, 0);
        assert_eq!(core.history().len(), 1);
    }

    #[test]
    fn test_blocked_read_resolves_to_hit() {
        let core = Arc::new(core(vec![ext(0, 8192)]));
        assert!(core.index().begin_fetch(0));

        let reader = {
            let core = Arc::clone(&core);
            std::thread::spawn(move || {
                let mut buf = vec![0u8; 8192];
                let outcome = core.read(0, &mut buf).unwrap();
                (outcome, buf)
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(30));
        core.index().complete_fetch(0, expected(0, 8192));

        let (outcome, buf) = reader.join().unwrap();
        assert!(outcome.blocked);
        assert!(outcome.is_hit());
        assert_eq!(buf, expected(0, 8192));

        let snap = core.stats().snapshot();
        assert_eq!(snap.strategy_blocked, 1);
        assert_eq!(snap.hit_blocks, 2);
        // blocked is the terminal counter for this call
        assert_eq!(snap.extent_hits, 0);
        assert_eq!(snap.strategy_bypassed, 0);
        assert!(snap.wait_time_us > 0);
    }

    #[test]
    fn test_blocked_read_falls_back_when_fetch_fails() {
        let core = Arc::new(core(vec![ext(0, 4096)]));
        assert!(core.index().begin_fetch(0));

        let reader = {
            let core = Arc::clone(&core);
            std::thread::spawn(move || {
                let mut buf = vec![0u8; 4096];
                let outcome = core.read(0, &mut buf).unwrap();
                (outcome, buf)
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(30));
        core.index().fail_fetch(0);

        let (outcome, buf) = reader.join().unwrap();
        assert!(outcome.blocked);
        assert_eq!(outcome.bypassed_bytes, 4096);
        assert_eq!(buf, expected(0, 4096));

        let snap = core.stats().snapshot();
        assert_eq!(snap.strategy_blocked, 1);
        assert_eq!(snap.strategy_bypassed, 0);
        assert_eq!(snap.hit_blkmissing, 1);
    }

    #[test]
    fn test_terminal_outcome_accounting_is_exclusive() {
        let core = core(vec![ext(0, 4096), ext(8192, 4096)]);
        fetch(&core, 0);
        fetch(&core, 1);

        let mut buf = vec![0u8; 4096];
        core.read(0, &mut buf).unwrap(); // hit
        core.read(100_000, &mut buf).unwrap(); // bypass
        let mut big = vec![0u8; 12288];
        core.read(0, &mut big).unwrap(); // partial -> bypass terminal
        core.write(0, 4096); // nonread

        let snap = core.stats().snapshot();
        assert_eq!(
            snap.extent_hits + snap.strategy_bypassed + snap.strategy_blocked,
            snap.strategy_calls - snap.strategy_nonread
        );
    }
}
