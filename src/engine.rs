//! Cache engine lifecycle: Idle -> Active -> Stopped -> Idle
//!
//! The engine owns one cache session at a time. START builds the extent
//! index from a playlist, resets statistics, and spawns the fetch pool;
//! STOP freezes the session and accounts leftovers; HISTORY drains the
//! recorder and re-arms the engine. The fetch pool reads extents in
//! playlist order, prefetch-flagged extents first, while foreground
//! strategy calls classify concurrently.

use crate::control::HISTORY_RECORD_SIZE;
use crate::device::BlockDevice;
use crate::error::{CacheError, Result};
use crate::history::{HistoryEntry, HistoryRecorder};
use crate::index::ExtentIndex;
use crate::playlist::{self, Extent, MAX_PLAYLIST_ENTRIES};
use crate::stats::{Statistics, StatsSnapshot};
use crate::strategy::{CacheCore, ReadOutcome};
use crossbeam::channel;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Number of background fetch workers per session.
pub const FETCH_WORKERS: usize = 2;

/// Page size used for spurious-page accounting.
const PAGE_SIZE: u64 = 4096;

/// Externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Active,
    Stopped,
}

struct ActiveSession {
    core: Arc<CacheCore>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

struct StoppedSession {
    core: Arc<CacheCore>,
}

enum State {
    Idle,
    Active(ActiveSession),
    Stopped(StoppedSession),
}

/// The process-wide cache engine for one boot volume.
pub struct CacheEngine {
    device: Arc<dyn BlockDevice>,
    stats: Arc<Statistics>,
    state: Mutex<State>,
}

impl CacheEngine {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        CacheEngine {
            device,
            stats: Arc::new(Statistics::new()),
            state: Mutex::new(State::Idle),
        }
    }

    pub fn state(&self) -> EngineState {
        match &*self.state.lock() {
            State::Idle => EngineState::Idle,
            State::Active(_) => EngineState::Active,
            State::Stopped(_) => EngineState::Stopped,
        }
    }

    /// Start a cache session.
    ///
    /// The playlist may be empty, in which case every read bypasses but
    /// the history recorder still captures the boot's I/O for playlist
    /// generation. Validation failures leave the engine Idle and change
    /// no state.
    pub fn start(&self, playlist: Vec<Extent>, block_size: i32) -> Result<()> {
        let mut state = self.state.lock();
        if !matches!(*state, State::Idle) {
            return Err(CacheError::AlreadyActive);
        }
        if block_size <= 0 {
            return Err(CacheError::InvalidBlockSize(block_size));
        }
        if playlist.len() > MAX_PLAYLIST_ENTRIES {
            return Err(CacheError::CapacityExceeded {
                count: playlist.len(),
                limit: MAX_PLAYLIST_ENTRIES,
            });
        }
        for e in &playlist {
            if e.length == 0 {
                return Err(CacheError::ZeroLengthExtent(e.offset));
            }
            if e.offset.checked_add(e.length).is_none() {
                return Err(CacheError::ExtentOverflow {
                    offset: e.offset,
                    length: e.length,
                });
            }
        }

        let mut playlist = playlist;
        playlist::sort_playlist(&mut playlist);
        let coalesced = playlist::coalesce_playlist(&playlist);

        self.stats.reset(block_size as u64);
        let index = ExtentIndex::new(coalesced, block_size as u64, Arc::clone(&self.stats));
        let history = HistoryRecorder::new(Arc::clone(&self.stats));
        let core = Arc::new(CacheCore::new(
            index,
            history,
            Arc::clone(&self.stats),
            Arc::clone(&self.device),
        ));

        let shutdown = Arc::new(AtomicBool::new(false));
        let workers = spawn_fetch_pool(Arc::clone(&core), Arc::clone(&shutdown));

        info!(
            extents = core.index().len(),
            block_size, "cache engine started"
        );
        *state = State::Active(ActiveSession {
            core,
            shutdown,
            workers,
        });
        Ok(())
    }

    /// Stop the active session and freeze its history and index.
    ///
    /// Returns the pending history size in bytes; 0 signals that the
    /// history was truncated and HISTORY must still be issued to clear
    /// it. Never deadlocks: the fetch queue drains under the shutdown
    /// flag and any blocked reader is woken by aborting pending extents.
    pub fn stop(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let session = match std::mem::replace(&mut *state, State::Idle) {
            State::Active(session) => session,
            other => {
                *state = other;
                return Err(CacheError::NotActive);
            }
        };

        session.shutdown.store(true, Ordering::Relaxed);
        for worker in session.workers {
            if worker.join().is_err() {
                warn!("fetch worker panicked during shutdown");
            }
        }
        session.core.index().abort_unresolved();
        self.stats.mark_cache_stop();

        let spurious = session.core.index().spurious_bytes();
        if spurious > 0 {
            self.stats
                .spurious_blocks
                .fetch_add(session.core.index().blocks(spurious), Ordering::Relaxed);
            self.stats
                .spurious_pages
                .fetch_add(spurious.div_ceil(PAGE_SIZE), Ordering::Relaxed);
        }

        let truncated = session.core.history().truncated();
        let bytes = if truncated {
            0
        } else {
            session.core.history().len() * HISTORY_RECORD_SIZE
        };
        info!(
            history_bytes = bytes,
            truncated, "cache engine stopped"
        );
        *state = State::Stopped(StoppedSession { core: session.core });
        Ok(bytes)
    }

    /// Drain the history of the stopped session and re-arm the engine.
    pub fn history(&self) -> Result<(Vec<HistoryEntry>, bool)> {
        let mut state = self.state.lock();
        let session = match std::mem::replace(&mut *state, State::Idle) {
            State::Stopped(session) => session,
            other => {
                *state = other;
                return Err(CacheError::NotStopped);
            }
        };
        let (entries, truncated) = session.core.history().drain();
        debug!(entries = entries.len(), truncated, "history drained");
        Ok((entries, truncated))
    }

    /// Statistics snapshot, valid in any state.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Inject a marker into the active session's history.
    pub fn tag(&self) -> Result<()> {
        match &*self.state.lock() {
            State::Active(session) => {
                session.core.history().tag();
                Ok(())
            }
            _ => Err(CacheError::NotActive),
        }
    }

    /// Intercept a read. When no session is active the request passes
    /// straight through to the device, unrecorded.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<ReadOutcome> {
        let core = match &*self.state.lock() {
            State::Active(session) => Some(Arc::clone(&session.core)),
            _ => None,
        };
        match core {
            Some(core) => core.read(offset, buf),
            None => {
                self.device.read_at(offset, buf)?;
                Ok(ReadOutcome {
                    hit_bytes: 0,
                    bypassed_bytes: buf.len() as u64,
                    blocked: false,
                })
            }
        }
    }

    /// Intercept a write (invalidation only; the host performs the
    /// actual write I/O).
    pub fn write(&self, offset: u64, length: u64) {
        let core = match &*self.state.lock() {
            State::Active(session) => Some(Arc::clone(&session.core)),
            _ => None,
        };
        if let Some(core) = core {
            core.write(offset, length);
        }
    }
}

impl Drop for CacheEngine {
    fn drop(&mut self) {
        if let State::Active(session) = std::mem::replace(self.state.get_mut(), State::Idle) {
            session.shutdown.store(true, Ordering::Relaxed);
            for worker in session.workers {
                let _ = worker.join();
            }
        }
    }
}

fn spawn_fetch_pool(core: Arc<CacheCore>, shutdown: Arc<AtomicBool>) -> Vec<JoinHandle<()>> {
    let order = core.index().fetch_order();
    if order.is_empty() {
        core.stats().mark_prefetch_stop();
        return Vec::new();
    }

    let (tx, rx) = channel::unbounded();
    for id in order {
        // unbounded channel, send cannot fail while rx is held below
        let _ = tx.send(id);
    }
    drop(tx);

    let pending = Arc::new(AtomicUsize::new(core.index().len()));
    (0..FETCH_WORKERS.min(core.index().len()))
        .map(|worker_id| {
            let core = Arc::clone(&core);
            let shutdown = Arc::clone(&shutdown);
            let rx = rx.clone();
            let pending = Arc::clone(&pending);
            std::thread::Builder::new()
                .name(format!("bootcache-fetch-{worker_id}"))
                .spawn(move || {
                    while let Ok(id) = rx.recv() {
                        if !shutdown.load(Ordering::Relaxed) {
                            fetch_extent(&core, id);
                        }
                        if pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                            core.stats().mark_prefetch_stop();
                        }
                    }
                })
                .expect("spawn fetch worker")
        })
        .collect()
}

/// Read one extent from the device and publish it to the index.
///
/// A device error is recovered locally: the extent goes to `Failed`,
/// waiters are woken, and unrelated extents are unaffected.
fn fetch_extent(core: &CacheCore, id: usize) {
    if !core.index().begin_fetch(id) {
        return;
    }
    let extent = *core.index().extent(id);
    core.stats().initiated_reads.fetch_add(1, Ordering::Relaxed);

    let mut data = vec![0u8; extent.length as usize];
    match core.device().read_at(extent.offset, &mut data) {
        Ok(()) => {
            core.stats()
                .read_blocks
                .fetch_add(core.index().blocks(extent.length), Ordering::Relaxed);
            core.index().complete_fetch(id, data);
        }
        Err(err) => {
            warn!(
                offset = extent.offset,
                length = extent.length,
                %err,
                "prefetch read failed, extent disabled"
            );
            core.stats().read_errors.fetch_add(1, Ordering::Relaxed);
            core.stats()
                .error_discards
                .fetch_add(core.index().blocks(extent.length), Ordering::Relaxed);
            core.index().fail_fetch(id);
        }
    }
}
