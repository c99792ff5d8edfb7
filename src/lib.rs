//! Boot-time block-read cache engine
//!
//! During early startup most disk time is lost to many small scattered
//! reads. This engine turns the previous boot's I/O trace into a
//! *playlist* of disk extents, prefetches them in a few large ordered
//! reads, and intercepts inbound block reads to serve them from the
//! prefetched data. Everything it cannot serve passes through untouched,
//! and the true sequence of I/O is recorded so the playlist can be
//! regenerated for the next boot.
//!
//! ## Components
//!
//! - [`playlist`] - extent data model plus the sort/coalesce/merge
//!   algebra and history-to-playlist conversion
//! - [`index`] - per-mount extent index: interval lookup and per-extent
//!   fetch state with per-extent wait queues
//! - [`strategy`] - the per-request decision engine
//!   (hit / miss / bypass / block-on-fetch)
//! - [`history`] - cluster-allocated append-only I/O log
//! - [`stats`] - lock-free counters observed by every component
//! - [`engine`] - session lifecycle and the background fetch pool
//! - [`control`] - external command surface (START/STOP/HISTORY/STATS/TAG)
//! - [`device`] - block device abstraction for fetch and bypass I/O
//!
//! ## Example
//!
//! ```rust,no_run
//! use bootcache::{CacheEngine, Extent, ExtentFlags, FileDevice};
//! use std::sync::Arc;
//!
//! # fn main() -> bootcache::Result<()> {
//! let device = Arc::new(FileDevice::open("/dev/disk0s2")?);
//! let engine = CacheEngine::new(device);
//!
//! // Start with last boot's playlist; prefetch begins in the background.
//! let playlist = vec![Extent::new(0, 1 << 20, ExtentFlags::PREFETCH)];
//! engine.start(playlist, 4096)?;
//!
//! // The host forwards intercepted reads here.
//! let mut buf = vec![0u8; 4096];
//! engine.read(0, &mut buf)?;
//!
//! // Shut down and capture the history for the next boot's playlist.
//! engine.stop()?;
//! let (history, _truncated) = engine.history()?;
//! let next_playlist = bootcache::playlist_from_history(&history)?;
//! # let _ = next_playlist;
//! # Ok(())
//! # }
//! ```
//!
//! The engine never makes the boot path worse: a failed prefetch, a full
//! history log, or an exhausted wait all resolve to "treat as uncached".

pub mod control;
pub mod device;
pub mod engine;
pub mod error;
pub mod history;
pub mod index;
pub mod playlist;
pub mod stats;
pub mod strategy;

pub use control::{dispatch, Command, CommandReply, Opcode, MAGIC};
pub use device::{BlockDevice, FileDevice, MemDevice};
pub use engine::{CacheEngine, EngineState};
pub use error::{CacheError, Result};
pub use history::{HistoryEntry, HistoryKind, HistoryRecorder};
pub use index::{Classification, ExtentIndex, ExtentState};
pub use playlist::{
    coalesce_playlist, merge_playlists, playlist_from_history, sort_playlist, Extent, ExtentFlags,
    MAX_PLAYLIST_ENTRIES,
};
pub use stats::{Statistics, StatsSnapshot};
pub use strategy::{CacheCore, ReadOutcome};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
