//! History recorder: append-only log of intercepted I/O outcomes
//!
//! Every classified request produces one entry. Storage is allocated in
//! fixed-capacity clusters on demand up to a global cap; past the cap the
//! log is marked truncated and further entries are dropped. Recording is
//! best-effort: the read path never fails or blocks because history could
//! not be stored.

use crate::stats::Statistics;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::warn;

/// Entries per history cluster.
pub const HISTORY_CLUSTER_ENTRIES: usize = 512;

/// Cap on allocated clusters; past this the log is truncated.
pub const HISTORY_MAX_CLUSTERS: usize = 32;

/// Classification outcome recorded for one intercepted I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum HistoryKind {
    /// Read was not satisfied from the cache
    Miss = 0,
    /// Read was satisfied from the cache
    Hit = 1,
    /// Synthetic marker injected through the control channel
    Tag = 2,
    /// Write-through operation (cache invalidation)
    Write = 3,
}

impl HistoryKind {
    pub fn from_wire(flags: i32) -> Option<Self> {
        match flags {
            0 => Some(HistoryKind::Miss),
            1 => Some(HistoryKind::Hit),
            2 => Some(HistoryKind::Tag),
            3 => Some(HistoryKind::Write),
            _ => None,
        }
    }
}

/// One record in the history log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub offset: u64,
    pub length: u64,
    pub kind: HistoryKind,
}

impl HistoryEntry {
    pub fn new(offset: u64, length: u64, kind: HistoryKind) -> Self {
        HistoryEntry {
            offset,
            length,
            kind,
        }
    }
}

#[derive(Debug, Default)]
struct HistoryLog {
    clusters: Vec<Vec<HistoryEntry>>,
    truncated: bool,
}

/// Cluster-allocated append-only recorder.
#[derive(Debug)]
pub struct HistoryRecorder {
    log: Mutex<HistoryLog>,
    cluster_entries: usize,
    max_clusters: usize,
    stats: Arc<Statistics>,
}

impl HistoryRecorder {
    pub fn new(stats: Arc<Statistics>) -> Self {
        Self::with_capacity(HISTORY_CLUSTER_ENTRIES, HISTORY_MAX_CLUSTERS, stats)
    }

    /// Recorder with explicit cluster geometry. Exposed for tests that
    /// need to force truncation without recording thousands of entries.
    pub fn with_capacity(
        cluster_entries: usize,
        max_clusters: usize,
        stats: Arc<Statistics>,
    ) -> Self {
        debug_assert!(cluster_entries > 0);
        HistoryRecorder {
            log: Mutex::new(HistoryLog::default()),
            cluster_entries,
            max_clusters,
            stats,
        }
    }

    /// Append an entry, allocating a new cluster if the active one is
    /// full. Entries past the cluster cap are dropped and the log is
    /// flagged truncated.
    pub fn record(&self, entry: HistoryEntry) {
        let mut log = self.log.lock();
        let needs_cluster = log
            .clusters
            .last()
            .map_or(true, |c| c.len() >= self.cluster_entries);
        if needs_cluster {
            if log.clusters.len() >= self.max_clusters {
                if !log.truncated {
                    warn!(
                        clusters = log.clusters.len(),
                        "history list truncated, dropping further entries"
                    );
                    log.truncated = true;
                }
                return;
            }
            log.clusters.push(Vec::with_capacity(self.cluster_entries));
            self.stats.history_clusters.fetch_add(1, Ordering::Relaxed);
        }
        log.clusters
            .last_mut()
            .expect("cluster allocated above")
            .push(entry);
    }

    /// Inject a synthetic marker at the current logical position.
    pub fn tag(&self) {
        self.record(HistoryEntry::new(0, 0, HistoryKind::Tag));
    }

    /// Number of entries currently recorded.
    pub fn len(&self) -> usize {
        self.log.lock().clusters.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether entries have been dropped since the last drain.
    pub fn truncated(&self) -> bool {
        self.log.lock().truncated
    }

    /// Return all entries in recording order and clear the log.
    pub fn drain(&self) -> (Vec<HistoryEntry>, bool) {
        let mut log = self.log.lock();
        let truncated = log.truncated;
        let entries = log.clusters.drain(..).flatten().collect();
        log.truncated = false;
        (entries, truncated)
    }
}
