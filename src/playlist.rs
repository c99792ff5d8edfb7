//! Playlist model: ordered extent collections and their algebra
//!
//! A playlist describes which regions of the boot volume should be
//! prefetched. Playlists arrive unsorted from the control channel or are
//! produced from a previous session's I/O history; the engine sorts and
//! coalesces them before building an extent index.

use crate::error::{CacheError, Result};
use crate::history::{HistoryEntry, HistoryKind};
use serde::{Deserialize, Serialize};
use std::ops::BitOr;

/// Sanity bound on the number of entries in any single playlist.
///
/// Exceeding it is a caller error, never a silent truncation.
pub const MAX_PLAYLIST_ENTRIES: usize = 100_000;

/// Per-extent flag bits, kept as a named bitset rather than a raw integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtentFlags(u32);

impl ExtentFlags {
    pub const NONE: ExtentFlags = ExtentFlags(0);

    /// Extent holds foreground-critical data and is fetched ahead of
    /// unflagged extents.
    pub const PREFETCH: ExtentFlags = ExtentFlags(1 << 0);

    const KNOWN: u32 = 1 << 0;

    /// Raw bit pattern, as stored in the wire record.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Parse from a wire record, dropping unknown bits.
    pub fn from_bits(bits: u32) -> Self {
        ExtentFlags(bits & Self::KNOWN)
    }

    pub fn contains(self, other: ExtentFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ExtentFlags {
    type Output = ExtentFlags;

    fn bitor(self, rhs: ExtentFlags) -> ExtentFlags {
        ExtentFlags(self.0 | rhs.0)
    }
}

/// A contiguous byte range on the block device.
///
/// Invariants: `length > 0` and `offset + length` does not wrap the
/// address space. Playlists entering through the control channel or
/// [`CacheEngine::start`](crate::engine::CacheEngine::start) are
/// validated against both before any extent arithmetic runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    /// Byte offset on the device
    pub offset: u64,
    /// Length in bytes
    pub length: u64,
    /// Flag bits (prefetch priority)
    pub flags: ExtentFlags,
}

impl Extent {
    pub fn new(offset: u64, length: u64, flags: ExtentFlags) -> Self {
        debug_assert!(length > 0, "zero-length extent");
        debug_assert!(
            offset.checked_add(length).is_some(),
            "extent end wraps the address space"
        );
        Extent {
            offset,
            length,
            flags,
        }
    }

    /// Validate a raw record against the extent invariants.
    pub fn checked(offset: u64, length: u64, flags: ExtentFlags) -> Result<Extent> {
        if length == 0 {
            return Err(CacheError::ZeroLengthExtent(offset));
        }
        if offset.checked_add(length).is_none() {
            return Err(CacheError::ExtentOverflow { offset, length });
        }
        Ok(Extent {
            offset,
            length,
            flags,
        })
    }

    /// First byte past the end of the extent.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Overlap test against an arbitrary byte range. The request side
    /// saturates, so a range running off the top of the address space
    /// behaves as if clamped to it.
    pub fn overlaps(&self, offset: u64, length: u64) -> bool {
        self.offset < offset.saturating_add(length) && offset < self.end()
    }

    /// Whether a byte range is entirely inside this extent.
    pub fn covers(&self, offset: u64, length: u64) -> bool {
        offset >= self.offset && offset.saturating_add(length) <= self.end()
    }

    /// Mergeability test for sorted extents: `self` precedes `other` and
    /// they overlap or abut.
    pub fn mergeable(&self, other: &Extent) -> bool {
        self.end() >= other.offset
    }

    /// Merge two overlapping or adjacent extents. Flags are OR-ed so a
    /// PREFETCH contribution is never lost.
    pub fn merge(&self, other: &Extent) -> Extent {
        let offset = self.offset.min(other.offset);
        let end = self.end().max(other.end());
        Extent {
            offset,
            length: end - offset,
            flags: self.flags | other.flags,
        }
    }
}

/// Sort extents by offset ascending, ties broken by length ascending.
///
/// The tie-break makes coalescing deterministic regardless of the order
/// entries arrived in.
pub fn sort_playlist(entries: &mut [Extent]) {
    entries.sort_by(|a, b| {
        a.offset
            .cmp(&b.offset)
            .then_with(|| a.length.cmp(&b.length))
    });
}

/// Coalesce a sorted playlist in a single left-to-right pass.
///
/// Output extents never overlap or abut one another, so every byte of the
/// input coverage appears in exactly one output extent. Idempotent.
pub fn coalesce_playlist(sorted: &[Extent]) -> Vec<Extent> {
    let mut out: Vec<Extent> = Vec::with_capacity(sorted.len());
    for ext in sorted {
        match out.last_mut() {
            Some(prev) if prev.mergeable(ext) => *prev = prev.merge(ext),
            _ => out.push(*ext),
        }
    }
    out
}

/// Combine a freshly generated playlist with one from a previous session.
///
/// Concatenates, sorts and coalesces. Fails with `CapacityExceeded` when
/// the combined entry count is over [`MAX_PLAYLIST_ENTRIES`].
pub fn merge_playlists(base: &[Extent], incoming: &[Extent]) -> Result<Vec<Extent>> {
    let count = base.len() + incoming.len();
    if count > MAX_PLAYLIST_ENTRIES {
        return Err(CacheError::CapacityExceeded {
            count,
            limit: MAX_PLAYLIST_ENTRIES,
        });
    }
    let mut combined = Vec::with_capacity(count);
    combined.extend_from_slice(base);
    combined.extend_from_slice(incoming);
    sort_playlist(&mut combined);
    Ok(coalesce_playlist(&combined))
}

/// Convert a drained I/O history into the playlist for the next boot.
///
/// `Hit` and `Miss` records both describe data the boot actually read, so
/// both become extents; misses were demanded but uncached, so they carry
/// the PREFETCH flag to be scheduled first next time. `Tag` and `Write`
/// records are markers and invalidations, not coverage, and are skipped.
pub fn playlist_from_history(history: &[HistoryEntry]) -> Result<Vec<Extent>> {
    let mut entries: Vec<Extent> = Vec::new();
    for he in history {
        let flags = match he.kind {
            HistoryKind::Miss => ExtentFlags::PREFETCH,
            HistoryKind::Hit => ExtentFlags::NONE,
            HistoryKind::Tag | HistoryKind::Write => continue,
        };
        if he.length == 0 {
            continue;
        }
        entries.push(Extent::checked(he.offset, he.length, flags)?);
        if entries.len() > MAX_PLAYLIST_ENTRIES {
            return Err(CacheError::CapacityExceeded {
                count: entries.len(),
                limit: MAX_PLAYLIST_ENTRIES,
            });
        }
    }
    sort_playlist(&mut entries);
    Ok(coalesce_playlist(&entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(offset: u64, length: u64) -> Extent {
        Extent::new(offset, length, ExtentFlags::NONE)
    }

    fn pf(offset: u64, length: u64) -> Extent {
        Extent::new(offset, length, ExtentFlags::PREFETCH)
    }

    #[test]
    fn test_sort_orders_by_offset_then_length() {
        let mut p = vec![ext(100, 50), ext(0, 20), ext(100, 10)];
        sort_playlist(&mut p);
        assert_eq!(p, vec![ext(0, 20), ext(100, 10), ext(100, 50)]);
    }

    #[test]
    fn test_coalesce_merges_overlapping_and_adjacent() {
        let mut p = vec![ext(0, 4096), ext(4096, 4096), ext(2048, 1024), ext(10000, 8)];
        sort_playlist(&mut p);
        let c = coalesce_playlist(&p);
        assert_eq!(c, vec![ext(0, 8192), ext(10000, 8)]);
    }

    #[test]
    fn test_coalesce_preserves_prefetch_flag() {
        let mut p = vec![ext(0, 4096), pf(4096, 4096)];
        sort_playlist(&mut p);
        let c = coalesce_playlist(&p);
        assert_eq!(c.len(), 1);
        assert!(c[0].flags.contains(ExtentFlags::PREFETCH));
        assert_eq!(c[0].length, 8192);
    }

    #[test]
    fn test_coalesce_idempotent() {
        let mut p = vec![ext(0, 100), ext(50, 100), ext(400, 10), ext(410, 5)];
        sort_playlist(&mut p);
        let once = coalesce_playlist(&p);
        let twice = coalesce_playlist(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_coalesce_leaves_gapped_extents_alone() {
        let p = vec![ext(0, 10), ext(11, 10)];
        assert_eq!(coalesce_playlist(&p), p);
    }

    #[test]
    fn test_merge_respects_capacity_bound() {
        let base: Vec<Extent> = (0..60_000u64).map(|i| ext(i * 10, 1)).collect();
        let incoming: Vec<Extent> = (0..60_000u64).map(|i| ext(i * 10 + 5, 1)).collect();
        let err = merge_playlists(&base, &incoming).unwrap_err();
        assert!(matches!(
            err,
            CacheError::CapacityExceeded { count: 120_000, .. }
        ));
    }

    #[test]
    fn test_merge_combines_coverage() {
        let base = vec![ext(0, 100)];
        let incoming = vec![pf(100, 100), pf(500, 10)];
        let merged = merge_playlists(&base, &incoming).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].offset, 0);
        assert_eq!(merged[0].length, 200);
        assert!(merged[0].flags.contains(ExtentFlags::PREFETCH));
    }

    #[test]
    fn test_playlist_from_history_skips_tags_and_writes() {
        let history = vec![
            HistoryEntry::new(0, 4096, HistoryKind::Hit),
            HistoryEntry::new(0, 0, HistoryKind::Tag),
            HistoryEntry::new(8192, 4096, HistoryKind::Write),
            HistoryEntry::new(4096, 4096, HistoryKind::Miss),
        ];
        let p = playlist_from_history(&history).unwrap();
        assert_eq!(p.len(), 1);
        assert_eq!(p[0].offset, 0);
        assert_eq!(p[0].length, 8192);
        assert!(p[0].flags.contains(ExtentFlags::PREFETCH));
    }

    #[test]
    fn test_checked_rejects_invariant_violations() {
        assert!(matches!(
            Extent::checked(u64::MAX - 8, 64, ExtentFlags::NONE).unwrap_err(),
            CacheError::ExtentOverflow { length: 64, .. }
        ));
        assert!(matches!(
            Extent::checked(5, 0, ExtentFlags::NONE).unwrap_err(),
            CacheError::ZeroLengthExtent(5)
        ));
        assert!(Extent::checked(u64::MAX - 8, 8, ExtentFlags::NONE).is_ok());
    }

    #[test]
    fn test_flags_wire_roundtrip_drops_unknown_bits() {
        let f = ExtentFlags::from_bits(0xdead_beef);
        assert_eq!(f, ExtentFlags::PREFETCH);
    }
}
