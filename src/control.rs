//! Control protocol: the external command surface of the engine
//!
//! Commands carry a stable binary layout so the control tool and the
//! engine can evolve independently: a magic/opcode/param header plus an
//! opcode-specific payload buffer. Playlist and history payloads are
//! packed little-endian records; the statistics payload is the snapshot
//! serialized as JSON for the reporting tooling.

use crate::engine::CacheEngine;
use crate::error::{CacheError, Result};
use crate::history::{HistoryEntry, HistoryKind};
use crate::playlist::{Extent, ExtentFlags, MAX_PLAYLIST_ENTRIES};

/// Version magic; a mismatch rejects the command outright.
pub const MAGIC: i32 = 0x1010_2021;

/// Wire size of one playlist record: offset u64, length u64, flags u32.
pub const PLAYLIST_RECORD_SIZE: usize = 20;

/// Wire size of one history record: offset u64, length u64, flags i32.
pub const HISTORY_RECORD_SIZE: usize = 20;

/// Playlist entries decoded per chunk, bounding the working set of a
/// single command regardless of payload size.
pub const PLAYLIST_CHUNK_ENTRIES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Opcode {
    Start = 1,
    Stop = 2,
    History = 3,
    Stats = 4,
    Tag = 5,
}

impl Opcode {
    pub fn from_wire(opcode: i32) -> Option<Self> {
        match opcode {
            1 => Some(Opcode::Start),
            2 => Some(Opcode::Stop),
            3 => Some(Opcode::History),
            4 => Some(Opcode::Stats),
            5 => Some(Opcode::Tag),
            _ => None,
        }
    }
}

/// One control command as received from the channel.
#[derive(Debug, Clone)]
pub struct Command {
    pub magic: i32,
    pub opcode: i32,
    /// Opcode-specific scalar; the block size for START.
    pub param: i32,
    /// Opcode-specific payload buffer.
    pub data: Vec<u8>,
}

impl Command {
    pub fn new(opcode: Opcode, param: i32, data: Vec<u8>) -> Self {
        Command {
            magic: MAGIC,
            opcode: opcode as i32,
            param,
            data,
        }
    }
}

/// Successful command completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    Started,
    /// Pending history size in bytes; 0 signals truncation and HISTORY
    /// must still be issued to clear the log.
    Stopped { history_bytes: usize },
    /// Packed history records.
    History { data: Vec<u8>, truncated: bool },
    /// Statistics snapshot as JSON.
    Stats { data: Vec<u8> },
    Tagged,
}

/// Validate and execute one command against the engine.
///
/// Protocol errors and capacity errors surface synchronously and change
/// no engine state.
pub fn dispatch(engine: &CacheEngine, cmd: &Command) -> Result<CommandReply> {
    if cmd.magic != MAGIC {
        return Err(CacheError::InvalidMagic(cmd.magic));
    }
    let opcode = Opcode::from_wire(cmd.opcode).ok_or(CacheError::InvalidOpcode(cmd.opcode))?;
    match opcode {
        Opcode::Start => {
            let playlist = decode_playlist(&cmd.data)?;
            engine.start(playlist, cmd.param)?;
            Ok(CommandReply::Started)
        }
        Opcode::Stop => {
            let history_bytes = engine.stop()?;
            Ok(CommandReply::Stopped { history_bytes })
        }
        Opcode::History => {
            let (entries, truncated) = engine.history()?;
            Ok(CommandReply::History {
                data: encode_history(&entries),
                truncated,
            })
        }
        Opcode::Stats => {
            let data = serde_json::to_vec(&engine.stats())?;
            Ok(CommandReply::Stats { data })
        }
        Opcode::Tag => {
            engine.tag()?;
            Ok(CommandReply::Tagged)
        }
    }
}

/// Decode a START payload of packed playlist records.
///
/// Decoding walks the buffer in [`PLAYLIST_CHUNK_ENTRIES`]-sized chunks
/// so a single command never stages an unbounded working set.
pub fn decode_playlist(data: &[u8]) -> Result<Vec<Extent>> {
    if data.len() % PLAYLIST_RECORD_SIZE != 0 {
        return Err(CacheError::MalformedPayload {
            got: data.len(),
            record: PLAYLIST_RECORD_SIZE,
        });
    }
    let count = data.len() / PLAYLIST_RECORD_SIZE;
    if count > MAX_PLAYLIST_ENTRIES {
        return Err(CacheError::CapacityExceeded {
            count,
            limit: MAX_PLAYLIST_ENTRIES,
        });
    }

    let mut playlist = Vec::with_capacity(count);
    for chunk in data.chunks(PLAYLIST_CHUNK_ENTRIES * PLAYLIST_RECORD_SIZE) {
        for rec in chunk.chunks_exact(PLAYLIST_RECORD_SIZE) {
            let offset = u64::from_le_bytes(rec[0..8].try_into().expect("record size"));
            let length = u64::from_le_bytes(rec[8..16].try_into().expect("record size"));
            let flags = u32::from_le_bytes(rec[16..20].try_into().expect("record size"));
            playlist.push(Extent::checked(offset, length, ExtentFlags::from_bits(flags))?);
        }
    }
    Ok(playlist)
}

/// Encode a playlist as packed records, the inverse of
/// [`decode_playlist`]. Used by playlist producers and tests.
pub fn encode_playlist(playlist: &[Extent]) -> Vec<u8> {
    let mut data = Vec::with_capacity(playlist.len() * PLAYLIST_RECORD_SIZE);
    for e in playlist {
        data.extend_from_slice(&e.offset.to_le_bytes());
        data.extend_from_slice(&e.length.to_le_bytes());
        data.extend_from_slice(&e.flags.bits().to_le_bytes());
    }
    data
}

/// Encode drained history entries as packed records.
pub fn encode_history(entries: &[HistoryEntry]) -> Vec<u8> {
    let mut data = Vec::with_capacity(entries.len() * HISTORY_RECORD_SIZE);
    for e in entries {
        data.extend_from_slice(&e.offset.to_le_bytes());
        data.extend_from_slice(&e.length.to_le_bytes());
        data.extend_from_slice(&(e.kind as i32).to_le_bytes());
    }
    data
}

/// Decode a HISTORY payload, used by the playlist-generation consumer.
pub fn decode_history(data: &[u8]) -> Result<Vec<HistoryEntry>> {
    if data.len() % HISTORY_RECORD_SIZE != 0 {
        return Err(CacheError::MalformedPayload {
            got: data.len(),
            record: HISTORY_RECORD_SIZE,
        });
    }
    let mut entries = Vec::with_capacity(data.len() / HISTORY_RECORD_SIZE);
    for rec in data.chunks_exact(HISTORY_RECORD_SIZE) {
        let offset = u64::from_le_bytes(rec[0..8].try_into().expect("record size"));
        let length = u64::from_le_bytes(rec[8..16].try_into().expect("record size"));
        let flags = i32::from_le_bytes(rec[16..20].try_into().expect("record size"));
        let kind = HistoryKind::from_wire(flags).ok_or(CacheError::InvalidHistoryKind(flags))?;
        entries.push(HistoryEntry::new(offset, length, kind));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use std::sync::Arc;

    fn engine() -> CacheEngine {
        CacheEngine::new(Arc::new(MemDevice::patterned(1 << 20)))
    }

    #[test]
    fn test_playlist_wire_roundtrip() {
        let playlist = vec![
            Extent::new(0, 8192, ExtentFlags::PREFETCH),
            Extent::new(65536, 4096, ExtentFlags::NONE),
        ];
        let data = encode_playlist(&playlist);
        assert_eq!(data.len(), 2 * PLAYLIST_RECORD_SIZE);
        assert_eq!(decode_playlist(&data).unwrap(), playlist);
    }

    #[test]
    fn test_decode_rejects_partial_record() {
        let err = decode_playlist(&[0u8; 19]).unwrap_err();
        assert!(matches!(
            err,
            CacheError::MalformedPayload { got: 19, record: 20 }
        ));
    }

    #[test]
    fn test_decode_rejects_zero_length_extent() {
        let data = encode_playlist(&[Extent {
            offset: 42,
            length: 0,
            flags: ExtentFlags::NONE,
        }]);
        assert!(matches!(
            decode_playlist(&data).unwrap_err(),
            CacheError::ZeroLengthExtent(42)
        ));
    }

    #[test]
    fn test_decode_rejects_extent_past_address_space() {
        let data = encode_playlist(&[Extent {
            offset: u64::MAX - 8,
            length: 64,
            flags: ExtentFlags::NONE,
        }]);
        assert!(matches!(
            decode_playlist(&data).unwrap_err(),
            CacheError::ExtentOverflow { length: 64, .. }
        ));
    }

    #[test]
    fn test_history_wire_roundtrip() {
        let entries = vec![
            HistoryEntry::new(0, 4096, HistoryKind::Miss),
            HistoryEntry::new(0, 0, HistoryKind::Tag),
            HistoryEntry::new(8192, 512, HistoryKind::Write),
        ];
        let data = encode_history(&entries);
        assert_eq!(decode_history(&data).unwrap(), entries);
    }

    #[test]
    fn test_dispatch_rejects_bad_magic_and_opcode() {
        let engine = engine();
        let mut cmd = Command::new(Opcode::Stats, 0, Vec::new());
        cmd.magic = 0x0bad_beef;
        assert!(matches!(
            dispatch(&engine, &cmd).unwrap_err(),
            CacheError::InvalidMagic(0x0bad_beef)
        ));

        let cmd = Command {
            magic: MAGIC,
            opcode: 99,
            param: 0,
            data: Vec::new(),
        };
        assert!(matches!(
            dispatch(&engine, &cmd).unwrap_err(),
            CacheError::InvalidOpcode(99)
        ));
    }

    #[test]
    fn test_dispatch_stats_valid_in_any_state() {
        let engine = engine();
        let reply = dispatch(&engine, &Command::new(Opcode::Stats, 0, Vec::new())).unwrap();
        let CommandReply::Stats { data } = reply else {
            panic!("expected stats reply");
        };
        let snap: crate::stats::StatsSnapshot = serde_json::from_slice(&data).unwrap();
        assert_eq!(snap.strategy_calls, 0);
    }

    #[test]
    fn test_dispatch_start_with_invalid_blocksize() {
        let engine = engine();
        let cmd = Command::new(Opcode::Start, -4096, Vec::new());
        assert!(matches!(
            dispatch(&engine, &cmd).unwrap_err(),
            CacheError::InvalidBlockSize(-4096)
        ));
    }
}
