//! Block device abstraction used by the fetch pool and the bypass path

use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// Read-only view of the underlying boot volume.
///
/// Implementations must be safe to call from multiple threads: the fetch
/// workers and every bypassed strategy call read through this trait
/// concurrently.
pub trait BlockDevice: Send + Sync {
    /// Fill `buf` from the device starting at byte `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Device size in bytes.
    fn len(&self) -> io::Result<u64>;
}

/// File-backed device (a raw device node or a volume image).
pub struct FileDevice {
    file: Mutex<File>,
}

impl FileDevice {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(FileDevice {
            file: Mutex::new(file),
        })
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    fn len(&self) -> io::Result<u64> {
        let file = self.file.lock();
        Ok(file.metadata()?.len())
    }
}

/// In-memory device for tests and benchmarks.
pub struct MemDevice {
    data: Vec<u8>,
}

impl MemDevice {
    pub fn new(data: Vec<u8>) -> Self {
        MemDevice { data }
    }

    /// Device of `len` bytes where byte `i` holds `i % 251`. The odd
    /// modulus keeps the pattern out of phase with block boundaries so
    /// off-by-one copies show up in tests.
    pub fn patterned(len: usize) -> Self {
        MemDevice {
            data: (0..len).map(|i| (i % 251) as u8).collect(),
        }
    }
}

impl BlockDevice for MemDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|&e| e <= self.data.len())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of device")
            })?;
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }
}
