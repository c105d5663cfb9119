//! Block device adapter.
//!
//! The sole blocking I/O surface of the file system. Only the buffer cache
//! (`bio`) ever calls through this trait; nothing above it is allowed a
//! shortcut to the device. Calls are synchronous and may block arbitrarily
//! long. There is no retry policy here: a device that fails has failed, and
//! the adapter aborts rather than returning a recoverable error.

use crate::param::SECTOR_BYTES;
use std::sync::Mutex;

/// A sector number on the block device. Sector `0` is reserved as the
/// on-disk "no sector" sentinel and is never returned by a free map.
pub type SectorId = u32;

/// One sector's worth of bytes.
pub type SectorData = [u8; SECTOR_BYTES];

/// Synchronous, sector-granular storage. Implementations may assume every
/// `sector` passed in is in range; out-of-range access is a programming
/// error in the caller (the cache never passes one through unchecked, since
/// every sector it touches came from the free map or an on-disk pointer).
pub trait BlockDevice: Send + Sync {
    /// Reads the full contents of `sector` into `buf`.
    ///
    /// # Panics
    ///
    /// Implementations panic on any underlying device failure; there is no
    /// recoverable error path at this layer (§7, error kind 5).
    fn read(&self, sector: SectorId, buf: &mut SectorData);

    /// Writes the full contents of `buf` to `sector`.
    ///
    /// # Panics
    ///
    /// Same as `read`.
    fn write(&self, sector: SectorId, buf: &SectorData);

    /// Total number of addressable sectors, used by callers that size a
    /// free map to the device.
    fn num_sectors(&self) -> usize;
}

/// An in-memory stand-in for a real disk, used by this crate's own test
/// harness in place of the kernel's platform-specific driver.
///
/// Tracks raw read/write counts for diagnostic purposes. These are *not*
/// the `hit_count`/`access_count` instrumentation exposed by the cache
/// (§4.5) — they live one layer below it and count every device access the
/// cache actually issued, hits and misses alike.
pub struct MemBlockDevice {
    sectors: Mutex<Vec<SectorData>>,
    reads: Mutex<u64>,
    writes: Mutex<u64>,
}

impl MemBlockDevice {
    /// Creates a zero-filled device with `num_sectors` sectors.
    pub fn new(num_sectors: usize) -> Self {
        Self {
            sectors: Mutex::new(vec![[0u8; SECTOR_BYTES]; num_sectors]),
            reads: Mutex::new(0),
            writes: Mutex::new(0),
        }
    }

    pub fn read_count(&self) -> u64 {
        *self.reads.lock().unwrap()
    }

    pub fn write_count(&self) -> u64 {
        *self.writes.lock().unwrap()
    }
}

impl BlockDevice for MemBlockDevice {
    fn read(&self, sector: SectorId, buf: &mut SectorData) {
        let sectors = self.sectors.lock().unwrap();
        let slot = sectors
            .get(sector as usize)
            .unwrap_or_else(|| panic!("read of out-of-range sector {sector}"));
        buf.copy_from_slice(slot);
        drop(sectors);
        *self.reads.lock().unwrap() += 1;
    }

    fn write(&self, sector: SectorId, buf: &SectorData) {
        let mut sectors = self.sectors.lock().unwrap();
        let slot = sectors
            .get_mut(sector as usize)
            .unwrap_or_else(|| panic!("write of out-of-range sector {sector}"));
        slot.copy_from_slice(buf);
        drop(sectors);
        *self.writes.lock().unwrap() += 1;
    }

    fn num_sectors(&self) -> usize {
        self.sectors.lock().unwrap().len()
    }
}
