//! Free-sector map adapter.
//!
//! Out of scope per §1: the inode layer only ever calls `allocate(1, ..)`
//! and `release(sector, 1)`, so this module is a thin contract plus a
//! bitmap-backed implementation sized to the device, sufficient for
//! `fs_init` and this crate's own tests. A real deployment backs the same
//! trait with the on-disk free bitmap, which this crate treats as opaque.

use crate::device::SectorId;
use crate::error::{FsError, FsResult};
use crate::param::NO_SECTOR;
use std::sync::Mutex;

/// Allocates and releases runs of sectors. The inode layer is the sole
/// caller, and always with `n = 1`; the contract supports larger runs for
/// completeness and because a real free-map adapter exposes exactly this
/// shape.
pub trait FreeMap: Send + Sync {
    /// Finds `n` contiguous free sectors, marks them used, and returns the
    /// first one through `out`. Returns `Err` without side effects if no
    /// such run exists.
    fn allocate(&self, n: usize, out: &mut SectorId) -> FsResult<()>;

    /// Marks `n` sectors starting at `start` free again.
    fn release(&self, start: SectorId, n: usize);

    /// Number of sectors currently marked allocated, used by tests that
    /// check rollback (I7) against a "population" snapshot.
    fn allocated_count(&self) -> usize;
}

/// A simple bitmap over `[1, capacity)`; sector `0` is never handed out,
/// matching the `NO_SECTOR` sentinel used by on-disk pointer fields.
pub struct BitmapFreeMap {
    bits: Mutex<Vec<bool>>,
}

impl BitmapFreeMap {
    pub fn new(capacity: usize) -> Self {
        let mut bits = vec![false; capacity];
        if capacity > NO_SECTOR as usize {
            bits[NO_SECTOR as usize] = true;
        }
        Self {
            bits: Mutex::new(bits),
        }
    }
}

impl FreeMap for BitmapFreeMap {
    fn allocate(&self, n: usize, out: &mut SectorId) -> FsResult<()> {
        assert!(n > 0, "allocate of zero sectors");
        let mut bits = self.bits.lock().unwrap();
        let len = bits.len();
        'search: for start in 0..len {
            if start + n > len {
                break;
            }
            for offset in 0..n {
                if bits[start + offset] {
                    continue 'search;
                }
            }
            for offset in 0..n {
                bits[start + offset] = true;
            }
            *out = start as SectorId;
            return Ok(());
        }
        Err(FsError::OutOfSectors { requested: n })
    }

    fn release(&self, start: SectorId, n: usize) {
        let mut bits = self.bits.lock().unwrap();
        for offset in 0..n {
            let idx = start as usize + offset;
            assert!(bits[idx], "release of sector {idx} that was not allocated");
            bits[idx] = false;
        }
    }

    fn allocated_count(&self) -> usize {
        self.bits.lock().unwrap().iter().filter(|&&b| b).count()
    }
}
