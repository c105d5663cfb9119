//! Compile-time and default-configuration constants shared across the crate.
//!
//! Most of these mirror fixed points of the on-disk format and therefore
//! cannot be changed without also changing the format; a few (`N_SLOTS`)
//! are merely the production-shaped default and are threaded through as
//! constructor parameters so tests can pick smaller values.

/// Size in bytes of a single sector, both on the device and in a cache slot.
pub const SECTOR_BYTES: usize = 512;

/// Default number of slots in the buffer cache.
pub const N_SLOTS: usize = 64;

/// Number of direct block pointers stored in an on-disk inode.
pub const NDIRECT: usize = 123;

/// Number of sector-id entries in one indirect block (single or inner
/// block of a double-indirect table).
pub const NINDIRECT: usize = 128;

/// Largest file size representable by the direct + single-indirect +
/// double-indirect index, in sectors.
pub const MAXFILE_SECTORS: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;

/// Largest file size representable by the index, in bytes.
pub const MAXFILE_BYTES: usize = MAXFILE_SECTORS * SECTOR_BYTES;

/// Tag written into every on-disk inode for integrity checking.
pub const INODE_MAGIC: u32 = 0x494E_4F44;

/// Sector number reserved to mean "no sector": never allocated for data use,
/// and the value left in an on-disk pointer field that has not yet been
/// filled in.
pub const NO_SECTOR: u32 = 0;

/// Inode number of the root directory, created by `fs_init` when formatting.
pub const ROOT_INODE: u32 = 1;

static_assertions::const_assert!(SECTOR_BYTES.is_power_of_two());
static_assertions::const_assert!(8 + NDIRECT * 4 + 4 + 4 + 4 <= SECTOR_BYTES);
static_assertions::const_assert!(NINDIRECT * 4 == SECTOR_BYTES);
