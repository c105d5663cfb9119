//! A fixed-capacity write-back buffer cache and indexed multi-level inode
//! layer for a pedagogical kernel's file system.
//!
//! Layering, outside in: [`fs`] (boundary glue + inodes) calls only
//! [`bio`] (the buffer cache), which calls only [`device`] (the block
//! device). [`freemap`] is a sibling dependency of the inode layer.
//! Nothing above [`bio`] ever reaches past it to the device or the free
//! map directly.

pub mod bio;
pub mod device;
pub mod error;
pub mod freemap;
pub mod fs;
pub mod param;

pub use bio::Cache;
pub use device::{BlockDevice, MemBlockDevice, SectorData, SectorId};
pub use error::{FsError, FsResult};
pub use freemap::{BitmapFreeMap, FreeMap};
pub use fs::inode::{Dinode, Inode};
pub use fs::FileSystem;
