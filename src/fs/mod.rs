//! File-system boundary glue (C6): mount/unmount hooks wiring the cache,
//! free map, and open-inode set together, plus the thin operation surface
//! the rest of the kernel calls through.

pub mod inode;

use std::sync::Arc;

use log::info;

use crate::bio::Cache;
use crate::device::BlockDevice;
use crate::error::FsResult;
use crate::freemap::FreeMap;
use crate::param::{N_SLOTS, NO_SECTOR, ROOT_INODE};
use inode::{ITable, Inode};

pub use inode::Dinode;

/// Owns the two pieces of global mutable state this crate has (§9): the
/// buffer cache and the open-inode set. Both are created here and live for
/// exactly as long as the file system is mounted.
pub struct FileSystem<D: BlockDevice> {
    cache: Arc<Cache<D>>,
    freemap: Arc<dyn FreeMap>,
    itable: ITable,
}

impl<D: BlockDevice> FileSystem<D> {
    /// Mounts the file system over `device`, backed by `freemap` for sector
    /// allocation. When `format` is set, also creates an empty root
    /// directory at `ROOT_INODE`.
    pub fn init(device: Arc<D>, freemap: Arc<dyn FreeMap>, format: bool) -> FsResult<Self> {
        info!("fs: init (format={format})");
        let cache = Arc::new(Cache::init(device, N_SLOTS));
        let fs = Self {
            cache,
            freemap,
            itable: ITable::new(),
        };
        if format {
            let mut root_sector = NO_SECTOR;
            fs.freemap.allocate(1, &mut root_sector)?;
            assert_eq!(
                root_sector, ROOT_INODE,
                "formatting a fresh device must hand out the reserved root inode sector first"
            );
            inode::inode_create(&fs.cache, fs.freemap.as_ref(), ROOT_INODE, 0, true)?;
        }
        Ok(fs)
    }

    /// Flushes every dirty cache slot. Called once at unmount.
    pub fn shutdown(&self) {
        info!("fs: shutdown");
        self.cache.flush();
    }

    pub fn create(&self, sector: u32, length: u32, is_dir: bool) -> FsResult<()> {
        inode::inode_create(&self.cache, self.freemap.as_ref(), sector, length, is_dir)
    }

    pub fn open(&self, sector: u32) -> Arc<Inode> {
        self.itable.open(sector)
    }

    pub fn close(&self, inode: &Arc<Inode>) {
        self.itable.close(&self.cache, self.freemap.as_ref(), inode)
    }

    pub fn read_at(&self, inode: &Inode, dst: &mut [u8], offset: u32) -> usize {
        inode::inode_read_at(&self.cache, inode, dst, offset)
    }

    pub fn write_at(&self, inode: &Inode, src: &[u8], offset: u32) -> usize {
        inode::inode_write_at(&self.cache, self.freemap.as_ref(), inode, src, offset)
    }

    pub fn remove(&self, inode: &Inode) {
        inode.remove();
    }

    pub fn deny_write(&self, inode: &Inode) {
        inode.deny_write();
    }

    pub fn allow_write(&self, inode: &Inode) {
        inode.allow_write();
    }

    /// Allocates a free sector for a new inode record, e.g. for a
    /// directory entry creating a file. Not part of the inode layer
    /// itself, which always takes its target sector as a parameter.
    pub fn allocate_inode_sector(&self) -> FsResult<u32> {
        let mut sector = NO_SECTOR;
        self.freemap.allocate(1, &mut sector)?;
        Ok(sector)
    }

    pub fn cache(&self) -> &Cache<D> {
        &self.cache
    }

    pub fn hit_count(&self) -> u64 {
        self.cache.hit_count()
    }

    pub fn access_count(&self) -> u64 {
        self.cache.access_count()
    }

    pub fn reset_instrumentation(&self) {
        self.cache.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BlockDevice, MemBlockDevice};
    use crate::freemap::BitmapFreeMap;

    fn mounted(num_sectors: usize) -> FileSystem<MemBlockDevice> {
        let device = Arc::new(MemBlockDevice::new(num_sectors));
        let freemap: Arc<dyn FreeMap> = Arc::new(BitmapFreeMap::new(num_sectors));
        FileSystem::init(device, freemap, true).unwrap()
    }

    #[test]
    fn format_creates_root_directory() {
        let fs = mounted(256);
        let root = fs.open(ROOT_INODE);
        assert!(!root.is_removed());
        fs.close(&root);
    }

    #[test]
    fn create_open_write_read_close_round_trip() {
        let fs = mounted(256);
        let sector = fs.allocate_inode_sector().unwrap();
        fs.create(sector, 0, false).unwrap();
        let handle = fs.open(sector);
        let written = fs.write_at(&handle, b"hello", 0);
        assert_eq!(written, 5);
        let mut out = [0u8; 5];
        let read = fs.read_at(&handle, &mut out, 0);
        assert_eq!(read, 5);
        assert_eq!(&out, b"hello");
        fs.close(&handle);
    }

    #[test]
    fn shutdown_flushes_pending_writes() {
        let device = Arc::new(MemBlockDevice::new(256));
        let freemap: Arc<dyn FreeMap> = Arc::new(BitmapFreeMap::new(256));
        let fs = FileSystem::init(Arc::clone(&device), freemap, true).unwrap();
        let sector = fs.allocate_inode_sector().unwrap();
        fs.create(sector, 0, false).unwrap();
        let handle = fs.open(sector);
        fs.write_at(&handle, &[0x42u8; 512], 0);
        fs.close(&handle);
        fs.shutdown();

        let image = inode::read_dinode(fs.cache(), sector);
        let mut data = [0u8; 512];
        device.read(image.direct[0], &mut data);
        assert_eq!(data, [0x42u8; 512]);
    }
}
