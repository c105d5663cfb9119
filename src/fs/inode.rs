//! Indexed multi-level inode layer.
//!
//! An on-disk inode indexes its data through direct, single-indirect, and
//! double-indirect pointers (§3/§6). Every sector this module touches —
//! inode record, indirect block, or data sector — goes through the buffer
//! cache; nothing here calls a block device or free map directly.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use scopeguard::guard;

use crate::bio::Cache;
use crate::device::{BlockDevice, SectorId};
use crate::error::FsResult;
use crate::freemap::FreeMap;
use crate::param::{INODE_MAGIC, NDIRECT, NINDIRECT, NO_SECTOR, SECTOR_BYTES};

/// The on-disk inode record, exactly one sector (§6).
#[derive(Clone)]
pub struct Dinode {
    pub length: u32,
    pub is_dir: bool,
    pub direct: [SectorId; NDIRECT],
    pub single_indirect: SectorId,
    pub double_indirect: SectorId,
}

impl Dinode {
    pub fn empty(is_dir: bool) -> Self {
        Self {
            length: 0,
            is_dir,
            direct: [NO_SECTOR; NDIRECT],
            single_indirect: NO_SECTOR,
            double_indirect: NO_SECTOR,
        }
    }

    pub fn to_bytes(&self) -> [u8; SECTOR_BYTES] {
        let mut buf = [0u8; SECTOR_BYTES];
        buf[0..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&(self.is_dir as u32).to_le_bytes());
        for (i, &s) in self.direct.iter().enumerate() {
            let off = 8 + i * 4;
            buf[off..off + 4].copy_from_slice(&s.to_le_bytes());
        }
        buf[500..504].copy_from_slice(&self.single_indirect.to_le_bytes());
        buf[504..508].copy_from_slice(&self.double_indirect.to_le_bytes());
        buf[508..512].copy_from_slice(&INODE_MAGIC.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; SECTOR_BYTES]) -> Self {
        let magic = u32::from_le_bytes(buf[508..512].try_into().unwrap());
        assert_eq!(
            magic, INODE_MAGIC,
            "on-disk inode magic mismatch at offset 508: corrupt sector or misaligned read"
        );
        let length = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let is_dir = u32::from_le_bytes(buf[4..8].try_into().unwrap()) != 0;
        let mut direct = [NO_SECTOR; NDIRECT];
        for (i, slot) in direct.iter_mut().enumerate() {
            let off = 8 + i * 4;
            *slot = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        }
        let single_indirect = u32::from_le_bytes(buf[500..504].try_into().unwrap());
        let double_indirect = u32::from_le_bytes(buf[504..508].try_into().unwrap());
        Self {
            length,
            is_dir,
            direct,
            single_indirect,
            double_indirect,
        }
    }
}

fn sectors_for_length(length: u32) -> usize {
    ceil_div(length as usize, SECTOR_BYTES)
}

fn ceil_div(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

fn read_indirect<D: BlockDevice>(cache: &Cache<D>, sector: SectorId) -> [SectorId; NINDIRECT] {
    let mut raw = [0u8; SECTOR_BYTES];
    cache.read(sector, &mut raw, 0, SECTOR_BYTES);
    let mut out = [NO_SECTOR; NINDIRECT];
    for (i, slot) in out.iter_mut().enumerate() {
        let off = i * 4;
        *slot = u32::from_le_bytes(raw[off..off + 4].try_into().unwrap());
    }
    out
}

fn write_indirect<D: BlockDevice>(cache: &Cache<D>, sector: SectorId, entries: &[SectorId; NINDIRECT]) {
    let mut raw = [0u8; SECTOR_BYTES];
    for (i, &e) in entries.iter().enumerate() {
        let off = i * 4;
        raw[off..off + 4].copy_from_slice(&e.to_le_bytes());
    }
    cache.write(sector, &raw, 0, SECTOR_BYTES);
}

pub fn read_dinode<D: BlockDevice>(cache: &Cache<D>, sector: SectorId) -> Dinode {
    let mut raw = [0u8; SECTOR_BYTES];
    cache.read(sector, &mut raw, 0, SECTOR_BYTES);
    Dinode::from_bytes(&raw)
}

pub fn write_dinode<D: BlockDevice>(cache: &Cache<D>, sector: SectorId, image: &Dinode) {
    cache.write(sector, &image.to_bytes(), 0, SECTOR_BYTES);
}

fn alloc_raw(freemap: &dyn FreeMap, tracking: &mut Vec<SectorId>) -> FsResult<SectorId> {
    let mut sector = NO_SECTOR;
    freemap.allocate(1, &mut sector)?;
    tracking.push(sector);
    Ok(sector)
}

fn alloc_zeroed<D: BlockDevice>(
    cache: &Cache<D>,
    freemap: &dyn FreeMap,
    tracking: &mut Vec<SectorId>,
) -> FsResult<SectorId> {
    let sector = alloc_raw(freemap, tracking)?;
    cache.write(sector, &[0u8; SECTOR_BYTES], 0, SECTOR_BYTES);
    Ok(sector)
}

/// Grows `image`'s index so it covers `new_length` bytes, allocating only
/// the sectors not already indexed. This is the correctness-critical
/// rollback path (§4.4): every sector allocated during this call is
/// tracked, and released back to the free map if any later allocation in
/// the same call fails, leaving both the free map and `image` exactly as
/// they were before the call.
pub fn allocate_blocks<D: BlockDevice>(
    cache: &Cache<D>,
    freemap: &dyn FreeMap,
    image: &mut Dinode,
    new_length: u32,
) -> FsResult<()> {
    let target = sectors_for_length(new_length);
    let before = image.clone();
    let mut allocated = guard(Vec::<SectorId>::new(), |sectors| {
        for s in sectors {
            freemap.release(s, 1);
        }
    });

    let outcome = (|| -> FsResult<()> {
        for i in 0..target.min(NDIRECT) {
            if image.direct[i] == NO_SECTOR {
                image.direct[i] = alloc_zeroed(cache, freemap, &mut allocated)?;
            }
        }
        if target <= NDIRECT {
            return Ok(());
        }

        let single_count = (target - NDIRECT).min(NINDIRECT);
        let mut single_entries = if image.single_indirect != NO_SECTOR {
            read_indirect(cache, image.single_indirect)
        } else {
            image.single_indirect = alloc_raw(freemap, &mut allocated)?;
            [NO_SECTOR; NINDIRECT]
        };
        for entry in single_entries.iter_mut().take(single_count) {
            if *entry == NO_SECTOR {
                *entry = alloc_zeroed(cache, freemap, &mut allocated)?;
            }
        }
        write_indirect(cache, image.single_indirect, &single_entries);
        if target <= NDIRECT + NINDIRECT {
            return Ok(());
        }

        let mut remaining = target - NDIRECT - NINDIRECT;
        let num_inner = ceil_div(remaining, NINDIRECT);
        let mut outer_entries = if image.double_indirect != NO_SECTOR {
            read_indirect(cache, image.double_indirect)
        } else {
            image.double_indirect = alloc_raw(freemap, &mut allocated)?;
            [NO_SECTOR; NINDIRECT]
        };
        for outer_entry in outer_entries.iter_mut().take(num_inner) {
            // Recomputed every iteration (not hoisted out of the loop): the
            // fix for the source's double-indirect counting bug (§9).
            let this_inner_count = remaining.min(NINDIRECT);
            remaining -= this_inner_count;
            let mut inner_entries = if *outer_entry != NO_SECTOR {
                read_indirect(cache, *outer_entry)
            } else {
                *outer_entry = alloc_raw(freemap, &mut allocated)?;
                [NO_SECTOR; NINDIRECT]
            };
            for entry in inner_entries.iter_mut().take(this_inner_count) {
                if *entry == NO_SECTOR {
                    *entry = alloc_zeroed(cache, freemap, &mut allocated)?;
                }
            }
            write_indirect(cache, *outer_entry, &inner_entries);
        }
        write_indirect(cache, image.double_indirect, &outer_entries);
        Ok(())
    })();

    match outcome {
        Ok(()) => {
            // Defuse the guard: nothing allocated in this call is released.
            let _ = scopeguard::ScopeGuard::into_inner(allocated);
            Ok(())
        }
        Err(e) => {
            *image = before;
            Err(e)
        }
    }
}

/// Walks the index to find the sector backing byte `pos` of `image`, or
/// `NO_SECTOR` if `pos` is at or past end-of-file (§4.4, I6).
pub fn byte_to_sector<D: BlockDevice>(cache: &Cache<D>, image: &Dinode, pos: u32) -> SectorId {
    if pos >= image.length {
        return NO_SECTOR;
    }
    let b = (pos as usize) / SECTOR_BYTES;
    if b < NDIRECT {
        return image.direct[b];
    }
    if b < NDIRECT + NINDIRECT {
        let entries = read_indirect(cache, image.single_indirect);
        return entries[b - NDIRECT];
    }
    let b2 = b - NDIRECT - NINDIRECT;
    let outer = read_indirect(cache, image.double_indirect);
    let inner = read_indirect(cache, outer[b2 / NINDIRECT]);
    inner[b2 % NINDIRECT]
}

/// Builds an inode record at `sector` sized to hold `length` bytes and
/// writes it through the cache. On allocation failure no sector ends up
/// allocated and `sector` is left untouched (I7).
pub fn inode_create<D: BlockDevice>(
    cache: &Cache<D>,
    freemap: &dyn FreeMap,
    sector: SectorId,
    length: u32,
    is_dir: bool,
) -> FsResult<()> {
    let mut image = Dinode::empty(is_dir);
    allocate_blocks(cache, freemap, &mut image, length)?;
    image.length = length;
    write_dinode(cache, sector, &image);
    Ok(())
}

/// Releases every sector reachable from the inode record at `sector` —
/// data sectors, indirect blocks, and the record itself — then the record
/// sector. Called once, from the last close of a removed inode.
fn deallocate_inode<D: BlockDevice>(cache: &Cache<D>, freemap: &dyn FreeMap, sector: SectorId) {
    let image = read_dinode(cache, sector);
    let total = sectors_for_length(image.length);

    for &d in image.direct.iter().take(total.min(NDIRECT)) {
        freemap.release(d, 1);
    }
    if total <= NDIRECT {
        freemap.release(sector, 1);
        return;
    }

    let single_count = (total - NDIRECT).min(NINDIRECT);
    let single_entries = read_indirect(cache, image.single_indirect);
    for &s in single_entries.iter().take(single_count) {
        freemap.release(s, 1);
    }
    freemap.release(image.single_indirect, 1);
    if total <= NDIRECT + NINDIRECT {
        freemap.release(sector, 1);
        return;
    }

    let mut remaining = total - NDIRECT - NINDIRECT;
    let num_inner = ceil_div(remaining, NINDIRECT);
    let outer_entries = read_indirect(cache, image.double_indirect);
    for &outer in outer_entries.iter().take(num_inner) {
        let this_inner_count = remaining.min(NINDIRECT);
        remaining -= this_inner_count;
        let inner_entries = read_indirect(cache, outer);
        for &s in inner_entries.iter().take(this_inner_count) {
            freemap.release(s, 1);
        }
        freemap.release(outer, 1);
    }
    freemap.release(image.double_indirect, 1);
    freemap.release(sector, 1);
}

struct InodeState {
    open_count: usize,
    deny_write_count: usize,
    removed: bool,
    extending: bool,
}

/// In-memory handle shared by every opener of the same on-disk inode.
pub struct Inode {
    pub sector: SectorId,
    state: Mutex<InodeState>,
    not_extending: Condvar,
}

impl Inode {
    fn new(sector: SectorId) -> Arc<Self> {
        Arc::new(Self {
            sector,
            state: Mutex::new(InodeState {
                open_count: 0,
                deny_write_count: 0,
                removed: false,
                extending: false,
            }),
            not_extending: Condvar::new(),
        })
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().unwrap().removed
    }

    pub fn remove(&self) {
        self.state.lock().unwrap().removed = true;
    }

    pub fn deny_write(&self) {
        let mut s = self.state.lock().unwrap();
        s.deny_write_count += 1;
        debug_assert!(s.deny_write_count <= s.open_count);
    }

    pub fn allow_write(&self) {
        let mut s = self.state.lock().unwrap();
        debug_assert!(s.deny_write_count > 0, "allow_write with no matching deny_write");
        s.deny_write_count -= 1;
    }

    fn wait_until_not_extending<'a>(&self, mut guard: MutexGuard<'a, InodeState>) -> MutexGuard<'a, InodeState> {
        while guard.extending {
            guard = self.not_extending.wait(guard).unwrap();
        }
        guard
    }
}

/// The process-wide open-inode set, keyed by inode sector (§9: a hash map
/// keyed by sector is an acceptable alternative to an intrusive list).
pub struct ITable {
    open: Mutex<HashMap<SectorId, Arc<Inode>>>,
}

impl ITable {
    pub fn new() -> Self {
        Self {
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the shared handle for `sector`, materializing and
    /// registering one on first open.
    pub fn open(&self, sector: SectorId) -> Arc<Inode> {
        let mut open = self.open.lock().unwrap();
        if let Some(existing) = open.get(&sector) {
            existing.state.lock().unwrap().open_count += 1;
            return Arc::clone(existing);
        }
        let inode = Inode::new(sector);
        inode.state.lock().unwrap().open_count = 1;
        open.insert(sector, Arc::clone(&inode));
        inode
    }

    /// Decrements `inode`'s open count; on the last close, unlinks it from
    /// the set and, if it was removed, deallocates its storage.
    pub fn close<D: BlockDevice>(&self, cache: &Cache<D>, freemap: &dyn FreeMap, inode: &Arc<Inode>) {
        let mut open = self.open.lock().unwrap();
        let should_deallocate = {
            let mut s = inode.state.lock().unwrap();
            s.open_count -= 1;
            if s.open_count > 0 {
                return;
            }
            s.removed
        };
        open.remove(&inode.sector);
        drop(open);
        if should_deallocate {
            deallocate_inode(cache, freemap, inode.sector);
        }
    }
}

impl Default for ITable {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads up to `dst.len()` bytes starting at `offset`, stopping at
/// end-of-file. A short read past EOF is not an error (§7, kind 2).
pub fn inode_read_at<D: BlockDevice>(cache: &Cache<D>, inode: &Inode, dst: &mut [u8], offset: u32) -> usize {
    {
        let guard = inode.state.lock().unwrap();
        inode.wait_until_not_extending(guard);
    }

    let image = read_dinode(cache, inode.sector);
    let mut done = 0usize;
    let mut pos = offset;
    while done < dst.len() {
        if pos >= image.length {
            break;
        }
        let sector = byte_to_sector(cache, &image, pos);
        let sector_offset = (pos as usize) % SECTOR_BYTES;
        let chunk = (dst.len() - done)
            .min(SECTOR_BYTES - sector_offset)
            .min((image.length - pos) as usize);
        if chunk == 0 {
            break;
        }
        cache.read(sector, &mut dst[done..done + chunk], sector_offset, chunk);
        done += chunk;
        pos += chunk as u32;
    }
    done
}

/// Writes `src` at `offset`, extending the file first if the write runs
/// past the current length. Returns 0 without writing anything if writes
/// are currently denied, or if extension fails to allocate enough sectors
/// (§7, kind 1 — no partial state change on that failure path).
pub fn inode_write_at<D: BlockDevice>(
    cache: &Cache<D>,
    freemap: &dyn FreeMap,
    inode: &Inode,
    src: &[u8],
    offset: u32,
) -> usize {
    let mut guard = inode.state.lock().unwrap();
    if guard.deny_write_count > 0 {
        return 0;
    }
    guard = inode.wait_until_not_extending(guard);

    let mut image = read_dinode(cache, inode.sector);
    let write_end = offset + src.len() as u32;

    if !src.is_empty() && write_end > image.length {
        guard.extending = true;
        let mut grown = image.clone();
        let result = allocate_blocks(cache, freemap, &mut grown, write_end);
        match result {
            Ok(()) => {
                grown.length = write_end;
                write_dinode(cache, inode.sector, &grown);
                image = grown;
            }
            Err(_) => {
                guard.extending = false;
                inode.not_extending.notify_all();
                return 0;
            }
        }
        guard.extending = false;
        inode.not_extending.notify_all();
    }
    drop(guard);

    let mut done = 0usize;
    let mut pos = offset;
    while done < src.len() {
        let sector = byte_to_sector(cache, &image, pos);
        let sector_offset = (pos as usize) % SECTOR_BYTES;
        let chunk = (src.len() - done).min(SECTOR_BYTES - sector_offset);
        cache.write(sector, &src[done..done + chunk], sector_offset, chunk);
        done += chunk;
        pos += chunk as u32;
    }
    done
}
