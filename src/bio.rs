//! Buffer cache.
//!
//! A fixed-capacity, write-back, LRU-replacement cache of sector-sized
//! slots sitting between the file system and the raw block device.
//!
//! Interface:
//! * `read`/`write` address a sector by number, not by a borrowed handle:
//!   callers never hold a reference into a slot across a suspension point.
//! * `flush` writes back every currently-dirty slot.
//! * `hit_count`/`access_count`/`reset` are the instrumentation surface
//!   (§4.5); test harnesses use them between phases.
//!
//! One mutex guards every piece of cache metadata (slot state, LRU order,
//! counters). It is released for the duration of any device I/O and
//! reacquired afterward; every suspension point re-validates state on wake
//! (the access loop simply `continue`s).

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use array_macro::array;
use log::{debug, trace};

use crate::device::{BlockDevice, SectorData, SectorId};
use crate::param::SECTOR_BYTES;

struct Slot {
    sector: Option<SectorId>,
    data: SectorData,
    dirty: bool,
    ready: bool,
}

impl Slot {
    const fn unassigned() -> Self {
        Self {
            sector: None,
            data: [0; SECTOR_BYTES],
            dirty: false,
            ready: true,
        }
    }
}

struct CacheState {
    slots: Vec<Slot>,
    /// Front = most recently used, back = least recently used.
    lru: VecDeque<usize>,
    num_ready: usize,
    hits: u64,
    accesses: u64,
}

impl CacheState {
    fn fresh(n_slots: usize) -> Self {
        Self {
            slots: (0..n_slots).map(|_| Slot::unassigned()).collect(),
            lru: (0..n_slots).collect(),
            num_ready: n_slots,
            hits: 0,
            accesses: 0,
        }
    }

    fn find(&self, sector: SectorId) -> Option<usize> {
        self.slots.iter().position(|s| s.sector == Some(sector))
    }

    /// Back-most slot in LRU order whose `ready` flag is set, or `None` if
    /// every slot is currently the target of an in-flight I/O.
    fn evict_candidate(&self) -> Option<usize> {
        if self.num_ready == 0 {
            return None;
        }
        self.lru.iter().rev().copied().find(|&idx| self.slots[idx].ready)
    }

    fn touch_lru(&mut self, idx: usize) {
        if let Some(pos) = self.lru.iter().position(|&i| i == idx) {
            self.lru.remove(pos);
        }
        self.lru.push_front(idx);
    }
}

/// The buffer cache. Generic over the block device so tests can plug in
/// `MemBlockDevice` while a real mount plugs in the platform driver.
pub struct Cache<D: BlockDevice> {
    device: Arc<D>,
    state: Mutex<CacheState>,
    /// One condition per slot: "this slot's `ready` flag just changed".
    slot_ready: Vec<Condvar>,
    /// "Some slot just became evictable" — broadcast on every I/O
    /// completion so a thread stuck with no evictable victim can retry.
    some_slot_ready: Condvar,
}

impl<D: BlockDevice> Cache<D> {
    /// Configures `n_slots` slots, all ready and clean, linked into an
    /// arbitrary initial LRU order, with counters at zero.
    pub fn init(device: Arc<D>, n_slots: usize) -> Self {
        assert!(n_slots > 0, "a cache needs at least one slot");
        debug!("bio: init with {n_slots} slots");
        Self {
            device,
            state: Mutex::new(CacheState::fresh(n_slots)),
            slot_ready: array_init_condvars(n_slots),
            some_slot_ready: Condvar::new(),
        }
    }

    /// Copies `[offset, offset+length)` bytes of `sector` into `dst`.
    ///
    /// # Panics
    ///
    /// Panics if `offset + length > SECTOR_BYTES` (a programming error,
    /// per §7 error kind 4).
    pub fn read(&self, sector: SectorId, dst: &mut [u8], offset: usize, length: usize) {
        assert!(
            offset + length <= SECTOR_BYTES,
            "cache read [{offset}, {}) exceeds sector size",
            offset + length
        );
        let guard = self.state.lock().unwrap();
        let (guard, idx) = self.access(guard, sector, false);
        dst[..length].copy_from_slice(&guard.slots[idx].data[offset..offset + length]);
    }

    /// Copies `length` bytes from `src` into `sector` at `offset` and marks
    /// the slot dirty. When `length == SECTOR_BYTES` the write is "blind":
    /// on a miss, an evicted clean victim is rebound to the new sector
    /// without a disk read, since the copy below overwrites it completely.
    ///
    /// # Panics
    ///
    /// Same precondition as `read`.
    pub fn write(&self, sector: SectorId, src: &[u8], offset: usize, length: usize) {
        assert!(
            offset + length <= SECTOR_BYTES,
            "cache write [{offset}, {}) exceeds sector size",
            offset + length
        );
        let blind = length == SECTOR_BYTES;
        let guard = self.state.lock().unwrap();
        let (mut guard, idx) = self.access(guard, sector, blind);
        guard.slots[idx].data[offset..offset + length].copy_from_slice(&src[..length]);
        guard.slots[idx].dirty = true;
    }

    /// Writes back every sector dirty at the moment the scan began.
    pub fn flush(&self) {
        debug!("bio: flush");
        let mut guard = self.state.lock().unwrap();
        let n = guard.slots.len();
        for idx in 0..n {
            if guard.slots[idx].dirty {
                guard = self.writeback(guard, idx);
            }
        }
    }

    pub fn hit_count(&self) -> u64 {
        self.state.lock().unwrap().hits
    }

    pub fn access_count(&self) -> u64 {
        self.state.lock().unwrap().accesses
    }

    /// Clears the counters and logically invalidates every slot. Intended
    /// for use between test phases; the implementation takes the cache
    /// lock for its duration, but a caller that races this against live
    /// I/O will simply see every subsequent access fault cold (see §4.5).
    pub fn reset(&self) {
        debug!("bio: reset");
        let mut guard = self.state.lock().unwrap();
        let n = guard.slots.len();
        *guard = CacheState::fresh(n);
    }

    /// The access algorithm (§4.2): find-or-evict, looping until a ready
    /// slot bound to `sector` is held. Returns with the cache lock still
    /// held, at the position the hit path leaves it (front of LRU).
    fn access<'s>(
        &'s self,
        mut guard: MutexGuard<'s, CacheState>,
        sector: SectorId,
        blind: bool,
    ) -> (MutexGuard<'s, CacheState>, usize) {
        guard.accesses += 1;
        let mut first_attempt = true;
        loop {
            if let Some(idx) = guard.find(sector) {
                if !guard.slots[idx].ready {
                    guard = self.slot_ready[idx].wait(guard).unwrap();
                    continue;
                }
                if first_attempt {
                    guard.hits += 1;
                }
                guard.touch_lru(idx);
                return (guard, idx);
            }
            first_attempt = false;
            match guard.evict_candidate() {
                None => {
                    guard = self.some_slot_ready.wait(guard).unwrap();
                }
                Some(idx) => {
                    if guard.slots[idx].dirty {
                        guard = self.writeback(guard, idx);
                    } else if blind {
                        trace!("bio: blind rebind slot {idx} to sector {sector}");
                        guard.slots[idx].sector = Some(sector);
                    } else {
                        guard = self.fetch(guard, idx, sector);
                    }
                }
            }
        }
    }

    fn writeback<'s>(
        &'s self,
        mut guard: MutexGuard<'s, CacheState>,
        idx: usize,
    ) -> MutexGuard<'s, CacheState> {
        debug_assert!(guard.slots[idx].dirty);
        let sector = guard.slots[idx]
            .sector
            .expect("writeback of a slot with no sector bound");
        trace!("bio: writeback slot {idx} sector {sector}");
        guard.slots[idx].ready = false;
        guard.num_ready -= 1;
        let data = guard.slots[idx].data;
        drop(guard);

        self.device.write(sector, &data);

        let mut guard = self.state.lock().unwrap();
        guard.slots[idx].dirty = false;
        guard.slots[idx].ready = true;
        guard.num_ready += 1;
        self.slot_ready[idx].notify_all();
        self.some_slot_ready.notify_all();
        guard
    }

    fn fetch<'s>(
        &'s self,
        mut guard: MutexGuard<'s, CacheState>,
        idx: usize,
        sector: SectorId,
    ) -> MutexGuard<'s, CacheState> {
        debug_assert!(!guard.slots[idx].dirty, "fetch must only target a clean victim");
        trace!("bio: fetch slot {idx} sector {sector}");
        guard.slots[idx].sector = Some(sector);
        guard.slots[idx].ready = false;
        guard.num_ready -= 1;
        drop(guard);

        let mut data = [0u8; SECTOR_BYTES];
        self.device.read(sector, &mut data);

        let mut guard = self.state.lock().unwrap();
        guard.slots[idx].data = data;
        guard.slots[idx].ready = true;
        guard.num_ready += 1;
        self.slot_ready[idx].notify_all();
        self.some_slot_ready.notify_all();
        guard
    }
}

fn array_init_condvars(n: usize) -> Vec<Condvar> {
    // `array-macro`'s `array!` builds a fixed-size array of a non-`Copy`,
    // non-`Default` type by calling the initializer once per slot; since
    // `n` is a runtime parameter here we size a `Vec` the same way instead
    // of picking a single compile-time `N_SLOTS`, reserving `array!` for
    // the default-capacity production path below.
    (0..n).map(|_| Condvar::new()).collect()
}

/// Builds the production-shaped default-capacity slot condvar array,
/// matching `param::N_SLOTS`, using `array-macro` the way a fixed-size
/// in-kernel cache would.
#[allow(dead_code)]
fn default_condvars() -> [Condvar; crate::param::N_SLOTS] {
    array![_ => Condvar::new(); crate::param::N_SLOTS]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;
    use std::sync::Arc;
    use std::thread;

    fn cache(n_slots: usize, n_sectors: usize) -> Cache<MemBlockDevice> {
        Cache::init(Arc::new(MemBlockDevice::new(n_sectors)), n_slots)
    }

    #[test]
    fn blind_write_then_read_hits() {
        let c = cache(64, 64);
        let buf = [0xABu8; SECTOR_BYTES];
        c.write(42, &buf, 0, SECTOR_BYTES);
        let mut out = [0u8; SECTOR_BYTES];
        c.read(42, &mut out, 0, SECTOR_BYTES);
        assert_eq!(out, buf);
        assert_eq!(c.access_count(), 2);
        assert_eq!(c.hit_count(), 1);
    }

    #[test]
    fn round_trip_i4() {
        let c = cache(8, 8);
        let buf = [0x5Au8; SECTOR_BYTES];
        c.write(3, &buf, 0, SECTOR_BYTES);
        let mut out = [0u8; SECTOR_BYTES];
        c.read(3, &mut out, 0, SECTOR_BYTES);
        assert_eq!(out, buf);
    }

    #[test]
    fn eviction_writes_back_dirty_victim() {
        // Two slots, three sectors: the third access must evict one of the
        // first two, and if that victim is dirty its data must reach the
        // device before being discarded from the cache.
        let device = Arc::new(MemBlockDevice::new(4));
        let c = Cache::init(Arc::clone(&device), 2);
        c.write(0, &[1u8; SECTOR_BYTES], 0, SECTOR_BYTES);
        c.write(1, &[2u8; SECTOR_BYTES], 0, SECTOR_BYTES);
        c.write(2, &[3u8; SECTOR_BYTES], 0, SECTOR_BYTES);

        let mut raw = [0u8; SECTOR_BYTES];
        // One of sector 0 or 1 was evicted (dirty) and must be durable now.
        device.read(0, &mut raw);
        let sector0_durable = raw == [1u8; SECTOR_BYTES];
        device.read(1, &mut raw);
        let sector1_durable = raw == [2u8; SECTOR_BYTES];
        assert!(sector0_durable || sector1_durable);
    }

    #[test]
    fn flush_makes_all_dirty_slots_durable_i5() {
        let device = Arc::new(MemBlockDevice::new(8));
        let c = Cache::init(Arc::clone(&device), 8);
        for s in 0..8u32 {
            c.write(s, &[s as u8; SECTOR_BYTES], 0, SECTOR_BYTES);
        }
        c.flush();
        for s in 0..8u32 {
            let mut raw = [0u8; SECTOR_BYTES];
            device.read(s, &mut raw);
            assert_eq!(raw, [s as u8; SECTOR_BYTES]);
        }
    }

    #[test]
    fn counters_monotonic_under_concurrency_i3() {
        let c = Arc::new(cache(16, 16));
        let mut handles = Vec::new();
        for t in 0..8u32 {
            let c = Arc::clone(&c);
            handles.push(thread::spawn(move || {
                for i in 0..50u32 {
                    let sector = (t * 50 + i) % 16;
                    let mut out = [0u8; SECTOR_BYTES];
                    c.read(sector, &mut out, 0, 4);
                }
            }));
        }
        let mut last = (0u64, 0u64);
        for h in handles {
            h.join().unwrap();
            let (h1, a1) = (c.hit_count(), c.access_count());
            assert!(h1 >= last.0);
            assert!(a1 >= last.1);
            assert!(h1 <= a1);
            last = (h1, a1);
        }
    }

    #[test]
    fn reset_clears_counters_and_slot_bindings() {
        let c = cache(4, 4);
        c.write(0, &[7u8; SECTOR_BYTES], 0, SECTOR_BYTES);
        c.read(0, &mut [0u8; SECTOR_BYTES], 0, SECTOR_BYTES);
        assert!(c.access_count() > 0);
        c.reset();
        assert_eq!(c.access_count(), 0);
        assert_eq!(c.hit_count(), 0);
        // Slot bindings were invalidated: reading sector 0 again is a
        // fresh fetch from the device, not a leftover hit.
        let mut out = [0u8; SECTOR_BYTES];
        c.read(0, &mut out, 0, SECTOR_BYTES);
        assert_eq!(c.hit_count(), 0);
        assert_eq!(out, [7u8; SECTOR_BYTES]);
    }

    #[test]
    fn cold_then_warm_sequential_read_scenario_2() {
        let c = cache(64, 64);
        // Fake "file" laid across 4 sectors; write 10-byte chunks across
        // them the way the file-extension write loop would.
        for s in 0..4u32 {
            c.write(s, &[s as u8; SECTOR_BYTES], 0, SECTOR_BYTES);
        }
        c.reset();

        let mut out = [0u8; 10];
        for i in 0..10u32 {
            c.read(i % 4, &mut out, 0, 10);
        }
        let (h1, a1) = (c.hit_count(), c.access_count());

        for i in 0..10u32 {
            c.read(i % 4, &mut out, 0, 10);
        }
        let h2 = c.hit_count() - h1;
        let a2 = c.access_count() - a1;

        assert!(h2 > h1);
        assert_eq!(a1, a2);
    }
}
