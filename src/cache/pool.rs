//! Entry pool bookkeeping
//!
//! Entries live in an arena indexed by stable position. At any moment
//! an idle entry sits on exactly one of the free, free-dirty or handle
//! lists; a referenced entry is on none. Hash membership is orthogonal:
//! an entry stays findable by its stripe-base sector until it is
//! recycled for a new one.

use bitflags::bitflags;
use log::debug;
use parking_lot::MutexGuard;

use crate::region::BlockState;

use super::entry::EntryFlags;
use super::request::chain_covers;
use super::{CacheCore, CacheState, Shared};

bitflags! {
    /// Acquisition behavior for [`CacheCore::get_active_entry`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct GetFlags: u32 {
        /// A free entry may be recycled on a miss
        const RECYCLE_OK = 1 << 0;
        /// The caller may block waiting for a free entry
        const BLOCK_OK = 1 << 1;
    }
}

impl CacheCore {
    /// Entry currently hashed at `sector`, if any
    pub(crate) fn find_entry(&self, shared: &Shared, sector: u64) -> Option<usize> {
        shared.hash[self.hash_bucket(sector)]
            .iter()
            .copied()
            .find(|&idx| self.entries[idx].sector() == sector)
    }

    pub(crate) fn insert_hash(&self, shared: &mut Shared, idx: usize, sector: u64) {
        let bucket = self.hash_bucket(sector);
        shared.hash[bucket].push(idx);
    }

    fn remove_hash(&self, shared: &mut Shared, idx: usize) {
        let bucket = self.hash_bucket(self.entries[idx].sector());
        shared.hash[bucket].retain(|&i| i != idx);
    }

    fn remove_from_lists(&self, shared: &mut Shared, idx: usize) {
        shared.free.retain(|&i| i != idx);
        shared.free_dirty.retain(|&i| i != idx);
        shared.handle.retain(|&i| i != idx);
    }

    /// Pop a clean free entry; the caller becomes its reference holder
    fn get_free_entry(&self, shared: &mut Shared) -> Option<usize> {
        let idx = shared.free.pop_front()?;
        shared.active += 1;
        Some(idx)
    }

    /// Whether a blocked requester may be admitted
    pub(crate) fn inactive_ok(&self, shared: &Shared) -> bool {
        if shared.state == CacheState::Failed {
            return true;
        }
        !shared.free.is_empty()
            && (!shared.inactive_blocked
                || shared.active + shared.dirty < self.unblock_mark())
    }

    /// Retarget an idle entry at `sector`: unhash, reset every block to
    /// unassociated (descriptors included), rehash, publish.
    pub(crate) fn init_entry(&self, shared: &mut Shared, idx: usize, sector: u64) {
        let ent = &self.entries[idx];
        debug_assert_eq!(ent.refs(), 0);
        debug_assert!(!ent.test_flag(EntryFlags::DIRTY));

        debug!("{}: init entry {:#x}", self.name, sector);

        self.remove_hash(shared, idx);
        ent.set_sector(sector);

        // the entry is idle and the cache-wide lock keeps it that way,
        // so its lock cannot be held by anyone
        let mut blocks = ent.lock_blocks();
        for blk in blocks.iter_mut() {
            debug_assert!(blk.is_idle());
            blk.state = BlockState::Unassociated;
            blk.flags = super::BlockFlags::empty();
            if let Some(slot) = blk.slot {
                self.desc.write(slot as usize, BlockState::Unassociated, 0);
            }
        }
        drop(blocks);

        self.insert_hash(shared, idx, sector);
        // make the descriptor resets globally visible
        self.desc.fence();
    }

    /// Block until `inactive_ok`, running laundry on every pass.
    ///
    /// Once one requester waits here, admission stays gated on the
    /// stricter unblock mark until the pool drains.
    fn wait_for_entry(&self, shared: &mut MutexGuard<'_, Shared>) {
        shared.inactive_blocked = true;
        loop {
            if self.inactive_ok(shared) {
                break;
            }
            self.laundry_locked(shared);
            if self.inactive_ok(shared) {
                break;
            }
            self.entry_cond.wait(shared);
        }
        shared.inactive_blocked = false;
    }

    /// Acquire the entry for `sector`, per `flags`: reuse a hash hit,
    /// recycle a free entry, block for one, or return `None`.
    pub(crate) fn get_active_entry(&self, sector: u64, flags: GetFlags) -> Option<usize> {
        let mut shared = self.shared.lock();
        loop {
            if let Some(idx) = self.find_entry(&shared, sector) {
                let ent = &self.entries[idx];
                if ent.refs() == 0 {
                    // leaving a free list makes it active; the handle
                    // list already counts
                    if !ent.test_flag(EntryFlags::HANDLE) {
                        shared.active += 1;
                    }
                    self.remove_from_lists(&mut shared, idx);
                }
                ent.get();
                return Some(idx);
            }

            if !flags.contains(GetFlags::RECYCLE_OK) || shared.state == CacheState::Failed {
                return None;
            }

            if !shared.inactive_blocked {
                if let Some(idx) = self.get_free_entry(&mut shared) {
                    self.init_entry(&mut shared, idx, sector);
                    self.entries[idx].get();
                    return Some(idx);
                }
            }

            if !flags.contains(GetFlags::BLOCK_OK) {
                return None;
            }

            self.wait_for_entry(&mut shared);
        }
    }

    /// Drop a reference with the cache-wide lock held.
    pub(crate) fn release_entry_locked(&self, shared: &mut Shared, idx: usize) {
        let ent = &self.entries[idx];
        if ent.put() {
            if ent.test_flag(EntryFlags::HANDLE) {
                shared.handle.push_back(idx);
                self.wake_worker(shared);
            } else {
                shared.active -= 1;
                if ent.test_flag(EntryFlags::DIRTY) {
                    shared.free_dirty.push_back(idx);
                } else {
                    shared.free.push_back(idx);
                }
                self.entry_cond.notify_all();
            }
        }
    }

    /// Drop a reference
    pub(crate) fn release_entry(&self, idx: usize) {
        let mut shared = self.shared.lock();
        self.release_entry_locked(&mut shared, idx);
    }

    /// Bump the overlap generation and wake overlap waiters; called
    /// after an `OVERLAP` flag is cleared.
    pub(crate) fn wake_overlap(&self) {
        let mut shared = self.shared.lock();
        shared.overlap_gen += 1;
        self.overlap_cond.notify_all();
    }

    /// Check the pool's structural invariants.
    ///
    /// Meaningful only while the cache is quiescent (no in-flight
    /// requests, worker idle); a debugging and test aid.
    pub fn debug_check(&self) -> Result<(), String> {
        {
            let shared = self.shared.lock();
            let mut dirty = 0;
            let mut writeback = 0;
            for ent in &self.entries {
                let on_lists = [&shared.free, &shared.free_dirty, &shared.handle]
                    .iter()
                    .filter(|list| list.contains(&ent.index))
                    .count();
                if ent.refs() > 0 && on_lists != 0 {
                    return Err(format!("entry {} referenced but listed", ent.index));
                }
                if ent.refs() == 0 && on_lists != 1 {
                    return Err(format!(
                        "entry {} on {} lists, expected 1",
                        ent.index, on_lists
                    ));
                }
                if ent.test_flag(EntryFlags::DIRTY) {
                    dirty += 1;
                }
                if ent.test_flag(EntryFlags::WRITEBACK) {
                    writeback += 1;
                }
            }
            if shared.dirty != dirty {
                return Err(format!(
                    "dirty counter {} != {} flagged entries",
                    shared.dirty, dirty
                ));
            }
            if shared.writeback_active != writeback {
                return Err(format!(
                    "writeback counter {} != {} flagged entries",
                    shared.writeback_active, writeback
                ));
            }
            let expected_active =
                self.total_entries - shared.free.len() - shared.free_dirty.len();
            if shared.active != expected_active {
                return Err(format!(
                    "active counter {} != {} entries off the free lists",
                    shared.active, expected_active
                ));
            }

            let mut seen = vec![false; self.total_entries];
            for (bucket, chain) in shared.hash.iter().enumerate() {
                for &idx in chain {
                    if seen[idx] {
                        return Err(format!("entry {} hashed twice", idx));
                    }
                    seen[idx] = true;
                    if self.hash_bucket(self.entries[idx].sector()) != bucket {
                        return Err(format!("entry {} in wrong bucket", idx));
                    }
                }
            }
            for chain in shared.hash.iter() {
                for &idx in chain {
                    let sector = self.entries[idx].sector();
                    let twins = chain
                        .iter()
                        .filter(|&&i| self.entries[i].sector() == sector)
                        .count();
                    if twins != 1 {
                        return Err(format!("sector {:#x} hashed {} times", sector, twins));
                    }
                }
            }
        }

        for ent in &self.entries {
            let blocks = ent.lock_blocks();
            for (i, blk) in blocks.iter().enumerate() {
                if let Some(slot) = blk.slot {
                    let (state, _) = self
                        .desc
                        .read(slot as usize)
                        .map_err(|e| e.to_string())?;
                    if state != blk.state {
                        return Err(format!(
                            "entry {} block {}: memory {} vs descriptor {}",
                            ent.index, i, blk.state, state
                        ));
                    }
                }
                if blk.flags.contains(super::BlockFlags::OVERWRITE) {
                    let base = self.blk_to_sector(ent.sector(), i);
                    if !chain_covers(&blk.towrite, base, self.blk_sectors) {
                        return Err(format!(
                            "entry {} block {}: overwrite without full coverage",
                            ent.index, i
                        ));
                    }
                }
            }
        }

        Ok(())
    }
}
