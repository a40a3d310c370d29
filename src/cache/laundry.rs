//! Watermark writeback and the full-flush barrier
//!
//! Laundry keeps the pool reclaimable: when dirty entries crowd out
//! the watermark it schedules idle dirty entries for writeback, and
//! the full flush drives the cache to quiescence and writes back
//! everything.

use log::debug;

use super::entry::EntryFlags;
use super::{CacheCore, Shared};

impl CacheCore {
    /// Move one idle dirty entry to the worker for writeback
    fn schedule_writeback(&self, shared: &mut Shared) -> bool {
        let Some(idx) = shared.free_dirty.pop_front() else {
            return false;
        };
        let ent = &self.entries[idx];
        ent.get();
        shared.active += 1;

        debug_assert!(!ent.test_flag(EntryFlags::WRITEBACK));
        ent.set_flag(EntryFlags::WRITEBACK);
        shared.writeback_active += 1;

        ent.set_flag(EntryFlags::HANDLE);
        self.release_entry_locked(shared, idx);
        true
    }

    /// Writeback just enough entries to satisfy admission again.
    ///
    /// Runs on every pass of a requester waiting for a free entry; new
    /// requests are allowed while this is happening.
    pub(crate) fn laundry_locked(&self, shared: &mut Shared) {
        let target = if shared.inactive_blocked {
            self.unblock_mark()
        } else {
            self.watermark()
        };
        let goal = (shared.dirty + 1).saturating_sub(shared.writeback_active + target);

        if goal > 0 {
            debug!(
                "{}: laundry cleaning {} of {} dirty",
                self.name, goal, shared.dirty
            );
        }

        for _ in 0..goal {
            if shared.dirty == 0 || !self.schedule_writeback(shared) {
                break;
            }
        }
    }

    /// Impose a barrier and write back every dirty entry.
    ///
    /// Guarantees each dirty entry has had a writeback chance; waits
    /// for writeback to go idle rather than for `dirty == 0`, since
    /// I/O errors may preclude the dirty data being drained.
    pub fn flush(&self) {
        let mut shared = self.shared.lock();

        // wait out any pending barrier, then impose ours
        while shared.barrier_active {
            self.entry_cond.wait(&mut shared);
        }
        shared.barrier_active = true;
        while !(shared.requesters == 0 && shared.active == 0 && shared.active_bypass == 0) {
            self.entry_cond.wait(&mut shared);
        }

        let goal = shared.dirty;
        debug!("{}: flush cleaning {} entries", self.name, goal);
        for _ in 0..goal {
            if shared.dirty == 0 || !self.schedule_writeback(&mut shared) {
                break;
            }
        }

        while shared.writeback_active != 0 {
            self.writeback_cond.wait(&mut shared);
        }

        shared.barrier_active = false;
        self.entry_cond.notify_all();
    }
}
