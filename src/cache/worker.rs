//! The per-cache worker
//!
//! One thread per active cache owns entry-state sequencing. Each pass
//! over an entry derives a live snapshot of its blocks, applies the
//! handling rules in order (fill queues, failure handling, read fill,
//! writeback completion, writeback issue, write admission), persists
//! the descriptor transitions, fences, and only then dispatches the
//! dependent transfers. Completions re-mark the entry for handling, so
//! it keeps cycling through the worker until nothing is pending.

use std::sync::Arc;

use log::{debug, error, warn};

use crate::backing::{BackingOp, BackingRequest, BackingResult};
use crate::copy::{CopyDir, CopyOp};
use crate::region::BlockState;

use super::entry::{BlockFlags, CacheBlock, CacheEntry, EntryFlags, LiveState};
use super::request::{Direction, Request};
use super::{CacheCore, CacheState};

/// Worker main loop: drain dirty merges, then handle entries, until
/// stopped. The handle list is drained once more after the stop flag.
pub(crate) fn worker_loop(core: Arc<CacheCore>) {
    debug!("{}: worker started", core.name);
    let mut shared = core.shared.lock();
    loop {
        while !shared.wake && !shared.stop {
            core.work_cond.wait(&mut shared);
        }
        shared.wake = false;
        let stopping = shared.stop;

        loop {
            // bypass completions park their requests here; they must
            // merge before any entry work touches the same blocks
            if !shared.dirty_merge.is_empty() {
                let merges: Vec<Arc<Request>> = shared.dirty_merge.drain(..).collect();
                drop(shared);
                for req in merges {
                    core.merge_dirty(&req);
                }
                shared = core.shared.lock();
                continue;
            }

            let Some(idx) = shared.handle.pop_front() else {
                break;
            };
            core.entries[idx].get();
            drop(shared);
            core.handle_entry(idx);
            core.release_entry(idx);
            shared = core.shared.lock();
        }

        if stopping && shared.handle.is_empty() && shared.dirty_merge.is_empty() {
            break;
        }
    }
    drop(shared);
    debug!("{}: worker stopped", core.name);
}

impl CacheCore {
    /// One handling pass over an entry.
    pub(crate) fn handle_entry(self: &Arc<Self>, idx: usize) {
        let ent = &self.entries[idx];
        let ent_sector = ent.sector();
        let mut done_reqs: Vec<Arc<Request>> = Vec::new();
        let mut overlap_wake = false;
        let mut s = LiveState::default();

        {
            let mut blocks = ent.lock_blocks();
            ent.clear_flag(EntryFlags::HANDLE);
            s.writeback = ent.test_flag(EntryFlags::WRITEBACK);

            for blk in blocks.iter_mut() {
                // new fill requests are only permitted while the
                // biofill completion is guaranteed inactive, and never
                // while a bypass holds the block
                if blk.flags.contains(BlockFlags::UPTODATE)
                    && !blk.toread.is_empty()
                    && !ent.test_flag(EntryFlags::BIOFILL_RUN)
                    && !blk.flags.contains(BlockFlags::BYPASS)
                {
                    blk.flags |= BlockFlags::WANTFILL;
                }

                if blk.flags.contains(BlockFlags::LOCKED) {
                    s.locked += 1;
                }
                if blk.flags.contains(BlockFlags::UPTODATE) {
                    s.uptodate += 1;
                }
                if blk.flags.contains(BlockFlags::DIRTY) {
                    s.dirty += 1;
                }
                if blk.flags.contains(BlockFlags::WANTFILL) {
                    s.to_fill += 1;
                } else if !blk.toread.is_empty() {
                    s.to_read += 1;
                }
                if !blk.towrite.is_empty() {
                    s.to_write += 1;
                    if !blk.flags.contains(BlockFlags::OVERWRITE) {
                        s.non_overwrite += 1;
                    }
                    if !blk.flags.contains(BlockFlags::BYPASS) {
                        s.to_drain += 1;
                    }
                }
                if blk.flags.contains(BlockFlags::READ_ERROR) {
                    s.failed += 1;
                }
            }

            debug!(
                "{}: handle {:#x} locked={} uptodate={} dirty={} to_read={} to_write={} failed={}",
                self.name, ent_sector, s.locked, s.uptodate, s.dirty, s.to_read, s.to_write,
                s.failed
            );

            if s.to_fill > 0 && !ent.set_flag(EntryFlags::BIOFILL_RUN) {
                s.run_biofill = true;
            }

            if s.failed > 0 && s.to_read + s.to_write > 0 {
                self.handle_failure(ent, &mut blocks, &mut s, &mut done_reqs, &mut overlap_wake);
            }

            // read blocks needed by reads, sub-block writes, or a
            // writeback (which always rewrites the whole stripe set)
            if s.to_read > 0 || s.non_overwrite > 0 || (s.writeback && s.uptodate < self.members)
            {
                ent.set_flag(EntryFlags::HANDLE);
                for (i, blk) in blocks.iter_mut().enumerate() {
                    let needed = !blk.toread.is_empty()
                        || s.writeback
                        || (!blk.towrite.is_empty()
                            && !blk.flags.contains(BlockFlags::OVERWRITE));
                    if needed
                        && !blk.flags.contains(BlockFlags::LOCKED)
                        && !blk.flags.contains(BlockFlags::UPTODATE)
                    {
                        blk.flags |= BlockFlags::LOCKED | BlockFlags::WANTREAD;
                        blk.state = BlockState::ReadLock;
                        if let Some(slot) = blk.slot {
                            self.desc.write(
                                slot as usize,
                                BlockState::ReadLock,
                                self.blk_to_sector(ent_sector, i),
                            );
                        }
                        s.locked += 1;
                        debug!("{}: reading {:#x}/{}", self.name, ent_sector, i);
                    }
                }
            }

            // complete a writeback and let new writes at the entry
            if s.writeback && s.dirty == 0 && s.locked == 0 {
                ent.clear_flag(EntryFlags::WRITEBACK);
                let mut shared = self.shared.lock();
                shared.writeback_active -= 1;
                if shared.writeback_active == 0 {
                    self.writeback_cond.notify_all();
                }
                if ent.clear_flag(EntryFlags::DIRTY) {
                    shared.dirty -= 1;
                }
                shared.overlap_gen += 1;
                self.overlap_cond.notify_all();
                drop(shared);
                s.writeback = false;
            }

            // issue the writeback once every block is valid and idle
            if s.writeback
                && s.locked == 0
                && s.to_write == 0
                && s.uptodate == self.members
                && !ent.test_flag(EntryFlags::BIODRAIN_RUN)
            {
                for (i, blk) in blocks.iter_mut().enumerate() {
                    blk.flags |= BlockFlags::LOCKED | BlockFlags::WANTWRITE;
                    blk.state = BlockState::WritebackLock;
                    if let Some(slot) = blk.slot {
                        self.desc.write(
                            slot as usize,
                            BlockState::WritebackLock,
                            self.blk_to_sector(ent_sector, i),
                        );
                    }
                    s.locked += 1;
                    debug!("{}: writing back {:#x}/{}", self.name, ent_sector, i);
                }
            }

            // admit new writes into the cache
            if s.to_drain > 0
                && s.locked == 0
                && !ent.test_flag(EntryFlags::WRITEBACK)
                && !ent.set_flag(EntryFlags::BIODRAIN_RUN)
            {
                s.run_biodrain = true;
                for (i, blk) in blocks.iter_mut().enumerate() {
                    if blk.towrite.is_empty() || blk.flags.contains(BlockFlags::BYPASS) {
                        continue;
                    }
                    blk.flags |= BlockFlags::WANTDRAIN;
                    blk.state = if blk.flags.contains(BlockFlags::UPTODATE) {
                        BlockState::UpdateLock
                    } else {
                        debug_assert!(blk.flags.contains(BlockFlags::OVERWRITE));
                        BlockState::ReplaceLock
                    };
                    if let Some(slot) = blk.slot {
                        self.desc.write(
                            slot as usize,
                            blk.state,
                            self.blk_to_sector(ent_sector, i),
                        );
                    }
                    debug!("{}: draining {:#x}/{}", self.name, ent_sector, i);
                }
            }

            // make the descriptor updates globally visible before any
            // dependent transfer is issued
            self.desc.fence();
        }

        if overlap_wake {
            self.wake_overlap();
        }

        if s.run_biofill {
            self.run_biofill(idx);
        }
        if s.run_biodrain {
            self.run_biodrain(idx);
        }
        self.run_io(idx);

        for req in done_reqs {
            req.complete();
        }
    }

    /// A block read failed: fail the work that depended on its data.
    fn handle_failure(
        &self,
        ent: &Arc<CacheEntry>,
        blocks: &mut [CacheBlock],
        s: &mut LiveState,
        done_reqs: &mut Vec<Arc<Request>>,
        overlap_wake: &mut bool,
    ) {
        for blk in blocks.iter_mut().rev() {
            if !blk.flags.contains(BlockFlags::READ_ERROR) {
                continue;
            }

            // writes that needed the old data can never drain
            if !blk.flags.contains(BlockFlags::OVERWRITE)
                && !blk.flags.contains(BlockFlags::UPTODATE)
            {
                let failed_writes = std::mem::take(&mut blk.towrite);
                if !failed_writes.is_empty() {
                    s.to_write -= 1;
                    s.non_overwrite -= 1;
                    if !blk.flags.contains(BlockFlags::BYPASS) {
                        s.to_drain -= 1;
                    }
                }
                if blk.flags.contains(BlockFlags::OVERLAP) {
                    blk.flags.remove(BlockFlags::OVERLAP);
                    *overlap_wake = true;
                }
                for req in failed_writes {
                    req.fail();
                    if req.end_segment() {
                        done_reqs.push(req);
                    }
                }
            }

            // a writeback cannot proceed without every block
            if ent.test_flag(EntryFlags::WRITEBACK) && !blk.flags.contains(BlockFlags::UPTODATE)
            {
                ent.clear_flag(EntryFlags::WRITEBACK);
                *overlap_wake = true;
                let mut shared = self.shared.lock();
                shared.writeback_active -= 1;
                if shared.writeback_active == 0 {
                    self.writeback_cond.notify_all();
                }
                if ent.clear_flag(EntryFlags::DIRTY) {
                    shared.dirty -= 1;
                }
                drop(shared);
                s.writeback = false;
            }

            // fail pending reads unless a fill already has the data
            if !blk.flags.contains(BlockFlags::WANTFILL) {
                let failed_reads = std::mem::take(&mut blk.toread);
                if !failed_reads.is_empty() {
                    s.to_read -= 1;
                }
                if blk.flags.contains(BlockFlags::OVERLAP) {
                    blk.flags.remove(BlockFlags::OVERLAP);
                    *overlap_wake = true;
                }
                for req in failed_reads {
                    req.fail();
                    if req.end_segment() {
                        done_reqs.push(req);
                    }
                }
            }
        }
    }

    /// Launch the cache→client copies for every block wanting a fill
    fn run_biofill(self: &Arc<Self>, idx: usize) {
        let ent = &self.entries[idx];
        let ent_sector = ent.sector();
        let mut ops = Vec::new();
        let mut overlap_wake = false;

        {
            let mut blocks = ent.lock_blocks();
            for (i, blk) in blocks.iter_mut().enumerate() {
                if !blk.flags.contains(BlockFlags::WANTFILL) {
                    continue;
                }
                let blk_sector = self.blk_to_sector(ent_sector, i);
                let reads = std::mem::take(&mut blk.toread);
                if blk.flags.contains(BlockFlags::OVERLAP) {
                    blk.flags.remove(BlockFlags::OVERLAP);
                    overlap_wake = true;
                }
                if let Some(slot) = blk.slot {
                    for req in &reads {
                        if let Some((buf_off, blk_off, len)) =
                            req.block_range(blk_sector, self.blk_sectors)
                        {
                            ops.push(CopyOp {
                                dir: CopyDir::FromCache,
                                mem_offset: self.data_offset(slot) + blk_off,
                                buf_offset: buf_off,
                                len,
                                request: req.clone(),
                            });
                        }
                    }
                }
                blk.read = reads;
            }
        }

        if overlap_wake {
            self.wake_overlap();
        }

        debug!("{}: biofill {:#x}, {} ranges", self.name, ent_sector, ops.len());

        ent.get();
        let core = self.clone();
        self.copy
            .copy(&self.mem, ops, Box::new(move || core.complete_biofill(idx)));
    }

    fn complete_biofill(&self, idx: usize) {
        let ent = &self.entries[idx];
        let mut done_reqs = Vec::new();

        {
            let mut blocks = ent.lock_blocks();
            for blk in blocks.iter_mut() {
                if blk.flags.contains(BlockFlags::WANTFILL) {
                    blk.flags.remove(BlockFlags::WANTFILL);
                    for req in std::mem::take(&mut blk.read) {
                        if req.end_segment() {
                            done_reqs.push(req);
                        }
                    }
                }
            }
        }
        ent.clear_flag(EntryFlags::BIOFILL_RUN);

        for req in done_reqs {
            req.complete();
        }

        ent.set_flag(EntryFlags::HANDLE);
        self.release_entry(idx);
    }

    /// Launch the client→cache copies for every block wanting a drain
    fn run_biodrain(self: &Arc<Self>, idx: usize) {
        let ent = &self.entries[idx];
        let ent_sector = ent.sector();
        let mut ops = Vec::new();
        let mut overlap_wake = false;

        {
            let mut blocks = ent.lock_blocks();
            for (i, blk) in blocks.iter_mut().enumerate() {
                if !blk.flags.contains(BlockFlags::WANTDRAIN) {
                    continue;
                }
                let blk_sector = self.blk_to_sector(ent_sector, i);
                debug_assert!(blk.written.is_empty());
                let writes = std::mem::take(&mut blk.towrite);
                // the covering writes are being consumed
                blk.flags.remove(BlockFlags::OVERWRITE);
                if blk.flags.contains(BlockFlags::OVERLAP) {
                    blk.flags.remove(BlockFlags::OVERLAP);
                    overlap_wake = true;
                }
                if let Some(slot) = blk.slot {
                    for req in &writes {
                        if let Some((buf_off, blk_off, len)) =
                            req.block_range(blk_sector, self.blk_sectors)
                        {
                            ops.push(CopyOp {
                                dir: CopyDir::ToCache,
                                mem_offset: self.data_offset(slot) + blk_off,
                                buf_offset: buf_off,
                                len,
                                request: req.clone(),
                            });
                        }
                    }
                }
                blk.written = writes;
            }
        }

        if overlap_wake {
            self.wake_overlap();
        }

        debug!("{}: biodrain {:#x}, {} ranges", self.name, ent_sector, ops.len());

        ent.get();
        let core = self.clone();
        self.copy
            .copy(&self.mem, ops, Box::new(move || core.complete_biodrain(idx)));
    }

    fn complete_biodrain(&self, idx: usize) {
        let ent = &self.entries[idx];
        let ent_sector = ent.sector();
        let mut done_reqs = Vec::new();

        {
            let mut blocks = ent.lock_blocks();
            for (i, blk) in blocks.iter_mut().enumerate() {
                if blk.flags.contains(BlockFlags::WANTDRAIN) {
                    blk.flags.remove(BlockFlags::WANTDRAIN);
                    blk.flags |= BlockFlags::UPTODATE;
                    blk.state = BlockState::Dirty;
                    if let Some(slot) = blk.slot {
                        self.desc.write(
                            slot as usize,
                            BlockState::Dirty,
                            self.blk_to_sector(ent_sector, i),
                        );
                    }
                    for req in std::mem::take(&mut blk.written) {
                        if req.end_segment() {
                            done_reqs.push(req);
                        }
                    }
                }
            }
            // the dirty descriptors must be durable before the writes
            // are acknowledged
            self.desc.fence();
        }
        ent.clear_flag(EntryFlags::BIODRAIN_RUN);

        for req in done_reqs {
            req.complete();
        }

        ent.set_flag(EntryFlags::HANDLE);
        self.release_entry(idx);
    }

    /// Issue the scheduled block transfers to the backing device
    fn run_io(self: &Arc<Self>, idx: usize) {
        let ent = &self.entries[idx];
        let ent_sector = ent.sector();

        for i in 0..self.members {
            let io = {
                let mut blocks = ent.lock_blocks();
                let blk = &mut blocks[i];
                let dir = if blk.flags.contains(BlockFlags::WANTWRITE) {
                    blk.flags.remove(BlockFlags::WANTWRITE);
                    Some(Direction::Write)
                } else if blk.flags.contains(BlockFlags::WANTREAD) {
                    blk.flags.remove(BlockFlags::WANTREAD);
                    Some(Direction::Read)
                } else {
                    None
                };
                match (dir, blk.slot) {
                    (Some(dir), Some(slot)) => Some((dir, slot)),
                    _ => None,
                }
            };
            let Some((dir, slot)) = io else { continue };

            let blk_sector = self.blk_to_sector(ent_sector, i);
            ent.get();
            let core = self.clone();

            debug!(
                "{}: {} block {:#x}",
                self.name,
                if dir == Direction::Write { "write" } else { "read" },
                blk_sector
            );

            match dir {
                Direction::Write => {
                    let mut data = vec![0u8; self.blk_bytes()];
                    self.mem.read(self.data_offset(slot), &mut data);
                    self.submit_backing(BackingRequest {
                        sector: blk_sector,
                        op: BackingOp::Write { data },
                        done: Box::new(move |result| core.end_write_request(idx, i, result)),
                    });
                }
                Direction::Read => {
                    self.submit_backing(BackingRequest {
                        sector: blk_sector,
                        op: BackingOp::Read {
                            len: self.blk_bytes(),
                        },
                        done: Box::new(move |result| core.end_read_request(idx, i, result)),
                    });
                }
            }
        }
    }

    fn end_read_request(&self, idx: usize, blk_idx: usize, result: BackingResult) {
        let ent = &self.entries[idx];
        let ent_sector = ent.sector();
        let blk_sector = self.blk_to_sector(ent_sector, blk_idx);

        {
            let mut blocks = ent.lock_blocks();
            let blk = &mut blocks[blk_idx];
            blk.flags.remove(BlockFlags::LOCKED);
            match result {
                Ok(data) => {
                    if let Some(slot) = blk.slot {
                        self.mem.write(self.data_offset(slot), &data);
                        blk.state = BlockState::Sync;
                        self.desc.write(slot as usize, BlockState::Sync, blk_sector);
                    }
                    blk.flags |= BlockFlags::UPTODATE;
                }
                Err(err) => {
                    warn!(
                        "{}: read error at sector {:#x}: {}",
                        self.name, blk_sector, err
                    );
                    blk.flags.remove(BlockFlags::UPTODATE);
                    blk.flags |= BlockFlags::READ_ERROR;
                }
            }
        }

        ent.set_flag(EntryFlags::HANDLE);
        self.release_entry(idx);
    }

    fn end_write_request(&self, idx: usize, blk_idx: usize, result: BackingResult) {
        let ent = &self.entries[idx];
        let ent_sector = ent.sector();
        let blk_sector = self.blk_to_sector(ent_sector, blk_idx);

        {
            let mut blocks = ent.lock_blocks();
            let blk = &mut blocks[blk_idx];
            blk.flags.remove(BlockFlags::LOCKED);
            match result {
                Ok(_) => {
                    blk.flags.remove(BlockFlags::DIRTY);
                    if let Some(slot) = blk.slot {
                        blk.state = BlockState::Sync;
                        self.desc.write(slot as usize, BlockState::Sync, blk_sector);
                    }
                }
                Err(err) => {
                    error!(
                        "{}: write error at sector {:#x}, failing cache: {}",
                        self.name, blk_sector, err
                    );
                    // the data stays dirty, on media too, for a retry
                    // by a later flush; this writeback pass is over
                    if let Some(slot) = blk.slot {
                        blk.state = BlockState::Dirty;
                        self.desc.write(slot as usize, BlockState::Dirty, blk_sector);
                        self.desc.fence();
                    }
                    let mut shared = self.shared.lock();
                    if shared.state != CacheState::Failed {
                        shared.state = CacheState::Failed;
                    }
                    if ent.clear_flag(EntryFlags::WRITEBACK) {
                        shared.writeback_active -= 1;
                        if shared.writeback_active == 0 {
                            self.writeback_cond.notify_all();
                        }
                        shared.overlap_gen += 1;
                        self.overlap_cond.notify_all();
                    }
                    self.entry_cond.notify_all();
                }
            }
        }

        ent.set_flag(EntryFlags::HANDLE);
        self.release_entry(idx);
    }
}
