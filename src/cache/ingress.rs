//! Request admission
//!
//! Incoming requests are split by block boundary and attached to
//! entries. Reads additionally open a bypass transfer straight to the
//! backing device; any block holding dirty or valid cached data is
//! pinned at admission so the cached bytes can be merged over the
//! bypass result before the client sees it. Writes never bypass.
//!
//! There are four outcomes for a read:
//! 1. no cached data hit: the bypass alone satisfies it
//! 2. some cached data hit: bypass, then merge the cached blocks
//! 3. every block hit (or the cache is failed): serve from cache and
//!    drop the bypass
//! 4. writes: attach to the cache only

use std::sync::Arc;

use log::debug;

use crate::backing::{BackingError, BackingOp, BackingRequest, BackingResult};

use super::entry::{BlockFlags, EntryFlags};
use super::pool::GetFlags;
use super::request::{chain_contains, chain_covers, chain_insert, Direction, IoRequest, Request, RequestCompletion};
use super::{CacheCore, CacheError, CacheResult, CacheState};

impl CacheCore {
    /// Admit one client request; the returned completion fires once
    /// every attached segment and any bypass transfer has finished.
    pub fn submit(self: &Arc<Self>, io: IoRequest) -> CacheResult<RequestCompletion> {
        if io.sectors == 0 {
            return Err(CacheError::InvalidInput("empty request".into()));
        }
        if io.direction == Direction::Write && io.data.len() != io.sectors as usize * 512 {
            return Err(CacheError::InvalidInput(
                "write data must be a whole number of sectors".into(),
            ));
        }

        // barrier admission
        let failed = {
            let mut shared = self.shared.lock();
            if shared.state == CacheState::Inactive {
                return Err(CacheError::NotActive);
            }
            while shared.barrier_active {
                self.entry_cond.wait(&mut shared);
            }
            shared.requesters += 1;
            if io.barrier {
                shared.barrier_active = true;
                while !(shared.requesters == 1
                    && shared.active == 0
                    && shared.active_bypass == 0)
                {
                    self.entry_cond.wait(&mut shared);
                }
                shared.barrier_active = false;
                self.entry_cond.notify_all();
            }
            shared.state == CacheState::Failed
        };

        let req = Request::new(io);
        // a failed cache serves hits only, so no bypass is opened
        let bypass = req.direction == Direction::Read && !failed;

        debug!(
            "{}: {} {:#x}+{:#x}{}",
            self.name,
            if req.direction == Direction::Read { "read" } else { "write" },
            req.sector,
            req.sectors,
            if bypass { " (bypass)" } else { "" }
        );

        let mut miss = 0u32;
        let mut logical = req.sector & !(self.blk_sectors - 1);
        'slices: while logical < req.end() {
            let (ent_sector, blk_idx) = self.compute_sector(logical);
            loop {
                let gen = self.shared.lock().overlap_gen;
                let flags = if bypass {
                    GetFlags::empty()
                } else {
                    GetFlags::RECYCLE_OK | GetFlags::BLOCK_OK
                };

                let Some(idx) = self.get_active_entry(ent_sector, flags) else {
                    miss += 1;
                    if bypass {
                        break;
                    }
                    // only a failed cache refuses an acquisition here
                    req.fail();
                    break 'slices;
                };

                if bypass {
                    // pin only blocks that hold recent data; anything
                    // else is the bypass transfer's job
                    let ent = &self.entries[idx];
                    let mut blocks = ent.lock_blocks();
                    let blk = &mut blocks[blk_idx];
                    if !blk
                        .flags
                        .intersects(BlockFlags::DIRTY | BlockFlags::UPTODATE)
                    {
                        drop(blocks);
                        self.release_entry(idx);
                        miss += 1;
                        break;
                    }
                    blk.bypass += 1;
                    blk.flags |= BlockFlags::BYPASS;
                }

                if !self.add_bio(idx, blk_idx, &req) {
                    if bypass {
                        let ent = &self.entries[idx];
                        let mut blocks = ent.lock_blocks();
                        let blk = &mut blocks[blk_idx];
                        blk.bypass -= 1;
                        if blk.bypass == 0 {
                            blk.flags.remove(BlockFlags::BYPASS);
                        }
                    }
                    self.release_entry(idx);

                    // wait for overlap progress, then retry the slice
                    let mut shared = self.shared.lock();
                    if shared.overlap_gen == gen {
                        self.overlap_cond.wait(&mut shared);
                    }
                    continue;
                }

                if bypass {
                    // the acquisition reference becomes the bypass pin,
                    // dropped when the bypass completion is merged
                } else {
                    self.entries[idx].set_flag(EntryFlags::HANDLE);
                    self.release_entry(idx);
                }
                break;
            }
            logical += self.blk_sectors;
        }

        // a read satisfied entirely from cache drops its bypass and
        // merges immediately
        let mut bypass_live = bypass;
        if bypass && miss == 0 {
            debug!("{}: cancel bypass for {:#x}", self.name, req.sector);
            bypass_live = false;
            self.merge_dirty(&req);
        }

        if bypass_live {
            req.add_segment();
            self.shared.lock().active_bypass += 1;
            let core = self.clone();
            let done_req = req.clone();
            self.submit_backing(BackingRequest {
                sector: req.sector,
                op: BackingOp::Read {
                    len: req.sectors as usize * 512,
                },
                done: Box::new(move |result| core.end_bypass(done_req, result)),
            });
        }

        {
            let mut shared = self.shared.lock();
            shared.requesters -= 1;
            // a waiting barrier still counts itself as a requester
            if shared.requesters <= 1 {
                self.entry_cond.notify_all();
            }
        }

        if req.end_segment() {
            req.complete();
        }

        Ok(RequestCompletion { req })
    }

    /// Attach `req` to the ordered chain of one block; false on overlap
    fn add_bio(&self, idx: usize, blk_idx: usize, req: &Arc<Request>) -> bool {
        let ent = &self.entries[idx];
        let write = req.direction == Direction::Write;
        let mut blocks = ent.lock_blocks();
        let mut shared = self.shared.lock();
        let blk = &mut blocks[blk_idx];

        // a writeback pass owns the whole entry; new writes conflict
        if write && ent.test_flag(EntryFlags::WRITEBACK) {
            blk.flags |= BlockFlags::OVERLAP;
            return false;
        }

        let chain = if write { &mut blk.towrite } else { &mut blk.toread };
        if !chain_insert(chain, req) {
            blk.flags |= BlockFlags::OVERLAP;
            return false;
        }

        if write {
            blk.flags |= BlockFlags::DIRTY;
            if !ent.set_flag(EntryFlags::DIRTY) {
                shared.dirty += 1;
            }
        }
        req.add_segment();
        drop(shared);

        if write {
            let base = self.blk_to_sector(ent.sector(), blk_idx);
            if chain_covers(&blk.towrite, base, self.blk_sectors) {
                blk.flags |= BlockFlags::OVERWRITE;
            }
        }
        true
    }

    /// Bypass completion: queue the dirty merge if cached blocks were
    /// pinned, otherwise finish the request.
    fn end_bypass(&self, req: Arc<Request>, result: BackingResult) {
        match result {
            Ok(data) => req.copy_to_buf(0, &data),
            Err(err) => {
                debug!("{}: bypass {:#x} failed: {}", self.name, req.sector, err);
                req.fail();
            }
        }

        let finished = {
            let mut shared = self.shared.lock();
            let finished = req.end_segment();
            if !finished {
                // cached dirty data still has to win over the bypass
                shared.dirty_merge.push_back(req.clone());
                self.wake_worker(&mut shared);
            }
            shared.active_bypass -= 1;
            if shared.active_bypass == 0 {
                self.entry_cond.notify_all();
            }
            finished
        };

        if finished {
            req.complete();
        }
    }

    /// Unpin the blocks a bypass read held and schedule the cached
    /// copies over the bypass result. Runs on the worker, or inline
    /// when a fully-hit read cancels its bypass.
    pub(crate) fn merge_dirty(&self, req: &Arc<Request>) {
        let mut logical = req.sector & !(self.blk_sectors - 1);
        while logical < req.end() {
            let (ent_sector, blk_idx) = self.compute_sector(logical);

            if let Some(idx) = self.get_active_entry(ent_sector, GetFlags::empty()) {
                let ent = &self.entries[idx];
                let hit = {
                    let mut blocks = ent.lock_blocks();
                    let blk = &mut blocks[blk_idx];
                    let hit = chain_contains(&blk.toread, req);
                    if hit {
                        blk.bypass -= 1;
                        if blk.bypass == 0 {
                            blk.flags.remove(BlockFlags::BYPASS);
                        }
                        if req.is_failed() {
                            // the bypass never delivered; the pending
                            // read fails unless the cache has the data
                            blk.flags |= BlockFlags::READ_ERROR;
                        }
                    }
                    hit
                };

                debug!(
                    "{}: merge {:#x} ({})",
                    self.name,
                    logical,
                    if hit { "hit" } else { "miss" }
                );

                if hit {
                    ent.set_flag(EntryFlags::HANDLE);
                    // the admission pin
                    self.release_entry(idx);
                }
                // the lookup reference
                self.release_entry(idx);
            }

            logical += self.blk_sectors;
        }
    }

    /// Submit to the backing device once the open task has settled
    pub(crate) fn submit_backing(&self, request: BackingRequest) {
        if self.wait_backing_open() {
            self.backing.submit(request);
        } else {
            (request.done)(Err(BackingError::Open(
                "backing device unavailable".into(),
            )));
        }
    }
}
