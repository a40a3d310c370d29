//! Crash recovery
//!
//! At activation the descriptor table is the only record of the cache.
//! Two passes rebuild the entry pool from it:
//!
//! - Pass 1 repairs transient lock states and adopts every associated
//!   slot into the entry its sector locates. An interrupted overwrite
//!   or read is discarded; an interrupted update or writeback reverts
//!   to dirty so the data is kept and the writeback retried.
//! - Pass 2 rounds out: every free slot is handed to an entry still
//!   missing a member, then to fresh entries, until both run out.
//!
//! Success requires every entry fully populated and fewer than M
//! surplus slots; anything else fails activation with a descriptor
//! error and the region stays loadable.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, info};

use crate::region::BlockState;

use super::entry::{BlockFlags, EntryFlags};
use super::{CacheCore, CacheError, CacheResult};

/// Rebuild pool state from the descriptor table. Runs single-threaded
/// before the worker starts.
pub(crate) fn restore(core: &Arc<CacheCore>) -> CacheResult<()> {
    let mut shared = core.shared.lock();
    let mut by_sector: HashMap<u64, usize> = HashMap::new();
    let mut partial: VecDeque<usize> = VecDeque::new();
    let mut complete: VecDeque<usize> = VecDeque::new();
    let mut complete_dirty: VecDeque<usize> = VecDeque::new();
    let mut leftovers = core.total_blocks;

    // pass 1: repair transient states, adopt associated slots
    for slot in 0..core.total_blocks {
        let (state, sector) = core
            .desc
            .read(slot)
            .map_err(|e| CacheError::Descriptor(e.to_string()))?;

        let normalized = match state {
            // interrupted overwrite, discard
            BlockState::ReplaceLock => BlockState::Unassociated,
            // interrupted read, revert
            BlockState::ReadLock => BlockState::Unassociated,
            // interrupted update, take the new version
            BlockState::UpdateLock => BlockState::Dirty,
            // interrupted writeback, revert to dirty and retry
            BlockState::WritebackLock => BlockState::Dirty,
            terminal => terminal,
        };
        core.desc.write(slot, normalized, sector);

        if normalized == BlockState::Unassociated {
            continue;
        }

        let (ent_sector, blk_idx) = core.compute_sector(sector);
        let idx = match by_sector.get(&ent_sector) {
            Some(&idx) => idx,
            None => {
                let Some(idx) = shared.free.pop_front() else {
                    return Err(CacheError::Descriptor(
                        "more associated stripes than entries".into(),
                    ));
                };
                core.entries[idx].set_sector(ent_sector);
                core.insert_hash(&mut shared, idx, ent_sector);
                by_sector.insert(ent_sector, idx);
                idx
            }
        };

        let ent = &core.entries[idx];
        let mut blocks = ent.lock_blocks();
        let blk = &mut blocks[blk_idx];
        if blk.slot.is_some() {
            return Err(CacheError::Descriptor(format!(
                "duplicate allocation for stripe {:#x} block {}",
                ent_sector, blk_idx
            )));
        }
        blk.slot = Some(slot as u32);
        blk.state = normalized;
        match normalized {
            BlockState::Dirty => {
                blk.flags |= BlockFlags::DIRTY | BlockFlags::UPTODATE;
                if !ent.set_flag(EntryFlags::DIRTY) {
                    shared.dirty += 1;
                }
            }
            BlockState::Sync => {
                blk.flags |= BlockFlags::UPTODATE;
            }
            _ => unreachable!("normalized state is terminal"),
        }
        drop(blocks);

        debug!(
            "{}: restore slot {} ({}) sector {:#x} (stripe {:#x})",
            core.name, slot, normalized, sector, ent_sector
        );
        leftovers -= 1;
    }

    for &idx in by_sector.values() {
        let full = core.entries[idx]
            .lock_blocks()
            .iter()
            .all(|blk| blk.slot.is_some());
        if !full {
            partial.push_back(idx);
        } else if core.entries[idx].test_flag(EntryFlags::DIRTY) {
            complete_dirty.push_back(idx);
        } else {
            complete.push_back(idx);
        }
    }

    // pass 2: hand every free slot to an entry missing a member
    for slot in 0..core.total_blocks {
        let (state, _) = core
            .desc
            .read(slot)
            .map_err(|e| CacheError::Descriptor(e.to_string()))?;
        if state != BlockState::Unassociated {
            continue;
        }

        let idx = match partial.front().copied() {
            Some(idx) => idx,
            None => match shared.free.pop_front() {
                Some(idx) => {
                    partial.push_back(idx);
                    idx
                }
                // surplus slots; checked below
                None => break,
            },
        };

        let ent = &core.entries[idx];
        let mut blocks = ent.lock_blocks();
        let Some(blk) = blocks.iter_mut().find(|blk| blk.slot.is_none()) else {
            return Err(CacheError::Descriptor(format!(
                "no open member position for slot {}",
                slot
            )));
        };
        blk.slot = Some(slot as u32);
        blk.state = BlockState::Unassociated;
        core.desc.write(slot, BlockState::Unassociated, 0);
        let full = blocks.iter().all(|blk| blk.slot.is_some());
        drop(blocks);

        if full {
            partial.retain(|&i| i != idx);
            if ent.test_flag(EntryFlags::DIRTY) {
                complete_dirty.push_back(idx);
            } else {
                complete.push_back(idx);
            }
        }
        leftovers -= 1;
    }

    // every entry must have a block per member; fewer leftover slots
    // than one entry's worth is benign surplus
    if !partial.is_empty() || !shared.free.is_empty() || leftovers >= core.members {
        return Err(CacheError::Descriptor(format!(
            "failed to populate the pool: {} partial, {} unfilled, {} leftover slots",
            partial.len(),
            shared.free.len(),
            leftovers
        )));
    }

    shared.free = complete;
    shared.free_dirty = complete_dirty;
    core.desc.fence();

    info!(
        "{}: restored {} blocks ({} dirty entries)",
        core.name, core.total_blocks, shared.dirty
    );

    Ok(())
}
