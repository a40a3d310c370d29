//! Per-block descriptor store
//!
//! One 64-bit word per data-page slot is the sole durable record of a
//! block: the low three bits hold the state, the rest the backing
//! sector this slot mirrors. The word is always written whole, before
//! any dependent data change is considered committed, and a store
//! fence publishes each batch of updates.

use std::sync::Arc;

use super::memory::NvMemory;
use super::{RegionError, RegionResult, PAGE_SIZE};

/// Low bits of a descriptor word holding the state
pub const STATE_MASK: u64 = 0x7;

/// Durable per-block state.
///
/// `Unassociated`, `Sync` and `Dirty` are the terminal states; the four
/// lock states appear on media only while a transition's data transfer
/// is in flight and are repaired by recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockState {
    /// Slot mirrors nothing
    Unassociated = 0,
    /// Slot data matches the backing device
    Sync = 1,
    /// Slot data is newer than the backing device
    Dirty = 2,
    /// Full overwrite of an unassociated slot in flight
    ReplaceLock = 3,
    /// Read fill from the backing device in flight
    ReadLock = 4,
    /// Partial update of synced data in flight
    UpdateLock = 5,
    /// Writeback to the backing device in flight
    WritebackLock = 6,
}

impl BlockState {
    /// Decode the state bits of a descriptor word
    pub fn from_bits(bits: u64) -> Option<Self> {
        match bits & STATE_MASK {
            0 => Some(Self::Unassociated),
            1 => Some(Self::Sync),
            2 => Some(Self::Dirty),
            3 => Some(Self::ReplaceLock),
            4 => Some(Self::ReadLock),
            5 => Some(Self::UpdateLock),
            6 => Some(Self::WritebackLock),
            _ => None,
        }
    }

    /// Whether this is transient crash debris rather than a terminal state
    pub fn is_lock(self) -> bool {
        matches!(
            self,
            Self::ReplaceLock | Self::ReadLock | Self::UpdateLock | Self::WritebackLock
        )
    }
}

impl std::fmt::Display for BlockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unassociated => "unassociated",
            Self::Sync => "sync",
            Self::Dirty => "dirty",
            Self::ReplaceLock => "replace-lock",
            Self::ReadLock => "read-lock",
            Self::UpdateLock => "update-lock",
            Self::WritebackLock => "writeback-lock",
        };
        f.write_str(s)
    }
}

/// Typed handle over one region's descriptor table.
pub struct DescriptorTable {
    mem: Arc<dyn NvMemory>,
    base: usize,
    blk_order: u32,
    blk_sectors: u64,
    total_blocks: usize,
}

impl DescriptorTable {
    /// Bind a table at `start_pfn` covering `total_blocks` blocks of
    /// order `blk_order`
    pub fn new(
        mem: Arc<dyn NvMemory>,
        start_pfn: u64,
        blk_order: u32,
        blk_sectors: u64,
        total_blocks: usize,
    ) -> Self {
        Self {
            mem,
            base: start_pfn as usize * PAGE_SIZE,
            blk_order,
            blk_sectors,
            total_blocks,
        }
    }

    /// Number of block slots in the table
    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    fn offset(&self, blk: usize) -> usize {
        debug_assert!(blk < self.total_blocks);
        // one word per data page; a block of 2^k pages uses the word of
        // its first page
        self.base + ((blk << self.blk_order) * 8)
    }

    /// Raw descriptor word for block slot `blk`
    pub fn read_raw(&self, blk: usize) -> u64 {
        self.mem.read_u64(self.offset(blk))
    }

    /// Decode the descriptor for block slot `blk`
    pub fn read(&self, blk: usize) -> RegionResult<(BlockState, u64)> {
        let word = self.read_raw(blk);
        let state = BlockState::from_bits(word).ok_or(RegionError::InvalidDescriptor {
            slot: blk,
            value: word,
        })?;
        let sector = word & !STATE_MASK;
        if sector & (self.blk_sectors - 1) != 0 {
            return Err(RegionError::InvalidDescriptor {
                slot: blk,
                value: word,
            });
        }
        Ok((state, sector))
    }

    /// Persist `state` and `sector` for block slot `blk` as one word.
    ///
    /// The sector is stored as zero for `Unassociated`.
    pub fn write(&self, blk: usize, state: BlockState, sector: u64) {
        debug_assert_eq!(sector & (self.blk_sectors - 1), 0);
        let sector = if state == BlockState::Unassociated {
            0
        } else {
            sector
        };
        self.mem.write_u64(self.offset(blk), sector | state as u64);
    }

    /// Publish all prior descriptor stores
    pub fn fence(&self) {
        self.mem.store_fence();
    }
}
