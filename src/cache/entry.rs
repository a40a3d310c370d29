//! Cache entries and their per-block state
//!
//! An entry groups the M blocks of one stripe member set; it is the
//! unit the hash indexes, the free lists track, and the worker
//! processes. Entry-level flags are an atomic bit set so completion
//! context can mark an entry for handling without its lock; everything
//! per block (chains, flags, state) lives under the entry lock.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};

use crate::region::BlockState;

use super::request::Request;

bitflags! {
    /// Transient per-block flags; authoritative in memory only
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: u32 {
        /// Block I/O in flight
        const LOCKED = 1 << 0;
        /// Data page content is valid
        const UPTODATE = 1 << 1;
        /// Data page is newer than the backing device
        const DIRTY = 1 << 2;
        /// The queued writes fully cover the block
        const OVERWRITE = 1 << 3;
        /// Read fill scheduled
        const WANTREAD = 1 << 4;
        /// Writeback scheduled
        const WANTWRITE = 1 << 5;
        /// Cache→client copy scheduled
        const WANTFILL = 1 << 6;
        /// Client→cache copy scheduled
        const WANTDRAIN = 1 << 7;
        /// A backing read of this block failed
        const READ_ERROR = 1 << 8;
        /// A bypass read has this block pinned
        const BYPASS = 1 << 9;
        /// A requester was refused for overlap and is waiting
        const OVERLAP = 1 << 10;
    }
}

bitflags! {
    /// Per-entry flags, stored in an atomic word
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        /// Queued (or due to be queued) for the worker
        const HANDLE = 1 << 0;
        /// At least one block holds dirty data
        const DIRTY = 1 << 1;
        /// Writeback pass in progress
        const WRITEBACK = 1 << 2;
        /// A biofill copy batch is running
        const BIOFILL_RUN = 1 << 3;
        /// A biodrain copy batch is running
        const BIODRAIN_RUN = 1 << 4;
    }
}

/// One block of an entry.
pub struct CacheBlock {
    /// Data slot index in the region, fixed after recovery
    pub slot: Option<u32>,
    /// Mirror of the durable descriptor state
    pub state: BlockState,
    /// Transient flag set
    pub flags: BlockFlags,
    /// Distinct bypass readers pinning this block
    pub bypass: u32,
    /// Reads waiting to copy out of this block, ordered by sector
    pub toread: Vec<Arc<Request>>,
    /// Reads whose biofill copy is running
    pub read: Vec<Arc<Request>>,
    /// Writes waiting to copy into this block, ordered by sector
    pub towrite: Vec<Arc<Request>>,
    /// Writes whose biodrain copy is running
    pub written: Vec<Arc<Request>>,
}

impl CacheBlock {
    fn new() -> Self {
        Self {
            slot: None,
            state: BlockState::Unassociated,
            flags: BlockFlags::empty(),
            bypass: 0,
            toread: Vec::new(),
            read: Vec::new(),
            towrite: Vec::new(),
            written: Vec::new(),
        }
    }

    /// Whether any request or transfer references the block
    pub fn is_idle(&self) -> bool {
        self.toread.is_empty()
            && self.read.is_empty()
            && self.towrite.is_empty()
            && self.written.is_empty()
            && !self.flags.intersects(BlockFlags::LOCKED | BlockFlags::BYPASS)
    }
}

/// One pool entry: M blocks sharing a stripe base.
pub struct CacheEntry {
    /// Arena index of this entry
    pub index: usize,
    sector: AtomicU64,
    count: AtomicU32,
    flags: AtomicU32,
    blocks: Mutex<Box<[CacheBlock]>>,
}

impl CacheEntry {
    pub(crate) fn new(index: usize, members: usize) -> Self {
        let blocks: Vec<CacheBlock> = (0..members).map(|_| CacheBlock::new()).collect();
        Self {
            index,
            sector: AtomicU64::new(0),
            count: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            blocks: Mutex::new(blocks.into_boxed_slice()),
        }
    }

    /// Stripe-base sector; valid while the entry is hashed
    pub fn sector(&self) -> u64 {
        self.sector.load(Ordering::SeqCst)
    }

    pub(crate) fn set_sector(&self, sector: u64) {
        self.sector.store(sector, Ordering::SeqCst);
    }

    /// Current reference count
    pub fn refs(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    /// Take a reference
    pub(crate) fn get(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop a reference; true when the count reaches zero
    pub(crate) fn put(&self) -> bool {
        self.count.fetch_sub(1, Ordering::SeqCst) == 1
    }

    /// Set `flag`; returns whether it was already set
    pub(crate) fn set_flag(&self, flag: EntryFlags) -> bool {
        self.flags.fetch_or(flag.bits(), Ordering::SeqCst) & flag.bits() != 0
    }

    /// Clear `flag`; returns whether it was set
    pub(crate) fn clear_flag(&self, flag: EntryFlags) -> bool {
        self.flags.fetch_and(!flag.bits(), Ordering::SeqCst) & flag.bits() != 0
    }

    /// Whether `flag` is set
    pub fn test_flag(&self, flag: EntryFlags) -> bool {
        self.flags.load(Ordering::SeqCst) & flag.bits() != 0
    }

    /// Lock the block records.
    ///
    /// Lock order: the entry lock is taken before the cache-wide lock;
    /// holders of the cache-wide lock may only lock an entry that is
    /// provably idle (reference count zero while the cache-wide lock
    /// pins it there).
    pub(crate) fn lock_blocks(&self) -> MutexGuard<'_, Box<[CacheBlock]>> {
        self.blocks.lock()
    }
}

/// Live snapshot the worker derives before applying the handling rules.
#[derive(Debug, Default, Clone, Copy)]
pub struct LiveState {
    /// Blocks with I/O in flight
    pub locked: usize,
    /// Blocks with valid data
    pub uptodate: usize,
    /// Blocks with the dirty flag
    pub dirty: usize,
    /// Blocks with fillable pending reads not yet scheduled
    pub to_read: usize,
    /// Blocks with pending writes
    pub to_write: usize,
    /// Blocks with pending writes not covering the whole block
    pub non_overwrite: usize,
    /// Blocks with pending writes drainable now (no bypass pin)
    pub to_drain: usize,
    /// Blocks with a biofill scheduled this pass
    pub to_fill: usize,
    /// Blocks with a failed backing read
    pub failed: usize,
    /// Entry-level writeback pass in progress
    pub writeback: bool,
    /// Dispatch a biofill batch after the rules
    pub run_biofill: bool,
    /// Dispatch a biodrain batch after the rules
    pub run_biodrain: bool,
}
