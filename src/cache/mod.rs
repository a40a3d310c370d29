//! # Cache Engine
//!
//! This module provides:
//! - The per-cache engine state and its entry pool
//! - Request admission with bypass reads and barriers
//! - The worker that drives entries through fill, drain and writeback
//! - Crash recovery from the descriptor table
//! - Watermark writeback and the full-flush barrier
//!
//! One `CacheCore` exists per active cache. Three execution contexts
//! share it: requesters, completion callbacks, and the single worker
//! thread that owns entry-state sequencing. A cache-wide lock protects
//! list membership, counters, the hash table and the barrier flags;
//! each entry's lock protects its block records. The entry lock is
//! acquired before the cache-wide lock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use log::{error, info};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

pub mod entry;
pub mod ingress;
pub mod laundry;
pub mod pool;
pub mod recovery;
pub mod request;
pub mod worker;

pub use entry::{BlockFlags, CacheBlock, CacheEntry, EntryFlags, LiveState};
pub use request::{Direction, IoRequest, Request, RequestCompletion};

use crate::backing::BackingDevice;
use crate::copy::CopyEngine;
use crate::region::{DescriptorTable, NvMemory, RegionError, RegionHeader, PAGE_SIZE};

/// Hash buckets per cache; the table fits one page
pub(crate) const NR_HASH: usize = PAGE_SIZE / 8;

/// Cache engine errors
#[derive(Error, Debug)]
pub enum CacheError {
    /// No cache carries the given UUID
    #[error("no cache with that uuid")]
    NoSuchCache,

    /// An allocation failed; the cache state is unchanged
    #[error("allocation failed: {0}")]
    AllocFailed(String),

    /// The stripe geometry does not fit the region
    #[error("bad geometry: {0}")]
    BadGeometry(String),

    /// The cache is active, or holds data, and cannot be changed
    #[error("cache busy")]
    Busy,

    /// The disk handle does not match the registered one
    #[error("disk is not associated with this cache")]
    WrongDisk,

    /// The cache is not active
    #[error("cache not active")]
    NotActive,

    /// The cache is in the failed state
    #[error("cache failed")]
    Failed,

    /// Recovery found an inconsistent descriptor table
    #[error("descriptor error: {0}")]
    Descriptor(String),

    /// Malformed input to a configuration operation
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A request completed with an I/O error
    #[error("{0}")]
    Io(String),
}

impl From<RegionError> for CacheError {
    fn from(err: RegionError) -> Self {
        match err {
            RegionError::InvalidDescriptor { .. } => CacheError::Descriptor(err.to_string()),
            RegionError::NoSpace(msg) => CacheError::AllocFailed(msg),
            other => CacheError::InvalidInput(other.to_string()),
        }
    }
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Configured but not registered to a disk
    Inactive,
    /// Serving requests
    Active,
    /// A backing write failed; only cache hits are served
    Failed,
}

impl std::fmt::Display for CacheState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Failed => "failed",
        })
    }
}

/// Stripe geometry supplied at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Blocks per entry, M ≥ 1
    pub stripe_members: usize,
    /// Sectors per stripe chunk; 0 when M = 1
    pub stripe_sectors: u64,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            stripe_members: 1,
            stripe_sectors: 0,
        }
    }
}

impl Geometry {
    fn validate(&self, blk_sectors: u64, total_blocks: usize) -> CacheResult<()> {
        if self.stripe_members == 0 {
            return Err(CacheError::BadGeometry("stripe_members must be ≥ 1".into()));
        }
        if self.stripe_members == 1 {
            if self.stripe_sectors != 0 {
                return Err(CacheError::BadGeometry(
                    "stripe_sectors must be 0 for a single member".into(),
                ));
            }
        } else if self.stripe_sectors == 0 || self.stripe_sectors % blk_sectors != 0 {
            return Err(CacheError::BadGeometry(format!(
                "stripe_sectors {} not a multiple of the block size {}",
                self.stripe_sectors, blk_sectors
            )));
        }
        if total_blocks < self.stripe_members {
            return Err(CacheError::BadGeometry(format!(
                "{} blocks cannot host {} stripe members",
                total_blocks, self.stripe_members
            )));
        }
        Ok(())
    }
}

/// Writeback policy knobs.
///
/// `watermark()` is `total - total/watermark_divisor`; once a requester
/// has blocked for a free entry, admission reopens only below
/// `total - total/unblock_divisor`. The unblock fraction follows the
/// original best-effort choice and is deliberately just a knob.
#[derive(Debug, Clone, Copy)]
pub struct Tunables {
    /// Divisor for the dirty+active watermark (default 8: 12.5% reclaimable)
    pub watermark_divisor: usize,
    /// Divisor for the post-block admission mark (default 4: 25% free)
    pub unblock_divisor: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            watermark_divisor: 8,
            unblock_divisor: 4,
        }
    }
}

/// Gate for the auxiliary backing-device open task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenGate {
    Opening,
    Ready,
    FailedOpen,
}

/// State under the cache-wide lock.
pub(crate) struct Shared {
    pub state: CacheState,
    pub free: VecDeque<usize>,
    pub free_dirty: VecDeque<usize>,
    pub handle: VecDeque<usize>,
    pub hash: Vec<Vec<usize>>,
    pub active: usize,
    pub dirty: usize,
    pub writeback_active: usize,
    pub requesters: usize,
    pub active_bypass: usize,
    pub inactive_blocked: bool,
    pub barrier_active: bool,
    pub dirty_merge: VecDeque<Arc<Request>>,
    pub overlap_gen: u64,
    pub wake: bool,
    pub stop: bool,
    pub open_gate: OpenGate,
}

/// One cache instance.
pub struct CacheCore {
    pub(crate) name: String,
    pub(crate) mem: Arc<dyn NvMemory>,
    pub(crate) desc: DescriptorTable,
    pub(crate) data_pfn: u64,
    pub(crate) blk_order: u32,
    pub(crate) blk_sectors: u64,
    pub(crate) members: usize,
    pub(crate) stripe_sectors: u64,
    pub(crate) total_blocks: usize,
    pub(crate) total_entries: usize,
    pub(crate) tunables: Tunables,
    pub(crate) entries: Vec<Arc<CacheEntry>>,
    pub(crate) shared: Mutex<Shared>,
    pub(crate) entry_cond: Condvar,
    pub(crate) work_cond: Condvar,
    pub(crate) overlap_cond: Condvar,
    pub(crate) writeback_cond: Condvar,
    pub(crate) open_cond: Condvar,
    pub(crate) backing: Arc<dyn BackingDevice>,
    pub(crate) copy: Arc<dyn CopyEngine>,
}

impl CacheCore {
    /// Build an engine over a validated region.
    pub(crate) fn new(
        mem: Arc<dyn NvMemory>,
        header: &RegionHeader,
        geometry: Geometry,
        backing: Arc<dyn BackingDevice>,
        copy: Arc<dyn CopyEngine>,
        tunables: Tunables,
    ) -> CacheResult<Arc<Self>> {
        let blk_sectors = header.blk_sectors();
        let total_blocks = header.total_blocks() as usize;
        geometry.validate(blk_sectors, total_blocks)?;

        let members = geometry.stripe_members;
        let total_entries = total_blocks / members;
        let entries: Vec<Arc<CacheEntry>> = (0..total_entries)
            .map(|i| Arc::new(CacheEntry::new(i, members)))
            .collect();

        let shared = Shared {
            state: CacheState::Inactive,
            free: (0..total_entries).collect(),
            free_dirty: VecDeque::new(),
            handle: VecDeque::new(),
            hash: vec![Vec::new(); NR_HASH],
            active: 0,
            dirty: 0,
            writeback_active: 0,
            requesters: 0,
            active_bypass: 0,
            inactive_blocked: false,
            barrier_active: false,
            dirty_merge: VecDeque::new(),
            overlap_gen: 0,
            wake: false,
            stop: false,
            open_gate: OpenGate::Opening,
        };

        Ok(Arc::new(Self {
            name: format!("bbcache/{}", header.name_str()),
            desc: DescriptorTable::new(
                mem.clone(),
                header.start_pfn,
                header.blk_order,
                blk_sectors,
                total_blocks,
            ),
            mem,
            data_pfn: header.data_pfn(),
            blk_order: header.blk_order,
            blk_sectors,
            members,
            stripe_sectors: geometry.stripe_sectors,
            total_blocks,
            total_entries,
            tunables,
            entries,
            shared: Mutex::new(shared),
            entry_cond: Condvar::new(),
            work_cond: Condvar::new(),
            overlap_cond: Condvar::new(),
            writeback_cond: Condvar::new(),
            open_cond: Condvar::new(),
            backing,
            copy,
        }))
    }

    /// Restore state from the descriptors, then start the worker and
    /// the auxiliary open task. Returns the worker join handle.
    pub(crate) fn activate(self: &Arc<Self>) -> CacheResult<thread::JoinHandle<()>> {
        recovery::restore(self)?;

        self.shared.lock().state = CacheState::Active;

        let core = self.clone();
        let task = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || worker::worker_loop(core))
            .map_err(|e| CacheError::AllocFailed(e.to_string()))?;

        // the open routine may block or recurse into the driver, so it
        // runs off a short-lived task; requests hold until it settles
        let core = self.clone();
        thread::Builder::new()
            .name(format!("{}-get", self.name))
            .spawn(move || {
                let result = core.backing.open();
                let mut shared = core.shared.lock();
                match result {
                    Ok(()) => shared.open_gate = OpenGate::Ready,
                    Err(err) => {
                        error!("{}: backing device open failed: {}", core.name, err);
                        shared.open_gate = OpenGate::FailedOpen;
                        shared.state = CacheState::Failed;
                    }
                }
                core.open_cond.notify_all();
                core.entry_cond.notify_all();
            })
            .map_err(|e| CacheError::AllocFailed(e.to_string()))?;

        info!(
            "{}: activated, {} entries of {} block{}",
            self.name,
            self.total_entries,
            self.members,
            if self.members == 1 { "" } else { "s" }
        );

        Ok(task)
    }

    /// Stop the worker after it drains the handle list once more.
    pub(crate) fn stop_worker(&self, task: thread::JoinHandle<()>) {
        {
            let mut shared = self.shared.lock();
            shared.stop = true;
            shared.wake = true;
            self.work_cond.notify_all();
        }
        let _ = task.join();
    }

    /// Cache lifecycle state
    pub fn state(&self) -> CacheState {
        self.shared.lock().state
    }

    /// `(active, dirty, writeback)` entry counts
    pub fn counters(&self) -> (usize, usize, usize) {
        let shared = self.shared.lock();
        (shared.active, shared.dirty, shared.writeback_active)
    }

    /// Entries in the pool
    pub fn entry_count(&self) -> usize {
        self.total_entries
    }

    /// Round a sector down to its block boundary and locate the owning
    /// entry: `(stripe-base sector, block index)`.
    pub(crate) fn compute_sector(&self, sector: u64) -> (u64, usize) {
        let sector = sector & !(self.blk_sectors - 1);
        if self.stripe_sectors == 0 {
            (sector, 0)
        } else {
            let chunk = sector / self.stripe_sectors;
            let offset = sector % self.stripe_sectors;
            let blk_idx = (chunk % self.members as u64) as usize;
            let ent_sector = (chunk - blk_idx as u64) * self.stripe_sectors + offset;
            (ent_sector, blk_idx)
        }
    }

    /// Backing sector of block `blk_idx` of the entry at `ent_sector`
    pub(crate) fn blk_to_sector(&self, ent_sector: u64, blk_idx: usize) -> u64 {
        if self.stripe_sectors == 0 {
            ent_sector
        } else {
            let chunk_base = ent_sector / self.stripe_sectors;
            let offset = ent_sector % self.stripe_sectors;
            (chunk_base + blk_idx as u64) * self.stripe_sectors + offset
        }
    }

    /// Hash bucket for a stripe-base sector
    pub(crate) fn hash_bucket(&self, sector: u64) -> usize {
        let stride = if self.stripe_sectors == 0 {
            self.blk_sectors
        } else {
            self.stripe_sectors * self.members as u64
        };
        ((sector / stride) % NR_HASH as u64) as usize
    }

    /// Byte offset of data slot `slot` in the region memory
    pub(crate) fn data_offset(&self, slot: u32) -> usize {
        (self.data_pfn as usize + ((slot as usize) << self.blk_order)) * PAGE_SIZE
    }

    /// Bytes per block
    pub(crate) fn blk_bytes(&self) -> usize {
        PAGE_SIZE << self.blk_order
    }

    /// Dirty+active ceiling above which laundry starts
    pub(crate) fn watermark(&self) -> usize {
        self.total_entries - self.total_entries / self.tunables.watermark_divisor
    }

    /// Stricter mark required to reopen admission after a block
    pub(crate) fn unblock_mark(&self) -> usize {
        self.total_entries - self.total_entries / self.tunables.unblock_divisor
    }

    /// Mark the worker runnable; caller holds the cache-wide lock
    pub(crate) fn wake_worker(&self, shared: &mut Shared) {
        shared.wake = true;
        self.work_cond.notify_one();
    }

    /// Block until the auxiliary open task settles; false if it failed
    pub(crate) fn wait_backing_open(&self) -> bool {
        let mut shared = self.shared.lock();
        while shared.open_gate == OpenGate::Opening {
            self.open_cond.wait(&mut shared);
        }
        shared.open_gate == OpenGate::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::MemDisk;
    use crate::copy::InlineCopyEngine;
    use crate::region::RamMemory;

    fn test_core(size_mb: u32, order: u32, geometry: Geometry) -> Arc<CacheCore> {
        let mut header = RegionHeader::new("t0", size_mb, order);
        header.start_pfn = 1;
        header.seal();
        let mem = Arc::new(RamMemory::new(1 + header.region_pages() as usize));
        CacheCore::new(
            mem,
            &header,
            geometry,
            Arc::new(MemDisk::new(1 << 20)),
            Arc::new(InlineCopyEngine),
            Tunables::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_locate_degenerates_without_striping() {
        let geometry = Geometry::default();
        assert!(geometry.validate(8, 64).is_ok());

        let core = test_core(1, 0, Geometry::default());
        assert_eq!(core.total_entries, core.total_blocks);
        assert_eq!(core.compute_sector(0), (0, 0));
        assert_eq!(core.compute_sector(13), (8, 0));
        assert_eq!(core.blk_to_sector(8, 0), 8);
    }

    #[test]
    fn test_locate_striped_round_trip() {
        // 2 members, 16-sector chunks, 8-sector blocks
        let geometry = Geometry {
            stripe_members: 2,
            stripe_sectors: 16,
        };
        let core = test_core(1, 0, geometry);

        for sector in (0..512).step_by(8) {
            let (ent_sector, blk_idx) = core.compute_sector(sector);
            assert!(blk_idx < 2);
            let back = core.blk_to_sector(ent_sector, blk_idx);
            assert_eq!(back, sector, "sector {sector}");
        }

        // both chunks of one stripe land in the same entry
        let (ent_a, idx_a) = core.compute_sector(0);
        let (ent_b, idx_b) = core.compute_sector(16);
        assert_eq!(ent_a, ent_b);
        assert_ne!(idx_a, idx_b);
    }

    #[test]
    fn test_entry_count_follows_members() {
        let geometry = Geometry {
            stripe_members: 2,
            stripe_sectors: 8,
        };
        let core = test_core(1, 0, geometry);
        assert_eq!(core.total_blocks, 256);
        assert_eq!(core.total_entries, 128);
    }

    #[test]
    fn test_geometry_validation() {
        let bad = Geometry {
            stripe_members: 1,
            stripe_sectors: 64,
        };
        assert!(bad.validate(8, 64).is_err());

        let unaligned = Geometry {
            stripe_members: 2,
            stripe_sectors: 12,
        };
        assert!(unaligned.validate(8, 64).is_err());

        let too_few = Geometry {
            stripe_members: 4,
            stripe_sectors: 8,
        };
        assert!(too_few.validate(8, 2).is_err());

        let good = Geometry {
            stripe_members: 2,
            stripe_sectors: 16,
        };
        assert!(good.validate(8, 64).is_ok());
    }

    #[test]
    fn test_watermarks() {
        let tunables = Tunables::default();
        assert_eq!(tunables.watermark_divisor, 8);
        assert_eq!(tunables.unblock_divisor, 4);
    }
}
