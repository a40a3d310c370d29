//! # BBCache - Battery-Backed Block Cache
//!
//! A write-back cache engine for block devices, persisting cached
//! blocks in power-loss-protected memory so that every acknowledged
//! write survives a power cycle.
//!
//! ## Architecture
//!
//! - `region`: the persistent layer — memory abstraction, region
//!   headers, the per-block descriptor store, region allocation
//! - `cache`: the engine — entry pool, request admission with bypass
//!   reads, the worker state machine, crash recovery, laundry
//! - `backing`: the backing-device submission seam and a RAM
//!   reference device
//! - `copy`: the async scatter-copy seam used by biofill and biodrain
//! - `manager`: device attachment, region configuration, and the
//!   registration API
//!
//! A registered cache splits every request by block boundary, attaches
//! the pieces to stripe entries, and lets a per-cache worker drive each
//! entry through read fill, drain, and writeback. The 64-bit descriptor
//! word per block is the sole durable record; recovery rebuilds the
//! whole pool from the descriptor table alone.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Persistent region layer
pub mod region;

// The cache engine
pub mod cache;

// Backing device seam
pub mod backing;

// Async copy seam
pub mod copy;

// Registration and configuration
pub mod manager;

// Re-export commonly used types
pub use backing::{BackingDevice, BackingError, BackingOp, BackingRequest, BackingResult, MemDisk};
pub use cache::{
    CacheError, CacheResult, CacheState, Direction, Geometry, IoRequest, RequestCompletion,
    Tunables,
};
pub use copy::{CopyDir, CopyEngine, CopyOp, InlineCopyEngine};
pub use manager::{CacheHandle, CacheManager};
pub use region::{BlockState, NvMemory, RamMemory, RegionSpec, PAGE_SIZE, SECTOR_SIZE};

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
