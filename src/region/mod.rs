//! # Persistent Region Layer
//!
//! This module provides:
//! - The `NvMemory` abstraction over power-loss-protected memory
//! - The on-media region header and the device page-0 directory
//! - The per-block descriptor store with whole-word persistence
//! - Region creation and deletion (`"name[:sizeMB[:order]]"` control)
//!
//! A region is a contiguous run of protected memory owned by one cache:
//! its descriptor table first, the block data area after it. The header
//! for every region on a device lives in the directory at device page 0.

use thiserror::Error;

pub mod allocator;
pub mod descriptor;
pub mod header;
pub mod memory;

pub use allocator::{delete_region, insert_region, RegionSpec};
pub use descriptor::{BlockState, DescriptorTable};
pub use header::{RegionHeader, MAX_REGIONS, REGION_MAGIC, REGION_NAME_LEN};
pub use memory::{NvMemory, RamMemory, TraceEvent, PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};

/// Region layer errors
#[derive(Error, Debug)]
pub enum RegionError {
    /// A descriptor word decoded to an invalid state or misaligned sector
    #[error("invalid descriptor at slot {slot}: {value:#x}")]
    InvalidDescriptor {
        /// Block slot index of the offending word
        slot: usize,
        /// Raw descriptor value
        value: u64,
    },

    /// The control string could not be parsed
    #[error("invalid region spec: {0}")]
    InvalidSpec(String),

    /// A region with the requested name already exists
    #[error("region name already in use: {0}")]
    DuplicateName(String),

    /// No directory slot or no free run of pages large enough
    #[error("no space for region: {0}")]
    NoSpace(String),
}

/// Result type for region operations
pub type RegionResult<T> = Result<T, RegionError>;
