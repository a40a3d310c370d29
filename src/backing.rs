//! Backing device submission
//!
//! The cache never talks to hardware itself: the block-device driver
//! that registers a cache hands over a submission function, captured
//! as a [`BackingDevice`]. Cache block I/O is always whole blocks;
//! bypass reads carry the client's original range. `MemDisk` is a
//! RAM-backed reference device with fault injection, used by the test
//! suite and by software deployments.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::region::SECTOR_SIZE;

/// Backing device I/O errors
#[derive(Error, Debug, Clone)]
pub enum BackingError {
    /// The device could not be opened at registration
    #[error("backing device open failed: {0}")]
    Open(String),

    /// A read or write failed
    #[error("backing device i/o error at sector {sector}")]
    Io {
        /// First sector of the failed request
        sector: u64,
    },
}

/// Completion payload: the read data, or an empty vector for writes
pub type BackingResult = Result<Vec<u8>, BackingError>;

/// Completion callback; may be invoked from any thread
pub type BackingDone = Box<dyn FnOnce(BackingResult) + Send>;

/// One submitted backing-device operation
pub enum BackingOp {
    /// Read `len` bytes
    Read {
        /// Bytes to read
        len: usize,
    },
    /// Write the payload
    Write {
        /// Bytes to write
        data: Vec<u8>,
    },
}

/// A request handed to [`BackingDevice::submit`]
pub struct BackingRequest {
    /// First sector of the transfer
    pub sector: u64,
    /// Direction and payload
    pub op: BackingOp,
    /// Called exactly once when the transfer finishes
    pub done: BackingDone,
}

/// The backing device's submission surface, captured at registration.
///
/// Concurrency is delegated to the implementation; `submit` may
/// complete inline on the calling thread or later from another one.
pub trait BackingDevice: Send + Sync {
    /// Acquire the device; called once from a short-lived task during
    /// registration. Failure flips the cache to the failed state.
    fn open(&self) -> Result<(), BackingError> {
        Ok(())
    }

    /// Submit one transfer; `request.done` fires on completion
    fn submit(&self, request: BackingRequest);
}

/// RAM-backed reference device.
pub struct MemDisk {
    data: Mutex<Vec<u8>>,
    fail_writes: AtomicBool,
    fail_read_sectors: Mutex<HashSet<u64>>,
    fail_open: AtomicBool,
}

impl MemDisk {
    /// Create a zero-filled disk of `sectors` sectors
    pub fn new(sectors: u64) -> Self {
        Self {
            data: Mutex::new(vec![0u8; sectors as usize * SECTOR_SIZE]),
            fail_writes: AtomicBool::new(false),
            fail_read_sectors: Mutex::new(HashSet::new()),
            fail_open: AtomicBool::new(false),
        }
    }

    /// Fail every subsequent write
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail any read covering `sector`
    pub fn fail_read_at(&self, sector: u64) {
        self.fail_read_sectors.lock().insert(sector);
    }

    /// Make [`BackingDevice::open`] fail
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Read sectors directly, outside the cache path
    pub fn read_direct(&self, sector: u64, sectors: u64) -> Vec<u8> {
        let offset = sector as usize * SECTOR_SIZE;
        let len = sectors as usize * SECTOR_SIZE;
        self.data.lock()[offset..offset + len].to_vec()
    }

    /// Write sectors directly, outside the cache path
    pub fn write_direct(&self, sector: u64, data: &[u8]) {
        let offset = sector as usize * SECTOR_SIZE;
        self.data.lock()[offset..offset + data.len()].copy_from_slice(data);
    }
}

impl BackingDevice for MemDisk {
    fn open(&self) -> Result<(), BackingError> {
        if self.fail_open.load(Ordering::SeqCst) {
            Err(BackingError::Open("injected open failure".into()))
        } else {
            Ok(())
        }
    }

    fn submit(&self, request: BackingRequest) {
        let BackingRequest { sector, op, done } = request;
        let result = match op {
            BackingOp::Read { len } => {
                let sectors = (len / SECTOR_SIZE) as u64;
                let blocked = {
                    let faults = self.fail_read_sectors.lock();
                    (sector..sector + sectors).any(|s| faults.contains(&s))
                };
                if blocked {
                    Err(BackingError::Io { sector })
                } else {
                    let offset = sector as usize * SECTOR_SIZE;
                    Ok(self.data.lock()[offset..offset + len].to_vec())
                }
            }
            BackingOp::Write { data } => {
                if self.fail_writes.load(Ordering::SeqCst) {
                    Err(BackingError::Io { sector })
                } else {
                    let offset = sector as usize * SECTOR_SIZE;
                    self.data.lock()[offset..offset + data.len()].copy_from_slice(&data);
                    Ok(Vec::new())
                }
            }
        };
        done(result);
    }
}
