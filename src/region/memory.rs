//! Non-volatile memory access
//!
//! The cache never assumes implicit visibility of stores to the
//! protected region: descriptor words are written whole, and
//! `store_fence` must be mapped by the implementer to the platform's
//! write-combining flush primitive. `RamMemory` is the heap-backed
//! implementation used by tests and software deployments; it can record
//! a trace of descriptor stores and fences so persistence ordering can
//! be asserted.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Page size of the protected region, in bytes
pub const PAGE_SIZE: usize = 4096;

/// Sector size used by the block layer, in bytes
pub const SECTOR_SIZE: usize = 512;

/// Sectors covered by one page
pub const SECTORS_PER_PAGE: u64 = (PAGE_SIZE / SECTOR_SIZE) as u64;

/// Byte-addressed access to a power-loss-protected memory device.
///
/// Offsets are relative to the device start; callers stay in bounds.
/// The memory is mapped write-combining on real hardware, so a store is
/// only guaranteed visible across a power cycle after `store_fence`.
pub trait NvMemory: Send + Sync {
    /// Total device size in bytes
    fn len(&self) -> usize;

    /// Whether the device is zero-sized
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `buf.len()` bytes out of the device at `offset`
    fn read(&self, offset: usize, buf: &mut [u8]);

    /// Copy `data` into the device at `offset`
    fn write(&self, offset: usize, data: &[u8]);

    /// Read one aligned 64-bit word
    fn read_u64(&self, offset: usize) -> u64;

    /// Store one aligned 64-bit word as a single whole-word write
    fn write_u64(&self, offset: usize, value: u64);

    /// Drain write-combining buffers so all prior stores are durable
    fn store_fence(&self);
}

/// One recorded persistence event on a traced [`RamMemory`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    /// A 64-bit store of `value` at `offset`
    Store {
        /// Byte offset of the store
        offset: usize,
        /// Stored word
        value: u64,
    },
    /// A store fence
    Fence,
}

/// Heap-backed reference implementation of [`NvMemory`].
pub struct RamMemory {
    data: Mutex<Vec<u8>>,
    trace: Option<Mutex<Vec<TraceEvent>>>,
    fences: AtomicU64,
}

impl RamMemory {
    /// Create a zero-filled memory of `pages` pages
    pub fn new(pages: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; pages * PAGE_SIZE]),
            trace: None,
            fences: AtomicU64::new(0),
        }
    }

    /// Create a memory that records 64-bit stores and fences
    pub fn with_trace(pages: usize) -> Self {
        Self {
            trace: Some(Mutex::new(Vec::new())),
            ..Self::new(pages)
        }
    }

    /// Number of fences issued so far
    pub fn fence_count(&self) -> u64 {
        self.fences.load(Ordering::SeqCst)
    }

    /// Snapshot of the recorded trace; empty when tracing is off
    pub fn trace(&self) -> Vec<TraceEvent> {
        self.trace
            .as_ref()
            .map(|t| t.lock().clone())
            .unwrap_or_default()
    }

    /// Clear the recorded trace
    pub fn clear_trace(&self) {
        if let Some(t) = &self.trace {
            t.lock().clear();
        }
    }
}

impl NvMemory for RamMemory {
    fn len(&self) -> usize {
        self.data.lock().len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) {
        let data = self.data.lock();
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    fn write(&self, offset: usize, data: &[u8]) {
        let mut mem = self.data.lock();
        mem[offset..offset + data.len()].copy_from_slice(data);
    }

    fn read_u64(&self, offset: usize) -> u64 {
        let mut word = [0u8; 8];
        self.read(offset, &mut word);
        u64::from_le_bytes(word)
    }

    fn write_u64(&self, offset: usize, value: u64) {
        self.write(offset, &value.to_le_bytes());
        if let Some(t) = &self.trace {
            t.lock().push(TraceEvent::Store { offset, value });
        }
    }

    fn store_fence(&self) {
        self.fences.fetch_add(1, Ordering::SeqCst);
        if let Some(t) = &self.trace {
            t.lock().push(TraceEvent::Fence);
        }
    }
}
