//! Client requests and per-block request chains
//!
//! This module provides:
//! - The public submission form, `IoRequest`
//! - The shared in-flight request state with its segment counter
//! - The completion handle returned to the client
//! - Ordered per-block chain operations (insert, overlap, coverage)
//!
//! A request is split by block boundary at admission; every attached
//! block slice holds one segment reference, and the completion fires
//! when the counter drops back to zero.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::region::SECTOR_SIZE;

use super::{CacheError, CacheResult};

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Backing device → client
    Read,
    /// Client → cache
    Write,
}

/// A client request prior to submission.
#[derive(Debug)]
pub struct IoRequest {
    pub(crate) direction: Direction,
    pub(crate) sector: u64,
    pub(crate) sectors: u64,
    pub(crate) barrier: bool,
    pub(crate) data: Vec<u8>,
}

impl IoRequest {
    /// Read `sectors` sectors starting at `sector`
    pub fn read(sector: u64, sectors: u64) -> Self {
        Self {
            direction: Direction::Read,
            sector,
            sectors,
            barrier: false,
            data: Vec::new(),
        }
    }

    /// Write `data` (a whole number of sectors) starting at `sector`
    pub fn write(sector: u64, data: Vec<u8>) -> Self {
        Self {
            direction: Direction::Write,
            sector,
            sectors: (data.len() / SECTOR_SIZE) as u64,
            barrier: false,
            data,
        }
    }

    /// Drive the cache to quiescence before admitting this request
    pub fn barrier(mut self) -> Self {
        self.barrier = true;
        self
    }
}

/// Shared state of one in-flight request.
pub struct Request {
    pub(crate) direction: Direction,
    pub(crate) sector: u64,
    pub(crate) sectors: u64,
    buf: Mutex<Vec<u8>>,
    remaining: AtomicUsize,
    ok: AtomicBool,
    done: Mutex<bool>,
    done_cond: Condvar,
}

impl Request {
    pub(crate) fn new(io: IoRequest) -> Arc<Self> {
        let buf = match io.direction {
            Direction::Write => io.data,
            Direction::Read => vec![0u8; io.sectors as usize * SECTOR_SIZE],
        };
        Arc::new(Self {
            direction: io.direction,
            sector: io.sector,
            sectors: io.sectors,
            buf: Mutex::new(buf),
            remaining: AtomicUsize::new(1),
            ok: AtomicBool::new(true),
            done: Mutex::new(false),
            done_cond: Condvar::new(),
        })
    }

    /// One past the last sector of the request
    pub fn end(&self) -> u64 {
        self.sector + self.sectors
    }

    /// Add one segment reference (an attached block slice or a bypass)
    pub(crate) fn add_segment(&self) {
        self.remaining.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one segment reference; true when the counter reaches zero
    pub(crate) fn end_segment(&self) -> bool {
        self.remaining.fetch_sub(1, Ordering::SeqCst) == 1
    }

    /// Mark the request failed; the completion surfaces an I/O error
    pub(crate) fn fail(&self) {
        self.ok.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_failed(&self) -> bool {
        !self.ok.load(Ordering::SeqCst)
    }

    /// Fire the completion; called exactly once, after the last segment
    pub(crate) fn complete(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.done_cond.notify_all();
    }

    /// Copy `data` into the request buffer at byte `offset`
    pub fn copy_to_buf(&self, offset: usize, data: &[u8]) {
        self.buf.lock()[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Copy out of the request buffer at byte `offset`
    pub fn copy_from_buf(&self, offset: usize, out: &mut [u8]) {
        out.copy_from_slice(&self.buf.lock()[offset..offset + out.len()]);
    }

    /// Intersection of this request with the block at `blk_sector`:
    /// `(buffer byte offset, byte offset into the block, length)`.
    pub(crate) fn block_range(&self, blk_sector: u64, blk_sectors: u64) -> Option<(usize, usize, usize)> {
        let start = self.sector.max(blk_sector);
        let end = self.end().min(blk_sector + blk_sectors);
        if start >= end {
            return None;
        }
        Some((
            (start - self.sector) as usize * SECTOR_SIZE,
            (start - blk_sector) as usize * SECTOR_SIZE,
            (end - start) as usize * SECTOR_SIZE,
        ))
    }
}

/// Client handle for one submitted request.
pub struct RequestCompletion {
    pub(crate) req: Arc<Request>,
}

impl RequestCompletion {
    /// Block until the request completes; returns the transferred data
    /// (the filled buffer for reads, the acknowledged payload for
    /// writes), or the request's I/O error.
    pub fn wait(&self) -> CacheResult<Vec<u8>> {
        let mut done = self.req.done.lock();
        while !*done {
            self.req.done_cond.wait(&mut done);
        }
        drop(done);
        if self.req.is_failed() {
            Err(CacheError::Io(format!(
                "i/o error at sector {:#x}",
                self.req.sector
            )))
        } else {
            Ok(self.req.buf.lock().clone())
        }
    }

    /// Like [`wait`](Self::wait) with a timeout; `None` on expiry
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CacheResult<Vec<u8>>> {
        let mut done = self.req.done.lock();
        while !*done {
            if self
                .req
                .done_cond
                .wait_for(&mut done, timeout)
                .timed_out()
            {
                return None;
            }
        }
        drop(done);
        Some(if self.req.is_failed() {
            Err(CacheError::Io(format!(
                "i/o error at sector {:#x}",
                self.req.sector
            )))
        } else {
            Ok(self.req.buf.lock().clone())
        })
    }

    /// Whether the completion has fired
    pub fn is_done(&self) -> bool {
        *self.req.done.lock()
    }
}

/// Insert `req` into a chain ordered by sector.
///
/// Fails when the request's range overlaps a chain member; the chains
/// preserve submission order between non-overlapping requests.
pub(crate) fn chain_insert(chain: &mut Vec<Arc<Request>>, req: &Arc<Request>) -> bool {
    let mut pos = 0;
    for member in chain.iter() {
        if member.sector >= req.sector {
            break;
        }
        if member.end() > req.sector {
            return false;
        }
        pos += 1;
    }
    if let Some(next) = chain.get(pos) {
        if next.sector < req.end() {
            return false;
        }
    }
    chain.insert(pos, req.clone());
    true
}

/// Whether the chain's writes fully cover the block at `blk_sector`
pub(crate) fn chain_covers(chain: &[Arc<Request>], blk_sector: u64, blk_sectors: u64) -> bool {
    let base = blk_sector;
    let mut s = base;
    for req in chain {
        if s >= base + blk_sectors {
            break;
        }
        if req.sector > s {
            return false;
        }
        s = s.max(req.end());
    }
    s >= base + blk_sectors
}

/// Whether `req` is a member of the chain
pub(crate) fn chain_contains(chain: &[Arc<Request>], req: &Arc<Request>) -> bool {
    chain.iter().any(|member| Arc::ptr_eq(member, req))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(sector: u64, sectors: u64) -> Arc<Request> {
        Request::new(IoRequest::read(sector, sectors))
    }

    #[test]
    fn test_chain_insert_keeps_order() {
        let mut chain = Vec::new();
        let a = req(8, 2);
        let b = req(0, 4);
        let c = req(4, 4);
        assert!(chain_insert(&mut chain, &a));
        assert!(chain_insert(&mut chain, &b));
        assert!(chain_insert(&mut chain, &c));
        let sectors: Vec<u64> = chain.iter().map(|r| r.sector).collect();
        assert_eq!(sectors, vec![0, 4, 8]);
    }

    #[test]
    fn test_chain_insert_rejects_overlap() {
        let mut chain = Vec::new();
        assert!(chain_insert(&mut chain, &req(2, 4)));
        assert!(!chain_insert(&mut chain, &req(0, 3)));
        assert!(!chain_insert(&mut chain, &req(5, 2)));
        assert!(!chain_insert(&mut chain, &req(2, 4)));
        assert!(chain_insert(&mut chain, &req(6, 2)));
    }

    #[test]
    fn test_chain_coverage() {
        let mut chain = Vec::new();
        chain_insert(&mut chain, &req(0, 3));
        assert!(!chain_covers(&chain, 0, 8));
        chain_insert(&mut chain, &req(3, 5));
        assert!(chain_covers(&chain, 0, 8));

        let mut gap = Vec::new();
        chain_insert(&mut gap, &req(0, 2));
        chain_insert(&mut gap, &req(4, 4));
        assert!(!chain_covers(&gap, 0, 8));
    }

    #[test]
    fn test_coverage_with_spanning_request() {
        // a request starting before the block still covers it
        let mut chain = Vec::new();
        chain_insert(&mut chain, &req(0, 24));
        assert!(chain_covers(&chain, 8, 8));
    }

    #[test]
    fn test_segment_counter() {
        let r = req(0, 1);
        r.add_segment();
        assert!(!r.end_segment());
        assert!(r.end_segment());
    }

    #[test]
    fn test_block_range() {
        let r = req(6, 8); // sectors 6..14
        assert_eq!(r.block_range(0, 8), Some((0, 6 * 512, 2 * 512)));
        assert_eq!(r.block_range(8, 8), Some((2 * 512, 0, 6 * 512)));
        assert_eq!(r.block_range(16, 8), None);
    }
}
