//! Asynchronous scatter copies between data pages and request buffers
//!
//! Biofill and biodrain move bytes between the cache's non-volatile
//! data pages and a client request's buffer. The engine is a seam: the
//! default runs the copies on the caller's thread and fires the
//! completion inline, which is also a legal behavior of the offload
//! hardware it stands in for.

use std::sync::Arc;

use crate::cache::request::Request;
use crate::region::NvMemory;

/// Direction of one scatter copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDir {
    /// Request buffer → data page (biodrain)
    ToCache,
    /// Data page → request buffer (biofill)
    FromCache,
}

/// One contiguous range to copy
pub struct CopyOp {
    /// Direction of the transfer
    pub dir: CopyDir,
    /// Byte offset into the non-volatile memory
    pub mem_offset: usize,
    /// Byte offset into the request buffer
    pub buf_offset: usize,
    /// Bytes to move
    pub len: usize,
    /// The request owning the buffer side
    pub request: Arc<Request>,
}

/// Completion callback for a copy batch
pub type CopyDone = Box<dyn FnOnce() + Send>;

/// Engine performing the scatter copies of a biofill or biodrain run.
pub trait CopyEngine: Send + Sync {
    /// Perform `ops` then call `done` exactly once
    fn copy(&self, mem: &Arc<dyn NvMemory>, ops: Vec<CopyOp>, done: CopyDone);
}

/// Caller-thread copy engine.
pub struct InlineCopyEngine;

impl CopyEngine for InlineCopyEngine {
    fn copy(&self, mem: &Arc<dyn NvMemory>, ops: Vec<CopyOp>, done: CopyDone) {
        for op in ops {
            match op.dir {
                CopyDir::ToCache => {
                    let mut chunk = vec![0u8; op.len];
                    op.request.copy_from_buf(op.buf_offset, &mut chunk);
                    mem.write(op.mem_offset, &chunk);
                }
                CopyDir::FromCache => {
                    let mut chunk = vec![0u8; op.len];
                    mem.read(op.mem_offset, &mut chunk);
                    op.request.copy_to_buf(op.buf_offset, &chunk);
                }
            }
        }
        done();
    }
}
