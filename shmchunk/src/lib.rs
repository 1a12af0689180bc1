//! Shared-memory chunk transport: writer-side lifecycle for the tracer,
//! reader-side mapping for the collector, and the process-wide name
//! allocation both agree on.

pub mod error;
pub mod reader;
pub mod writer;

use nix::sys::mman::shm_unlink;
use protocol::{CHUNK_NAME_PREFIX, MAX_CHUNKS};
use std::sync::atomic::{AtomicU64, Ordering};

pub use error::ChunkError;
pub use reader::ReaderChunk;
pub use writer::WriterChunk;

pub type Result<T> = std::result::Result<T, ChunkError>;

/// Name of the shared-memory object backing chunk `seq`.
pub fn chunk_name(seq: u64) -> String {
    format!("{}{}", CHUNK_NAME_PREFIX, seq)
}

/// Process-wide chunk sequence allocator.
///
/// Name uniqueness within a process run depends on this being a single
/// atomic counter; the value wraps below [`MAX_CHUNKS`] so every produced
/// name falls inside the range covered by [`sweep_stale_chunks`].
pub struct ChunkSeq(AtomicU64);

impl ChunkSeq {
    pub const fn new() -> Self {
        ChunkSeq(AtomicU64::new(0))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) % MAX_CHUNKS
    }
}

impl Default for ChunkSeq {
    fn default() -> Self {
        Self::new()
    }
}

/// Unlinks every chunk name a previous run could have left behind.
///
/// Used by the collector at startup and by the tracer at init so a crashed
/// process does not leak up to `MAX_CHUNKS` shared-memory objects.
pub fn sweep_stale_chunks() {
    for seq in 0..MAX_CHUNKS {
        let _ = shm_unlink(chunk_name(seq).as_str());
    }
}
