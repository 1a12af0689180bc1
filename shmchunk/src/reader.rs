use core::ptr::NonNull;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use protocol::CHUNK_SIZE;
use std::num::NonZeroUsize;
use tracing::warn;

use crate::error::ChunkError;
use crate::Result;

/// A chunk mapped read-only by the collector.
///
/// The backing object is unlinked as soon as the open succeeds, so the
/// name cannot leak even if parsing fails later; the kernel keeps the
/// pages alive until this mapping is dropped.
pub struct ReaderChunk {
    ptr: NonNull<u8>,
    name: String,
}

impl ReaderChunk {
    pub fn open(name: &str) -> Result<Self> {
        let fd = shm_open(name, OFlag::O_RDONLY, Mode::empty()).map_err(|source| {
            ChunkError::Open {
                name: name.to_string(),
                source,
            }
        })?;

        if let Err(errno) = shm_unlink(name) {
            warn!(name, error = %errno, "failed to unlink announced chunk");
        }

        let ptr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(CHUNK_SIZE).unwrap(),
                ProtFlags::PROT_READ,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
            .map_err(|source| ChunkError::Map {
                name: name.to_string(),
                source,
            })?
        };
        let ptr = NonNull::new(ptr.as_ptr() as *mut u8).expect("mmap returned null pointer");

        Ok(ReaderChunk {
            ptr,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), CHUNK_SIZE) }
    }
}

impl Drop for ReaderChunk {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.cast(), CHUNK_SIZE);
        }
    }
}

unsafe impl Send for ReaderChunk {}
