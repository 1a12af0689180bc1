use core::ptr::NonNull;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use protocol::{ChunkHeader, CHUNK_SIZE, HEADER_SIZE};
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;

use crate::error::ChunkError;
use crate::{chunk_name, Result};

/// A chunk mapped read/write by the thread that produces into it.
///
/// The mapping is exclusive to its owner until [`WriterChunk::seal`]
/// releases it for announcement; after that the object lives on under its
/// name until the collector (or a stale sweep) unlinks it.
pub struct WriterChunk {
    ptr: NonNull<u8>,
    cursor: usize,
    name: String,
    _fd: OwnedFd,
}

impl WriterChunk {
    /// Creates, sizes and maps a fresh chunk and writes its header.
    pub fn create(seq: u64, pid: u64, tid: u64, epoch_micros: u64) -> Result<Self> {
        let name = chunk_name(seq);

        // A leftover object with this name would otherwise be resized
        // under a reader's feet.
        let _ = shm_unlink(name.as_str());

        let fd = shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|source| ChunkError::Create {
            name: name.clone(),
            source,
        })?;

        ftruncate(&fd, CHUNK_SIZE as i64).map_err(|source| ChunkError::Truncate {
            name: name.clone(),
            source,
        })?;

        let ptr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(CHUNK_SIZE).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
            .map_err(|source| ChunkError::Map {
                name: name.clone(),
                source,
            })?
        };
        let ptr = NonNull::new(ptr.as_ptr() as *mut u8).expect("mmap returned null pointer");

        let header = ChunkHeader::new(pid, tid, epoch_micros);
        unsafe {
            std::ptr::copy_nonoverlapping(header.to_bytes().as_ptr(), ptr.as_ptr(), HEADER_SIZE);
        }

        Ok(WriterChunk {
            ptr,
            cursor: HEADER_SIZE,
            name,
            _fd: fd,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes still available for records.
    pub fn remaining(&self) -> usize {
        CHUNK_SIZE - self.cursor
    }

    /// Hands out the next `len` bytes of the chunk, or `None` when they do
    /// not fit. The cursor only ever advances by granted reservations, so
    /// it cannot pass the end of the mapping.
    pub fn reserve(&mut self, len: usize) -> Option<&mut [u8]> {
        if len > self.remaining() {
            return None;
        }
        let start = self.cursor;
        self.cursor += len;
        debug_assert!(self.cursor <= CHUNK_SIZE);
        Some(unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(start), len) })
    }

    /// Releases the mapping and descriptor, returning the object name for
    /// the announcement. The writer must not touch the chunk afterwards.
    pub fn seal(mut self) -> String {
        std::mem::take(&mut self.name)
    }
}

impl Drop for WriterChunk {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.cast(), CHUNK_SIZE);
        }
    }
}

// The mapping is exclusively owned; moving it between threads is fine.
unsafe impl Send for WriterChunk {}
