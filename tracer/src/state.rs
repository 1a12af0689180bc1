use arc_swap::ArcSwapOption;
use protocol::Message;
use shmchunk::{sweep_stale_chunks, ChunkSeq, WriterChunk};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once, OnceLock};
use tracing::{debug, error, warn};

use crate::channel::ControlChannel;

// Process-global state. The control channel is set once at init and only
// ever swapped back to None by deinit; emit paths do lock-free loads.
static CONTROL: ArcSwapOption<ControlChannel> = ArcSwapOption::const_empty();
static INIT: Once = Once::new();
static CHUNK_SEQ: ChunkSeq = ChunkSeq::new();
static STRING_SEQ: AtomicU64 = AtomicU64::new(1);
static EPOCH_MICROS: OnceLock<u64> = OnceLock::new();
static MONO_ORIGIN: OnceLock<u64> = OnceLock::new();

thread_local! {
    static THREAD: RefCell<ThreadState> = RefCell::new(ThreadState::new());
    static TID: u64 = gettid();
}

fn gettid() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

fn clock_micros(clock: libc::clockid_t) -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(clock, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}

/// Microseconds since the monotonic origin captured at init.
pub(crate) fn relative_micros() -> u64 {
    clock_micros(libc::CLOCK_MONOTONIC).saturating_sub(MONO_ORIGIN.get().copied().unwrap_or(0))
}

pub(crate) fn init_at(path: &Path) {
    INIT.call_once(|| {
        let _ = EPOCH_MICROS.set(clock_micros(libc::CLOCK_REALTIME));
        let _ = MONO_ORIGIN.set(clock_micros(libc::CLOCK_MONOTONIC));

        // Inside the collector (or one of its helpers) we must neither
        // connect back to it nor sweep chunks it is still processing.
        if std::env::var_os("TRACED").is_some() {
            debug!("TRACED is set, tracing stays disabled");
            return;
        }

        sweep_stale_chunks();

        match ControlChannel::connect(path) {
            Ok(channel) => CONTROL.store(Some(Arc::new(channel))),
            Err(error) => {
                debug!(%error, path = %path.display(), "collector unreachable, tracing disabled");
            }
        }
    });
}

pub(crate) fn enabled() -> bool {
    CONTROL.load().is_some()
}

pub(crate) fn shutdown() {
    THREAD.with(|cell| cell.borrow_mut().submit_current());
    CONTROL.store(None);
}

pub(crate) fn with_thread<R>(f: impl FnOnce(&mut ThreadState) -> R) -> R {
    THREAD.with(|cell| f(&mut cell.borrow_mut()))
}

/// Per-thread writer state: the current chunk and the pointer-keyed intern
/// table. Nothing here is shared, so the emit path takes no locks.
pub(crate) struct ThreadState {
    chunk: Option<WriterChunk>,
    interned: HashMap<usize, u64>,
    chunks_created: u64,
}

impl ThreadState {
    fn new() -> Self {
        ThreadState {
            chunk: None,
            interned: HashMap::new(),
            chunks_created: 0,
        }
    }

    /// Returns the wire id for a static string, registering it on first
    /// use. Registration happens before the caller reserves space for its
    /// own record, so the RegisterString always precedes the first use in
    /// chunk order.
    pub(crate) fn intern(&mut self, s: &'static str) -> u64 {
        let key = s.as_ptr() as usize;
        if let Some(&id) = self.interned.get(&key) {
            return id;
        }
        let id = STRING_SEQ.fetch_add(1, Ordering::Relaxed);
        let clipped = protocol::clip_string(s);
        self.write(&Message::RegisterString {
            id,
            string: clipped.as_bytes(),
        });
        self.interned.insert(key, id);
        id
    }

    pub(crate) fn write(&mut self, message: &Message<'_>) {
        let len = message.encoded_len();
        self.ensure_chunk(len);
        let chunk = self
            .chunk
            .as_mut()
            .expect("ensure_chunk leaves a chunk in place");
        let buf = chunk
            .reserve(len)
            .expect("ensure_chunk reserved enough capacity");
        message.encode(buf).expect("reserved buffer fits the record");
    }

    fn ensure_chunk(&mut self, needed: usize) {
        if matches!(&self.chunk, Some(chunk) if chunk.remaining() >= needed) {
            return;
        }
        self.submit_current();

        let seq = CHUNK_SEQ.next();
        let epoch = EPOCH_MICROS.get().copied().unwrap_or(0);
        match WriterChunk::create(seq, std::process::id() as u64, TID.with(|&tid| tid), epoch) {
            Ok(chunk) => {
                debug!(name = chunk.name(), "allocated fresh chunk");
                self.chunk = Some(chunk);
                self.chunks_created += 1;
            }
            Err(error) => {
                // Allocation failure means the process is out of
                // resources; the caller must see it.
                error!(%error, "cannot allocate trace chunk");
                std::process::abort();
            }
        }
    }

    /// Seals the current chunk and publishes its name. Announcing at most
    /// once and dropping all references afterwards is what transfers
    /// ownership to the collector.
    pub(crate) fn submit_current(&mut self) {
        let Some(chunk) = self.chunk.take() else {
            return;
        };
        let name = chunk.seal();
        match CONTROL.load().as_ref() {
            Some(channel) => {
                if let Err(error) = channel.announce(&name) {
                    warn!(%error, name = %name, "failed to announce chunk, dropping it");
                }
            }
            None => debug!(name = %name, "control channel closed, dropping chunk"),
        }
    }

    #[allow(dead_code)]
    pub(crate) fn remaining(&self) -> u64 {
        self.chunk.as_ref().map_or(0, |chunk| chunk.remaining()) as u64
    }

    #[allow(dead_code)]
    pub(crate) fn chunks_created(&self) -> u64 {
        self.chunks_created
    }
}

impl Drop for ThreadState {
    // Thread exit flushes the thread's partial chunk while the control
    // channel may still be open.
    fn drop(&mut self) {
        self.submit_current();
    }
}
