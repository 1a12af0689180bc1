//! Client half of the trace pipeline.
//!
//! Applications call [`init`] once, emit events through the free functions
//! or the scoped guards, and call [`deinit`] before exit. Events are
//! written into per-thread shared-memory chunks and the collector is only
//! told a chunk's name once the writer is done with it, so the emit path
//! stays constant-time and never blocks on the collector.
//!
//! If the collector cannot be reached at init the library stays disabled
//! and every operation is a no-op; a traced application must not fail just
//! because nobody is listening. `module` and `tracepoint` arguments are
//! `&'static str` by contract: the intern table is keyed on pointer
//! identity.

mod channel;
mod guard;
mod state;

use protocol::Message;
use std::path::Path;

pub use guard::{AsyncGuard, DurationGuard};

/// One-time setup: captures the clock origins, sweeps chunk names left
/// over by a crashed run, and dials the collector's control socket.
///
/// Idempotent; later calls are no-ops. Setting `TRACED` in the
/// environment, or the collector being unreachable, leaves the library
/// disabled — that is not an error.
pub fn init() {
    state::init_at(Path::new(protocol::CONTROL_SOCKET_PATH))
}

/// [`init`] against a non-default control socket path.
pub fn init_with_socket(path: &Path) {
    state::init_at(path)
}

/// Publishes the calling thread's current chunk and closes the control
/// channel. Safe to call more than once.
pub fn deinit() {
    state::shutdown()
}

/// False iff the library is disabled. Callers use this to skip expensive
/// preparation of trace arguments.
pub fn should_trace(_module: &'static str) -> bool {
    state::enabled()
}

/// Records the start of a duration event on the calling thread. Must be
/// matched by [`duration_end`] with the same arguments; pairs nest.
pub fn duration_begin(module: &'static str, tracepoint: &'static str) {
    if !state::enabled() {
        return;
    }
    state::with_thread(|thread| {
        let category_id = thread.intern(module) as u16;
        let tracepoint_id = thread.intern(tracepoint);
        thread.write(&Message::Begin {
            micros: state::relative_micros(),
            category_id,
            tracepoint_id,
        });
    });
    self_counters();
}

/// Records the end of a duration event started by [`duration_begin`].
pub fn duration_end(module: &'static str, tracepoint: &'static str) {
    if !state::enabled() {
        return;
    }
    state::with_thread(|thread| {
        let category_id = thread.intern(module) as u16;
        let tracepoint_id = thread.intern(tracepoint);
        thread.write(&Message::End {
            micros: state::relative_micros(),
            category_id,
            tracepoint_id,
        });
    });
    self_counters();
}

/// Records a counter sample. `tracepoint` names the variable being
/// sampled rather than a code location.
pub fn counter(module: &'static str, tracepoint: &'static str, value: u64) {
    if !state::enabled() {
        return;
    }
    state::with_thread(|thread| {
        let category_id = thread.intern(module) as u16;
        let tracepoint_id = thread.intern(tracepoint);
        thread.write(&Message::Counter {
            micros: state::relative_micros(),
            category_id,
            tracepoint_id,
            value,
        });
    });
    self_counters();
}

/// Like [`counter`], with an id distinguishing several counters that share
/// one name.
pub fn counter_with_id(module: &'static str, tracepoint: &'static str, value: u64, id: u64) {
    if !state::enabled() {
        return;
    }
    state::with_thread(|thread| {
        let category_id = thread.intern(module) as u16;
        let tracepoint_id = thread.intern(tracepoint);
        thread.write(&Message::CounterWithId {
            micros: state::relative_micros(),
            category_id,
            tracepoint_id,
            value,
            id,
        });
    });
    self_counters();
}

/// Records the start of an asynchronous event. The caller-supplied cookie
/// links it to the matching [`async_end`]; begin and end may happen on
/// different threads.
pub fn async_begin(module: &'static str, tracepoint: &'static str, cookie: u64) {
    if !state::enabled() {
        return;
    }
    state::with_thread(|thread| {
        let category_id = thread.intern(module) as u16;
        let tracepoint_id = thread.intern(tracepoint);
        thread.write(&Message::AsyncBegin {
            micros: state::relative_micros(),
            category_id,
            tracepoint_id,
            cookie,
        });
    });
    self_counters();
}

/// Records the end of an asynchronous event started with the same cookie.
pub fn async_end(module: &'static str, tracepoint: &'static str, cookie: u64) {
    if !state::enabled() {
        return;
    }
    state::with_thread(|thread| {
        let category_id = thread.intern(module) as u16;
        let tracepoint_id = thread.intern(tracepoint);
        thread.write(&Message::AsyncEnd {
            micros: state::relative_micros(),
            category_id,
            tracepoint_id,
            cookie,
        });
    });
    self_counters();
}

/// Duration event scoped to the returned guard's lifetime.
pub fn duration_scope(module: &'static str, tracepoint: &'static str) -> DurationGuard {
    DurationGuard::new(module, tracepoint)
}

/// Async event scoped to the returned guard's lifetime.
pub fn async_scope(module: &'static str, tracepoint: &'static str, cookie: u64) -> AsyncGuard {
    AsyncGuard::new(module, tracepoint, cookie)
}

#[cfg(feature = "self-counters")]
fn self_counters() {
    use std::cell::Cell;

    thread_local! {
        static IN_SELF_COUNTERS: Cell<bool> = const { Cell::new(false) };
    }

    IN_SELF_COUNTERS.with(|flag| {
        if flag.get() {
            return;
        }
        flag.set(true);
        let (remaining, chunks) =
            state::with_thread(|thread| (thread.remaining(), thread.chunks_created()));
        counter("tracer", "remainingChunkSize", remaining);
        counter("tracer", "chunkCount", chunks);
        flag.set(false);
    });
}

#[cfg(not(feature = "self-counters"))]
fn self_counters() {}
