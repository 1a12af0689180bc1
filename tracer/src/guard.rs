use crate::{async_begin, async_end, duration_begin, duration_end};

/// Scoped duration event: Begin on construction, End on drop, so every
/// exit path of the enclosing scope terminates the span.
pub struct DurationGuard {
    module: &'static str,
    tracepoint: &'static str,
}

impl DurationGuard {
    pub(crate) fn new(module: &'static str, tracepoint: &'static str) -> Self {
        duration_begin(module, tracepoint);
        DurationGuard { module, tracepoint }
    }

    /// Ends the current span and immediately begins a new one, keeping a
    /// single guard alive across the phases of a longer operation.
    pub fn reset(&mut self, module: &'static str, tracepoint: &'static str) {
        duration_end(self.module, self.tracepoint);
        self.module = module;
        self.tracepoint = tracepoint;
        duration_begin(self.module, self.tracepoint);
    }
}

impl Drop for DurationGuard {
    fn drop(&mut self) {
        duration_end(self.module, self.tracepoint);
    }
}

/// Scoped async event: AsyncBegin on construction, AsyncEnd with the same
/// cookie on drop.
pub struct AsyncGuard {
    module: &'static str,
    tracepoint: &'static str,
    cookie: u64,
}

impl AsyncGuard {
    pub(crate) fn new(module: &'static str, tracepoint: &'static str, cookie: u64) -> Self {
        async_begin(module, tracepoint, cookie);
        AsyncGuard {
            module,
            tracepoint,
            cookie,
        }
    }
}

impl Drop for AsyncGuard {
    fn drop(&mut self) {
        async_end(self.module, self.tracepoint, self.cookie);
    }
}
