use serde::Serialize;
use std::io::Write;

use crate::Result;

/// Streaming writer for the Chrome trace JSON object form.
///
/// Events are appended as they are decoded; the `,` separator is written
/// before every event after the first, so the array needs no fix-up when
/// the document is closed and the sink works on non-seekable outputs like
/// stdout.
pub struct TraceSink<W: Write> {
    writer: W,
    events: u64,
}

impl<W: Write> TraceSink<W> {
    /// Opens the document and writes the prologue.
    pub fn new(mut writer: W) -> Result<Self> {
        writer.write_all(b"{\"traceEvents\": [\n")?;
        Ok(TraceSink { writer, events: 0 })
    }

    pub fn emit<T: Serialize>(&mut self, event: &T) -> Result<()> {
        if self.events > 0 {
            self.writer.write_all(b",\n")?;
        }
        serde_json::to_writer(&mut self.writer, event)?;
        self.events += 1;
        Ok(())
    }

    /// Events emitted so far.
    pub fn events(&self) -> u64 {
        self.events
    }

    /// Closes the array, writes the epilogue and flushes, handing the
    /// writer back.
    pub fn finish(mut self) -> Result<W> {
        self.writer.write_all(b"\n]}\n")?;
        self.writer.flush()?;
        Ok(self.writer)
    }
}
