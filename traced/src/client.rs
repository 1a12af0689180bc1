use std::collections::HashMap;
use tracing::warn;

/// Accumulates bytes from a client socket and splits out complete
/// newline-terminated announcements, keeping a partial tail for the next
/// read.
#[derive(Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        LineBuffer::default()
    }

    /// Appends `bytes` and returns every complete line, empties skipped.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if line.is_empty() {
                continue;
            }
            match std::str::from_utf8(line) {
                Ok(line) => lines.push(line.to_string()),
                Err(_) => warn!("ignoring non-UTF-8 announcement line"),
            }
        }
        lines
    }

    /// Bytes held back waiting for their newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Everything the collector keeps per connected client: the read buffer
/// and the id → string table populated by RegisterString records. Both
/// die with the connection.
#[derive(Default)]
pub struct ClientState {
    pub lines: LineBuffer,
    pub strings: HashMap<u64, String>,
}

impl ClientState {
    pub fn new() -> Self {
        ClientState::default()
    }
}
