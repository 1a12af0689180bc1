use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Write side of the control socket shared by every thread.
///
/// Each announcement is one short `write` (a chunk name plus newline, far
/// below the socket's atomic-write size), so concurrent announcements from
/// different threads cannot interleave mid-line.
pub(crate) struct ControlChannel {
    stream: UnixStream,
}

impl ControlChannel {
    pub(crate) fn connect(path: &Path) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        Ok(ControlChannel { stream })
    }

    pub(crate) fn announce(&self, chunk_name: &str) -> io::Result<()> {
        let mut line = Vec::with_capacity(chunk_name.len() + 1);
        line.extend_from_slice(chunk_name.as_bytes());
        line.push(b'\n');
        (&self.stream).write_all(&line)
    }
}
