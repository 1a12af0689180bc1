use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use protocol::CHUNK_NAME_PREFIX;
use shmchunk::{sweep_stale_chunks, ReaderChunk};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::client::ClientState;
use crate::parse::parse_chunk;
use crate::sink::TraceSink;
use crate::Result;

const LISTENER_TOKEN: u64 = 0;

/// How long the readiness loop sleeps before rechecking the shutdown flag.
const POLL_INTERVAL_MS: u16 = 100;

/// The collector daemon: one listening socket, one epoll loop, one client
/// context per connection.
///
/// Everything runs on the calling thread. Chunks are bounded and parsing
/// one is fast relative to producing it, so handling one readiness event
/// at a time keeps up without any daemon-side concurrency.
pub struct Collector<W: Write> {
    listener: UnixListener,
    socket_path: PathBuf,
    sink: TraceSink<W>,
    clients: HashMap<u64, Client>,
    next_token: u64,
}

struct Client {
    stream: UnixStream,
    state: ClientState,
}

enum ReadOutcome {
    Lines(Vec<String>),
    Closed,
    Nothing,
}

impl<W: Write> Collector<W> {
    /// Binds the control socket (replacing a stale socket file), clears
    /// chunk names left over by earlier runs, and opens the output
    /// document. Failures here are fatal to the caller; failures after
    /// this point never are.
    pub fn new(socket_path: &Path, writer: W) -> Result<Self> {
        let _ = fs::remove_file(socket_path);
        let listener = UnixListener::bind(socket_path)?;
        listener.set_nonblocking(true)?;
        info!(socket = %socket_path.display(), "collector listening");

        sweep_stale_chunks();

        let sink = TraceSink::new(writer)?;
        Ok(Collector {
            listener,
            socket_path: socket_path.to_path_buf(),
            sink,
            clients: HashMap::new(),
            next_token: LISTENER_TOKEN + 1,
        })
    }

    /// Runs the accept/read loop until `shutdown` is set.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        epoll.add(
            &self.listener,
            EpollEvent::new(EpollFlags::EPOLLIN, LISTENER_TOKEN),
        )?;

        let mut events = vec![EpollEvent::empty(); 16];
        while !shutdown.load(Ordering::SeqCst) {
            let nfds = match epoll.wait(&mut events, EpollTimeout::from(POLL_INTERVAL_MS)) {
                Ok(nfds) => nfds,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
            };
            for event in events.iter().take(nfds) {
                match event.data() {
                    LISTENER_TOKEN => self.accept_clients(&epoll)?,
                    token => self.drain_client(&epoll, token),
                }
            }
        }

        debug!(
            clients = self.clients.len(),
            "shutdown requested, closing client sockets"
        );
        self.clients.clear();
        Ok(())
    }

    /// Events written to the sink so far.
    pub fn events(&self) -> u64 {
        self.sink.events()
    }

    /// Closes the document and removes the socket file, handing back the
    /// sink's writer.
    pub fn finish(self) -> Result<W> {
        let _ = fs::remove_file(&self.socket_path);
        self.sink.finish()
    }

    fn accept_clients(&mut self, epoll: &Epoll) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(true)?;
                    let token = self.next_token;
                    self.next_token += 1;
                    epoll.add(&stream, EpollEvent::new(EpollFlags::EPOLLIN, token))?;
                    self.clients.insert(
                        token,
                        Client {
                            stream,
                            state: ClientState::new(),
                        },
                    );
                    debug!(token, "client connected");
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => {
                    warn!(%error, "error accepting connection");
                    break;
                }
            }
        }
        Ok(())
    }

    fn drain_client(&mut self, epoll: &Epoll, token: u64) {
        let outcome = {
            let Some(client) = self.clients.get_mut(&token) else {
                return;
            };
            let mut buf = [0u8; 4096];
            match (&client.stream).read(&mut buf) {
                Ok(0) => ReadOutcome::Closed,
                Ok(n) => ReadOutcome::Lines(client.state.lines.push(&buf[..n])),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => ReadOutcome::Nothing,
                Err(error) => {
                    warn!(token, %error, "client read error");
                    ReadOutcome::Closed
                }
            }
        };

        match outcome {
            ReadOutcome::Lines(names) => {
                for name in names {
                    self.process_chunk(token, &name);
                }
            }
            ReadOutcome::Closed => {
                if let Some(client) = self.clients.remove(&token) {
                    let _ = epoll.delete(&client.stream);
                    debug!(
                        token,
                        pending = client.state.lines.pending(),
                        "client disconnected"
                    );
                }
            }
            ReadOutcome::Nothing => {}
        }
    }

    fn process_chunk(&mut self, token: u64, name: &str) {
        if !name.starts_with(CHUNK_NAME_PREFIX) {
            warn!(token, name, "ignoring announcement outside the chunk namespace");
            return;
        }
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };

        let chunk = match ReaderChunk::open(name) {
            Ok(chunk) => chunk,
            Err(error) => {
                warn!(token, name, %error, "cannot open announced chunk");
                return;
            }
        };

        match parse_chunk(chunk.as_bytes(), &mut client.state.strings, &mut self.sink) {
            Ok(emitted) => debug!(token, name = chunk.name(), emitted, "chunk processed"),
            Err(error) => warn!(token, name = chunk.name(), %error, "skipping malformed chunk"),
        }
    }
}
