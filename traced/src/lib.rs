//! The collector: accepts tracer connections on the control socket, maps
//! each announced chunk read-only, decodes its records and streams Chrome
//! trace events to the output sink.

pub mod client;
pub mod daemon;
pub mod parse;
pub mod sink;

use thiserror::Error;

pub use client::{ClientState, LineBuffer};
pub use daemon::Collector;
pub use sink::TraceSink;

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    Nix(#[from] nix::Error),

    #[error("chunk error: {0}")]
    Chunk(#[from] shmchunk::ChunkError),

    #[error("malformed chunk: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("JSON serialisation error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CollectorError>;
