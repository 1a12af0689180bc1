use nix::errno::Errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("failed to create shared-memory object {name}: {source}")]
    Create { name: String, source: Errno },

    #[error("failed to size shared-memory object {name}: {source}")]
    Truncate { name: String, source: Errno },

    #[error("failed to map shared-memory object {name}: {source}")]
    Map { name: String, source: Errno },

    #[error("failed to open shared-memory object {name}: {source}")]
    Open { name: String, source: Errno },
}
