//! Error taxonomy shared by the storage engine, the consensus adapter and
//! the RPC surface.

use std::io;

use thiserror::Error;

/// Unified error kind for every operation in the crate.
///
/// The `Display` form of a variant is what ends up in a wire
/// [`Response`](crate::command::Response) error field.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("not leader, redirect to: {leader}")]
    NotLeader { leader: String },
    #[error("no leader elected")]
    NoLeader,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not a directory: {0}")]
    NotDirectory(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("too large: {0}")]
    TooLarge(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("raft error: {0}")]
    Raft(String),
}

impl FsError {
    /// Maps a kernel error to the taxonomy, keeping the offending path.
    pub fn from_io(path: &str, err: io::Error) -> FsError {
        match err.kind() {
            io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
            io::ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_string()),
            io::ErrorKind::NotADirectory => FsError::NotDirectory(path.to_string()),
            io::ErrorKind::DirectoryNotEmpty => FsError::NotEmpty(path.to_string()),
            _ => FsError::Io(err),
        }
    }
}
