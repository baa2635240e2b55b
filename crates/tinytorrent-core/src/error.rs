use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by core commands.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The magnet URI or metainfo payload could not be decoded.
    #[error("invalid torrent source")]
    InvalidUri,
    /// A save path could not be created.
    #[error("could not create path {path}")]
    InvalidPath {
        /// The offending path.
        path: PathBuf,
    },
    /// The referenced torrent id is unknown.
    #[error("unknown torrent id {0}")]
    UnknownTorrent(i64),
    /// The engine is shutting down and no longer accepts commands.
    #[error("engine is shutting down")]
    ShuttingDown,
    /// Resume-data collection did not settle before the shutdown timeout.
    #[error("shutdown timed out waiting for resume data")]
    ShutdownTimeout,
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
