use thiserror::Error;

use crate::hash::InfoHash;

/// Failures surfaced by a session backend.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A magnet URI or metainfo blob could not be decoded.
    #[error("invalid torrent source: {reason}")]
    InvalidSource {
        /// Why decoding failed.
        reason: String,
    },
    /// A hex infohash string was malformed.
    #[error("invalid infohash {value:?}")]
    InvalidInfoHash {
        /// The offending value.
        value: String,
    },
    /// An operation referenced a torrent the session does not hold.
    #[error("unknown torrent {0}")]
    UnknownTorrent(InfoHash),
    /// The backend reported an internal failure.
    #[error("session backend failure: {0}")]
    Backend(String),
}
