#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::cargo,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

//! Backend-agnostic session interface consumed by the TinyTorrent core.
//!
//! The daemon treats the BitTorrent implementation as an opaque
//! [`SessionBackend`]: a bag of torrent handles addressed by infohash, a
//! settings sink, and a stream of [`Alert`]s. The in-memory
//! [`MemorySession`] implements the same contract for tests and for builds
//! without a native backend.

mod backend;
mod error;
mod hash;
mod memory;
mod types;

pub use backend::{Alert, ListenProtocol, SessionBackend};
pub use error::SessionError;
pub use hash::InfoHash;
pub use memory::{MemorySession, SessionDriver};
pub use types::{
    AddTorrentParams, EncryptionMode, FileEntry, FilePriority, IpFilter, IpRange, PeerEntry,
    ProxyKind, ProxySpec, QueueMove, SessionTotals, SettingsPack, TorrentDetail, TorrentSource,
    TorrentState, TorrentStatus, TrackerEntry,
};
