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

//! SQLite persistence for the TinyTorrent daemon: the settings key/value
//! table, the torrent table and the speed-history table, behind a small
//! async store with embedded migrations.

mod error;
mod store;

pub use error::{DataError, Result};
pub use store::{SessionStatisticsRow, SpeedHistoryRow, StateStore, TorrentRow};
