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
#![allow(clippy::cast_precision_loss)]

//! The TinyTorrent daemon core.
//!
//! A single engine task owns the [`SessionBackend`](tinytorrent_session::SessionBackend)
//! and all mutable per-torrent state. RPC threads talk to it through a
//! bounded command queue on the [`Core`] handle and read the atomically
//! published [`SessionSnapshot`] without blocking. Dedicated worker tasks
//! carry persistence writes and speed-history bookkeeping; filesystem work
//! (watch-dir scans, metainfo reads, blocklist parsing) runs on a blocking
//! I/O service and re-enters the engine through the same command queue.

mod automation;
mod blocklist;
mod command;
mod config;
mod core;
mod engine;
mod error;
mod history;
mod ids;
mod persistence;
mod policy;
mod resume;
mod scheduler;
mod settings;
mod snapshot;
mod state;
mod tasks;

pub use crate::core::{Core, CoreConfig};
pub use automation::{
    AutomationAgent, MAX_WATCH_FILE_SIZE, WATCH_STABILITY_THRESHOLD, WatchEntry,
    collect_watch_entries, determine_completion_destination, mark_watch_file, read_watch_files,
};
pub use blocklist::{BlocklistManager, BlocklistResult, parse_blocklist};
pub use command::{
    AddStatus, COMMAND_QUEUE_CAPACITY, TorrentAddRequest, TorrentDetailView, TrackerUpdate,
};
pub use config::ConfigurationService;
pub use error::{CoreError, Result};
pub use history::{HistoryBucket, HistoryHandle};
pub use ids::RpcIdRegistry;
pub use persistence::{CachedTorrent, PersistenceManager, write_metadata_sidecar};
pub use policy::{PolicyAction, SeedLimitUpdate, TorrentLimitState, enforce_seed_limits};
pub use resume::ResumeDataService;
pub use scheduler::{kbps_to_bytes, rate_limit_pack, schedule_matches_at, should_use_alt_speed};
pub use settings::{
    CoreSettings, HistoryConfig, SessionUpdate, SettingsDelta, normalize_listen_interface,
};
pub use snapshot::{
    SessionSnapshot, SnapshotCell, SnapshotExtras, TorrentSnapshot, build_torrent_snapshot,
    estimate_eta, transmission_status,
};
pub use state::{SessionStatistics, StateService};
pub use tasks::IoTaskService;
