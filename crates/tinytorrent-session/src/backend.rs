use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::SessionError;
use crate::hash::InfoHash;
use crate::types::{
    AddTorrentParams, FilePriority, IpFilter, QueueMove, SessionTotals, SettingsPack,
    TorrentDetail, TorrentStatus, TrackerEntry,
};

/// Transport a listener alert refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenProtocol {
    /// Plain TCP listener.
    Tcp,
    /// UDP (tracker/DHT) listener.
    Udp,
    /// uTP listener.
    Utp,
}

/// Asynchronous notifications drained from the session each engine tick.
#[derive(Debug, Clone)]
pub enum Alert {
    /// Batched status refresh for active torrents.
    StateUpdate {
        /// Latest statuses, one per updated torrent.
        statuses: Vec<TorrentStatus>,
    },
    /// A torrent finished downloading its wanted payload.
    TorrentFinished {
        /// Status at completion time.
        status: TorrentStatus,
    },
    /// Metadata for a magnet add became available.
    MetadataReceived {
        /// Torrent the metadata belongs to.
        hash: InfoHash,
        /// Bencoded metainfo, ready to write to a sidecar file.
        metainfo: Vec<u8>,
    },
    /// Resume data was generated for a torrent.
    SaveResumeData {
        /// Torrent the blob belongs to.
        hash: InfoHash,
        /// Serialised fast-resume payload.
        resume_data: Vec<u8>,
    },
    /// Resume-data generation failed.
    SaveResumeDataFailed {
        /// Torrent the failure belongs to.
        hash: InfoHash,
        /// Failure detail.
        message: String,
    },
    /// A listener socket came up.
    ListenSucceeded {
        /// Bound address literal.
        address: String,
        /// Bound port.
        port: u16,
        /// Socket transport.
        protocol: ListenProtocol,
    },
    /// A listener socket failed to bind.
    ListenFailed {
        /// Address literal that failed.
        address: String,
        /// Port that failed.
        port: u16,
        /// Failure detail.
        message: String,
        /// Socket transport.
        protocol: ListenProtocol,
    },
    /// Disk I/O failed for a torrent.
    FileError {
        /// Affected torrent.
        hash: InfoHash,
        /// Failure detail.
        message: String,
    },
    /// A tracker announce failed.
    TrackerError {
        /// Affected torrent.
        hash: InfoHash,
        /// Failure detail.
        message: String,
    },
    /// A port-mapping (UPnP/NAT-PMP) request failed.
    PortmapError {
        /// Failure detail.
        message: String,
    },
    /// A storage move finished.
    StorageMoved {
        /// Moved torrent.
        hash: InfoHash,
        /// New save path.
        path: PathBuf,
    },
    /// A storage move failed.
    StorageMoveFailed {
        /// Affected torrent.
        hash: InfoHash,
        /// Failure detail.
        message: String,
    },
    /// Fast-resume data was rejected at torrent startup.
    FastresumeRejected {
        /// Affected torrent.
        hash: InfoHash,
        /// Failure detail.
        message: String,
    },
    /// An asynchronous add failed inside the session.
    TorrentAddFailed {
        /// Torrent that could not be added.
        hash: InfoHash,
        /// Failure detail.
        message: String,
    },
}

/// The opaque BitTorrent session the core drives.
///
/// Mutating operations run on the engine task, which owns the backend
/// exclusively; reads are cheap synchronous lookups. `add_torrent` decodes
/// the source eagerly so the caller learns the infohash (and any
/// `InvalidSource` failure) synchronously, while the actual admission
/// completes asynchronously via alerts.
#[async_trait]
pub trait SessionBackend: Send {
    /// Apply the `Some` fields of a settings pack.
    async fn apply_settings(&mut self, pack: &SettingsPack) -> anyhow::Result<()>;

    /// Decode and schedule a torrent add, returning its infohash.
    async fn add_torrent(&mut self, params: AddTorrentParams) -> Result<InfoHash, SessionError>;

    /// Remove a torrent, optionally deleting payload data.
    async fn remove_torrent(&mut self, hash: &InfoHash, delete_data: bool) -> anyhow::Result<()>;

    /// Hashes of every torrent the session holds.
    fn torrent_hashes(&self) -> Vec<InfoHash>;

    /// Whether the session holds `hash`.
    fn contains(&self, hash: &InfoHash) -> bool;

    /// Resume a paused torrent; `now` bypasses queue limits.
    async fn resume_torrent(&mut self, hash: &InfoHash, now: bool) -> anyhow::Result<()>;

    /// Pause a torrent.
    async fn pause_torrent(&mut self, hash: &InfoHash) -> anyhow::Result<()>;

    /// Force a full recheck of on-disk data.
    async fn recheck_torrent(&mut self, hash: &InfoHash) -> anyhow::Result<()>;

    /// Force a reannounce to all trackers.
    async fn reannounce_torrent(&mut self, hash: &InfoHash) -> anyhow::Result<()>;

    /// Reposition a torrent in the queue.
    async fn queue_move(&mut self, hash: &InfoHash, direction: QueueMove) -> anyhow::Result<()>;

    /// Set the priority of the given file indexes.
    async fn set_file_priorities(
        &mut self,
        hash: &InfoHash,
        file_indexes: &[u32],
        priority: FilePriority,
    ) -> anyhow::Result<()>;

    /// Toggle sequential download.
    async fn set_sequential(&mut self, hash: &InfoHash, enabled: bool) -> anyhow::Result<()>;

    /// Toggle super seeding.
    async fn set_super_seeding(&mut self, hash: &InfoHash, enabled: bool) -> anyhow::Result<()>;

    /// Per-torrent rate caps, bytes/sec (`0` = unlimited).
    async fn set_torrent_limits(
        &mut self,
        hash: &InfoHash,
        download: i64,
        upload: i64,
    ) -> anyhow::Result<()>;

    /// Per-torrent bandwidth priority.
    async fn set_torrent_priority(&mut self, hash: &InfoHash, priority: i32) -> anyhow::Result<()>;

    /// Begin moving a torrent's storage to `path`.
    async fn move_storage(&mut self, hash: &InfoHash, path: &Path) -> anyhow::Result<()>;

    /// Current announce list for a torrent.
    fn trackers(&self, hash: &InfoHash) -> Vec<TrackerEntry>;

    /// Replace the announce list and reannounce.
    async fn replace_trackers(
        &mut self,
        hash: &InfoHash,
        entries: Vec<TrackerEntry>,
    ) -> anyhow::Result<()>;

    /// Live detail (files, trackers, peers) for a torrent.
    fn detail(&self, hash: &InfoHash) -> Option<TorrentDetail>;

    /// Install an IP filter, replacing any previous one.
    async fn set_ip_filter(&mut self, filter: IpFilter) -> anyhow::Result<()>;

    /// Serialise session state (DHT table and friends) for persistence.
    async fn save_state(&mut self) -> anyhow::Result<Vec<u8>>;

    /// Ask the backend to generate resume data for a torrent.
    async fn request_resume_data(&mut self, hash: &InfoHash) -> anyhow::Result<()>;

    /// Session-wide transfer counters.
    fn totals(&self) -> SessionTotals;

    /// Request a `StateUpdate` alert on the next drain.
    fn post_status_updates(&mut self);

    /// Drain up to `max` pending alerts.
    fn pop_alerts(&mut self, max: usize) -> Vec<Alert>;
}
