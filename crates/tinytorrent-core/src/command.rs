use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tinytorrent_session::{
    FileEntry, IpFilter, PeerEntry, QueueMove, TrackerEntry,
};
use tokio::sync::oneshot;

use crate::automation::WatchEntry;
use crate::error::CoreError;
use crate::history::HistoryBucket;
use crate::policy::SeedLimitUpdate;
use crate::settings::SessionUpdate;
use crate::snapshot::TorrentSnapshot;

/// Engine command queue depth; senders block when it is full.
pub const COMMAND_QUEUE_CAPACITY: usize = 4_096;

/// Outcome of an add-torrent command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddStatus {
    /// Accepted; a persistence row exists and the session add is queued.
    Ok,
    /// The magnet URI or metainfo could not be decoded.
    InvalidUri,
    /// The save path could not be created.
    InvalidPath,
}

/// An add-torrent request from RPC or the watch directory.
#[derive(Debug, Clone, Default)]
pub struct TorrentAddRequest {
    /// Magnet URI, when adding by magnet.
    pub uri: Option<String>,
    /// Raw metainfo, when adding from a `.torrent` file.
    pub metainfo: Vec<u8>,
    /// Save path override; the configured paths apply when empty.
    pub download_path: Option<PathBuf>,
    /// Add the torrent paused.
    pub paused: bool,
    /// Labels to attach on admission.
    pub labels: Vec<String>,
}

/// Announce-list edit carried by the tracker commands.
#[derive(Debug, Clone)]
pub enum TrackerUpdate {
    /// Append announce URLs that are not present yet.
    Add(Vec<String>),
    /// Remove announce URLs.
    Remove(Vec<String>),
    /// Replace the whole announce list.
    Replace(Vec<TrackerEntry>),
}

/// Detail view for one torrent, combining the snapshot with live session
/// data.
#[derive(Debug, Clone, Default)]
pub struct TorrentDetailView {
    /// Snapshot entry of the torrent.
    pub summary: TorrentSnapshot,
    /// Per-file listing.
    pub files: Vec<FileEntry>,
    /// Announce list.
    pub trackers: Vec<TrackerEntry>,
    /// Connected peers.
    pub peers: Vec<PeerEntry>,
    /// Piece count from the metainfo.
    pub piece_count: i32,
    /// Piece size in bytes.
    pub piece_size: i32,
}

type Reply<T> = oneshot::Sender<T>;

/// Commands processed by the engine task, in FIFO order.
pub(crate) enum EngineCommand {
    AddTorrent {
        request: TorrentAddRequest,
        reply: Reply<Result<AddStatus, CoreError>>,
    },
    Remove {
        ids: Vec<i64>,
        delete_data: bool,
    },
    Start {
        ids: Vec<i64>,
        now: bool,
    },
    Stop {
        ids: Vec<i64>,
    },
    Verify {
        ids: Vec<i64>,
    },
    Reannounce {
        ids: Vec<i64>,
    },
    QueueMove {
        ids: Vec<i64>,
        direction: QueueMove,
    },
    ToggleFileSelection {
        ids: Vec<i64>,
        file_indexes: Vec<u32>,
        wanted: bool,
    },
    SetSequential {
        ids: Vec<i64>,
        enabled: bool,
    },
    SetSuperSeeding {
        ids: Vec<i64>,
        enabled: bool,
    },
    MoveLocation {
        id: i64,
        path: PathBuf,
        move_data: bool,
        reply: Reply<Result<(), CoreError>>,
    },
    UpdateSettings {
        update: Box<SessionUpdate>,
    },
    SetDownloadPath {
        path: PathBuf,
        reply: Reply<Result<(), CoreError>>,
    },
    SetListenInterface {
        value: String,
    },
    SetListenPort {
        port: u16,
    },
    EditTrackers {
        ids: Vec<i64>,
        update: TrackerUpdate,
    },
    SetSeedLimits {
        ids: Vec<i64>,
        update: SeedLimitUpdate,
    },
    SetBandwidthPriority {
        ids: Vec<i64>,
        priority: i32,
    },
    SetBandwidthLimits {
        ids: Vec<i64>,
        download_kbps: i64,
        upload_kbps: i64,
    },
    SetLabels {
        ids: Vec<i64>,
        labels: Vec<String>,
    },
    ReloadBlocklist {
        reply: Reply<bool>,
    },
    HistoryQuery {
        start: i64,
        end: i64,
        step: i64,
        reply: Reply<Vec<HistoryBucket>>,
    },
    HistoryClear {
        older_than: Option<i64>,
        reply: Reply<bool>,
    },
    TorrentDetail {
        id: i64,
        reply: Reply<Option<TorrentDetailView>>,
    },

    // Internal continuations from the I/O service.
    WatchEntriesCollected {
        entries: Vec<WatchEntry>,
        collected_at: Instant,
    },
    WatchFilesLoaded {
        files: Vec<(WatchEntry, Vec<u8>)>,
    },
    MetadataSidecarWritten {
        hash: tinytorrent_session::InfoHash,
        path: PathBuf,
    },
    ExecuteCompletionMove {
        hash: tinytorrent_session::InfoHash,
        destination: PathBuf,
    },
    ApplyBlocklist {
        filter: IpFilter,
        entries: usize,
        reply: Option<Reply<bool>>,
    },
}
