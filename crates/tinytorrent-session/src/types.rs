use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::hash::InfoHash;

/// How a torrent is handed to the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TorrentSource {
    /// A magnet URI to resolve.
    Magnet {
        /// The full `magnet:?xt=urn:btih:…` URI.
        uri: String,
    },
    /// Raw bencoded metainfo bytes.
    Metainfo {
        /// The `.torrent` file contents.
        bytes: Vec<u8>,
    },
}

/// Parameters for admitting a torrent into the session.
#[derive(Debug, Clone)]
pub struct AddTorrentParams {
    /// Magnet or metainfo payload.
    pub source: TorrentSource,
    /// Directory the payload is written into.
    pub save_path: PathBuf,
    /// Start the torrent paused.
    pub paused: bool,
    /// Fast-resume blob from a previous run, when available.
    pub resume_data: Option<Vec<u8>>,
}

/// Lifecycle state reported by the backend for a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TorrentState {
    /// Verifying on-disk payload against piece hashes.
    CheckingFiles,
    /// Fetching metadata for a magnet add.
    DownloadingMetadata,
    /// Actively downloading payload.
    Downloading,
    /// Download complete, not all files seeded yet.
    Finished,
    /// Seeding the complete payload.
    Seeding,
    /// Validating fast-resume data.
    CheckingResumeData,
    /// Any state the backend does not map.
    Unknown,
}

impl TorrentState {
    /// Kebab-case tag used in snapshots.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CheckingFiles => "checking-files",
            Self::DownloadingMetadata => "downloading-metadata",
            Self::Downloading => "downloading",
            Self::Finished => "finished",
            Self::Seeding => "seeding",
            Self::CheckingResumeData => "checking-resume-data",
            Self::Unknown => "unknown",
        }
    }
}

/// Point-in-time status of one torrent, as delivered by state-update alerts.
#[derive(Debug, Clone)]
pub struct TorrentStatus {
    /// Identity of the torrent.
    pub info_hash: InfoHash,
    /// Display name; empty until metadata is known.
    pub name: String,
    /// Lifecycle state.
    pub state: TorrentState,
    /// Completion fraction in `[0, 1]`.
    pub progress: f64,
    /// Total size of all files in the torrent.
    pub total: i64,
    /// Bytes selected for download.
    pub total_wanted: i64,
    /// Bytes of the wanted set already downloaded.
    pub total_wanted_done: i64,
    /// Payload bytes downloaded this session.
    pub total_payload_download: i64,
    /// Payload bytes uploaded this session.
    pub total_payload_upload: i64,
    /// All-time downloaded bytes (ratio denominator).
    pub total_download: i64,
    /// All-time uploaded bytes (ratio numerator).
    pub total_upload: i64,
    /// Current payload download rate, bytes/sec.
    pub download_payload_rate: i64,
    /// Current payload upload rate, bytes/sec.
    pub upload_payload_rate: i64,
    /// Whether the torrent is paused.
    pub paused: bool,
    /// Whether the wanted payload finished downloading.
    pub is_finished: bool,
    /// Whether the torrent is seeding.
    pub is_seeding: bool,
    /// Sequential-download flag.
    pub sequential_download: bool,
    /// Super-seeding flag.
    pub super_seeding: bool,
    /// Position in the download queue.
    pub queue_position: i64,
    /// Connected peers.
    pub num_peers: i32,
    /// Connected seeds.
    pub num_seeds: i32,
    /// Unix seconds the torrent was added.
    pub added_time: i64,
    /// Current save path.
    pub save_path: String,
    /// Backend error string; empty when healthy.
    pub error: String,
}

impl TorrentStatus {
    /// A blank status for `hash`, used when a torrent is first admitted.
    #[must_use]
    pub fn new(hash: InfoHash) -> Self {
        Self {
            info_hash: hash,
            name: String::new(),
            state: TorrentState::DownloadingMetadata,
            progress: 0.0,
            total: 0,
            total_wanted: 0,
            total_wanted_done: 0,
            total_payload_download: 0,
            total_payload_upload: 0,
            total_download: 0,
            total_upload: 0,
            download_payload_rate: 0,
            upload_payload_rate: 0,
            paused: false,
            is_finished: false,
            is_seeding: false,
            sequential_download: false,
            super_seeding: false,
            queue_position: -1,
            num_peers: 0,
            num_seeds: 0,
            added_time: 0,
            save_path: String::new(),
            error: String::new(),
        }
    }
}

/// Session-wide transfer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionTotals {
    /// Total payload bytes uploaded since session start.
    pub uploaded: u64,
    /// Total payload bytes downloaded since session start.
    pub downloaded: u64,
}

/// Queue reposition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMove {
    /// Move to the head of the queue.
    Top,
    /// Move to the tail of the queue.
    Bottom,
    /// Move one slot toward the head.
    Up,
    /// Move one slot toward the tail.
    Down,
}

/// File download priority understood by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilePriority {
    /// Do not download the file.
    DontDownload,
    /// Default download priority.
    Default,
}

/// Per-file information exposed through torrent detail views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// Index within the torrent's file storage.
    pub index: u32,
    /// Relative path inside the payload.
    pub name: String,
    /// File size in bytes.
    pub length: u64,
    /// Bytes downloaded so far.
    pub bytes_completed: u64,
    /// Current priority.
    pub priority: FilePriority,
    /// Whether the file is selected for download.
    pub wanted: bool,
}

/// One announce entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerEntry {
    /// Announce URL.
    pub announce: String,
    /// Announce tier.
    pub tier: i32,
}

/// A connected peer, for detail views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Remote `host:port`.
    pub address: String,
    /// Client identification string.
    pub client_name: String,
    /// Download rate from this peer, bytes/sec.
    pub rate_to_client: i64,
    /// Upload rate to this peer, bytes/sec.
    pub rate_to_peer: i64,
    /// Peer's reported completion fraction.
    pub progress: f64,
}

/// Live per-torrent detail pulled from the session handle.
#[derive(Debug, Clone, Default)]
pub struct TorrentDetail {
    /// File listing; empty before metadata is known.
    pub files: Vec<FileEntry>,
    /// Current announce list.
    pub trackers: Vec<TrackerEntry>,
    /// Connected peers.
    pub peers: Vec<PeerEntry>,
    /// Piece count from the metainfo.
    pub piece_count: i32,
    /// Piece size in bytes.
    pub piece_size: i32,
}

impl TorrentDetail {
    /// An empty detail record (magnet without metadata).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Peer-connection encryption policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionMode {
    /// Accept plaintext and encrypted connections alike.
    #[default]
    Tolerated,
    /// Prefer encrypted connections where possible.
    Preferred,
    /// Refuse unencrypted connections.
    Required,
}

/// Proxy protocol selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    /// No proxy configured.
    #[default]
    None,
    /// SOCKS4 proxy.
    Socks4,
    /// SOCKS5 proxy.
    Socks5,
    /// HTTP CONNECT proxy.
    Http,
}

/// Proxy settings applied to the session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProxySpec {
    /// Protocol to use.
    pub kind: ProxyKind,
    /// Proxy host.
    pub host: String,
    /// Proxy port.
    pub port: u16,
    /// Username when authentication is enabled; empty otherwise.
    pub username: String,
    /// Password when authentication is enabled; empty otherwise.
    pub password: String,
    /// Route peer connections through the proxy as well.
    pub peer_connections: bool,
}

/// Partial settings update applied to the backend.
///
/// Only `Some` fields are touched, mirroring how the engine applies just the
/// categories a configuration update changed. Rate limits are bytes/sec with
/// `0` meaning unlimited.
#[derive(Debug, Clone, Default)]
pub struct SettingsPack {
    /// `host:port` (or `[v6]:port`) listen endpoint.
    pub listen_interface: Option<String>,
    /// Encryption policy.
    pub encryption: Option<EncryptionMode>,
    /// DHT participation.
    pub enable_dht: Option<bool>,
    /// Peer exchange.
    pub enable_pex: Option<bool>,
    /// Local service discovery.
    pub enable_lsd: Option<bool>,
    /// uTP transport.
    pub enable_utp: Option<bool>,
    /// Global download cap, bytes/sec (`0` = unlimited).
    pub download_rate_limit: Option<i64>,
    /// Global upload cap, bytes/sec (`0` = unlimited).
    pub upload_rate_limit: Option<i64>,
    /// Concurrent active downloads.
    pub download_queue_size: Option<i32>,
    /// Concurrent active seeds.
    pub seed_queue_size: Option<i32>,
    /// Whether stalled torrents consume queue slots.
    pub queue_stalled_enabled: Option<bool>,
    /// Global peer connection cap.
    pub peer_limit: Option<i32>,
    /// Per-torrent peer connection cap.
    pub peer_limit_per_torrent: Option<i32>,
    /// Proxy configuration.
    pub proxy: Option<ProxySpec>,
    /// Append `.part` to incomplete files.
    pub rename_partial_files: Option<bool>,
}

/// One address range in an IP filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRange {
    /// First address in the range, inclusive.
    pub start: IpAddr,
    /// Last address in the range, inclusive.
    pub end: IpAddr,
    /// Whether connections in the range are refused.
    pub blocked: bool,
}

/// A set of address rules applied to the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpFilter {
    /// The rule set, in file order.
    pub rules: Vec<IpRange>,
}

impl IpFilter {
    /// Number of rules held by the filter.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the filter holds no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
