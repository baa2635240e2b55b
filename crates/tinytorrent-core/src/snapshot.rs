use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tinytorrent_session::{TorrentState, TorrentStatus};

use crate::state::SessionStatistics;

/// Read view of one torrent, as exposed to RPC clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TorrentSnapshot {
    /// Stable RPC id.
    pub id: i64,
    /// Hex-encoded infohash.
    pub hash: String,
    /// Display name; the hash when metadata is unknown.
    pub name: String,
    /// Kebab-case state tag.
    pub state: String,
    /// Completion fraction in `[0, 1]`.
    pub progress: f64,
    /// Bytes selected for download.
    pub total_wanted: i64,
    /// Bytes of the wanted set already downloaded.
    pub total_done: i64,
    /// Total torrent size.
    pub total_size: i64,
    /// All-time downloaded payload bytes.
    pub downloaded: i64,
    /// All-time uploaded payload bytes.
    pub uploaded: i64,
    /// Current download rate, bytes/sec.
    pub download_rate: u64,
    /// Current upload rate, bytes/sec.
    pub upload_rate: u64,
    /// Transmission status code (0/2/4/6).
    pub status: i32,
    /// Queue position.
    pub queue_position: i64,
    /// Connected peers.
    pub peers_connected: i32,
    /// Connected seeds.
    pub seeds_connected: i32,
    /// Peers currently sending to us.
    pub peers_sending_to_us: i32,
    /// Peers currently downloading from us.
    pub peers_getting_from_us: i32,
    /// Seconds to completion; `-1` when unknown.
    pub eta: i64,
    /// Bytes of the wanted set already downloaded (Transmission field).
    pub total_wanted_done: i64,
    /// Unix seconds the torrent was added.
    pub added_time: i64,
    /// Upload/download ratio; `0` before anything was downloaded.
    pub ratio: f64,
    /// Whether the wanted payload is complete.
    pub is_finished: bool,
    /// Sequential-download flag.
    pub sequential_download: bool,
    /// Super-seeding flag.
    pub super_seeding: bool,
    /// Current save path.
    pub download_dir: String,
    /// Error string; empty when healthy.
    pub error_string: String,
    /// Bytes left of the wanted set, clamped at zero.
    pub left_until_done: i64,
    /// Size of the wanted set.
    pub size_when_done: i64,
    /// Labels attached to the torrent.
    pub labels: Vec<String>,
    /// Bandwidth priority override.
    pub bandwidth_priority: i32,
    /// Per-torrent download cap in kbps; `0` = unlimited.
    pub download_limit_kbps: i64,
    /// Per-torrent upload cap in kbps; `0` = unlimited.
    pub upload_limit_kbps: i64,
    /// Monotonic change counter.
    pub revision: u64,
}

/// The published session view swapped atomically each tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Per-torrent entries, ordered by queue position.
    pub torrents: Vec<TorrentSnapshot>,
    /// Aggregate download rate, bytes/sec.
    pub download_rate: u64,
    /// Aggregate upload rate, bytes/sec.
    pub upload_rate: u64,
    /// Total torrent count.
    pub torrent_count: usize,
    /// Count of unpaused torrents.
    pub active_torrent_count: usize,
    /// Count of paused torrents.
    pub paused_torrent_count: usize,
    /// Effective listen endpoint after the last successful bind.
    pub listen_interface: Option<String>,
    /// Listen/portmap failure, cleared by the next successful bind.
    pub listen_error: Option<String>,
    /// All-time statistics.
    pub cumulative_stats: SessionStatistics,
    /// Statistics for this daemon run.
    pub current_stats: SessionStatistics,
}

impl SessionSnapshot {
    /// Entry for `id`, if present.
    #[must_use]
    pub fn torrent(&self, id: i64) -> Option<&TorrentSnapshot> {
        self.torrents.iter().find(|entry| entry.id == id)
    }
}

/// Holder for the published snapshot; readers never block.
#[derive(Debug)]
pub struct SnapshotCell {
    inner: ArcSwap<SessionSnapshot>,
}

impl SnapshotCell {
    /// A cell holding an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(SessionSnapshot::default()),
        }
    }

    /// The current snapshot.
    #[must_use]
    pub fn load(&self) -> Arc<SessionSnapshot> {
        self.inner.load_full()
    }

    /// Publish a new snapshot.
    pub fn store(&self, snapshot: SessionSnapshot) {
        self.inner.store(Arc::new(snapshot));
    }
}

impl Default for SnapshotCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Transmission status code: paused wins, then the state decides.
#[must_use]
pub const fn transmission_status(status: &TorrentStatus) -> i32 {
    if status.paused {
        return 0;
    }
    match status.state {
        TorrentState::CheckingFiles | TorrentState::CheckingResumeData => 2,
        TorrentState::DownloadingMetadata | TorrentState::Downloading => 4,
        TorrentState::Finished | TorrentState::Seeding => 6,
        TorrentState::Unknown => 0,
    }
}

/// Seconds until the wanted set completes; `-1` when the rate is zero.
#[must_use]
pub const fn estimate_eta(status: &TorrentStatus) -> i64 {
    if status.download_payload_rate <= 0 {
        return -1;
    }
    let remaining = status.total_wanted - status.total_wanted_done;
    if remaining <= 0 {
        return 0;
    }
    (remaining + status.download_payload_rate - 1) / status.download_payload_rate
}

/// Cosmetic extras folded into a torrent snapshot alongside the status.
#[derive(Debug, Clone, Default)]
pub struct SnapshotExtras {
    /// Labels from the persistence cache.
    pub labels: Vec<String>,
    /// Bandwidth priority override.
    pub bandwidth_priority: i32,
    /// Per-torrent caps in kbps.
    pub bandwidth_limits: (i64, i64),
    /// Error override recorded from alerts; wins over the backend string.
    pub error_override: Option<String>,
}

/// Build one torrent snapshot from a backend status.
#[must_use]
pub fn build_torrent_snapshot(
    id: i64,
    status: &TorrentStatus,
    revision: u64,
    extras: SnapshotExtras,
) -> TorrentSnapshot {
    let hash = status.info_hash.to_hex();
    let name = if status.name.is_empty() {
        hash.clone()
    } else {
        status.name.clone()
    };
    let ratio = if status.total_download > 0 {
        status.total_upload as f64 / status.total_download as f64
    } else {
        0.0
    };
    let error_string = extras
        .error_override
        .unwrap_or_else(|| status.error.clone());
    TorrentSnapshot {
        id,
        hash,
        name,
        state: status.state.as_str().to_string(),
        progress: status.progress,
        total_wanted: status.total_wanted,
        total_done: status.total_wanted_done,
        total_size: status.total,
        downloaded: status.total_payload_download,
        uploaded: status.total_payload_upload,
        download_rate: status.download_payload_rate.max(0).unsigned_abs(),
        upload_rate: status.upload_payload_rate.max(0).unsigned_abs(),
        status: transmission_status(status),
        queue_position: status.queue_position,
        peers_connected: status.num_peers,
        seeds_connected: status.num_seeds,
        peers_sending_to_us: status.num_seeds,
        peers_getting_from_us: (status.num_peers - status.num_seeds).max(0),
        eta: estimate_eta(status),
        total_wanted_done: status.total_wanted_done,
        added_time: status.added_time,
        ratio,
        is_finished: status.is_finished,
        sequential_download: status.sequential_download,
        super_seeding: status.super_seeding,
        download_dir: status.save_path.clone(),
        error_string,
        left_until_done: (status.total_wanted - status.total_wanted_done).max(0),
        size_when_done: status.total_wanted,
        labels: extras.labels,
        bandwidth_priority: extras.bandwidth_priority,
        download_limit_kbps: extras.bandwidth_limits.0,
        upload_limit_kbps: extras.bandwidth_limits.1,
        revision,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tinytorrent_session::InfoHash;

    fn status() -> TorrentStatus {
        let mut status = TorrentStatus::new(InfoHash::from_bytes([7; 20]));
        status.state = TorrentState::Downloading;
        status.total_wanted = 1_000;
        status.total_wanted_done = 400;
        status.download_payload_rate = 100;
        status
    }

    #[test]
    fn status_mapping_matches_transmission() {
        let mut s = status();
        assert_eq!(transmission_status(&s), 4);
        s.state = TorrentState::CheckingFiles;
        assert_eq!(transmission_status(&s), 2);
        s.state = TorrentState::Seeding;
        assert_eq!(transmission_status(&s), 6);
        s.state = TorrentState::Unknown;
        assert_eq!(transmission_status(&s), 0);
        s.state = TorrentState::Seeding;
        s.paused = true;
        assert_eq!(transmission_status(&s), 0, "paused wins over state");
    }

    #[test]
    fn eta_rounds_up_and_handles_zero_rate() {
        let mut s = status();
        assert_eq!(estimate_eta(&s), 6, "600 remaining at 100 B/s");
        s.total_wanted_done = 401;
        assert_eq!(estimate_eta(&s), 6, "ceiling division");
        s.download_payload_rate = 0;
        assert_eq!(estimate_eta(&s), -1);
        s.download_payload_rate = 100;
        s.total_wanted_done = 1_000;
        assert_eq!(estimate_eta(&s), 0);
    }

    #[test]
    fn snapshot_carries_overrides() {
        let s = status();
        let snapshot = build_torrent_snapshot(
            3,
            &s,
            9,
            SnapshotExtras {
                labels: vec!["linux".to_string()],
                bandwidth_priority: 1,
                bandwidth_limits: (800, 100),
                error_override: Some("tracker: timed out".to_string()),
            },
        );
        assert_eq!(snapshot.id, 3);
        assert_eq!(snapshot.revision, 9);
        assert_eq!(snapshot.name, snapshot.hash, "empty name falls back to hash");
        assert_eq!(snapshot.error_string, "tracker: timed out");
        assert_eq!(snapshot.labels, vec!["linux".to_string()]);
        assert_eq!(snapshot.left_until_done, 600);
        assert_eq!(snapshot.ratio, 0.0);
    }

    #[test]
    fn cell_swaps_snapshots_atomically() {
        let cell = SnapshotCell::new();
        assert_eq!(cell.load().torrent_count, 0);
        cell.store(SessionSnapshot {
            torrent_count: 2,
            ..SessionSnapshot::default()
        });
        assert_eq!(cell.load().torrent_count, 2);
    }
}
