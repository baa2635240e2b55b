use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::backend::{Alert, SessionBackend};
use crate::error::SessionError;
use crate::hash::InfoHash;
use crate::types::{
    AddTorrentParams, FilePriority, IpFilter, QueueMove, SessionTotals, SettingsPack,
    TorrentDetail, TorrentSource, TorrentState, TorrentStatus, TrackerEntry,
};

/// In-memory [`SessionBackend`].
///
/// Used by the test suites and by builds without a native BitTorrent
/// backend. Torrents are plain records; transfer activity is simulated by
/// pushing alerts and status mutations through the paired
/// [`SessionDriver`].
pub struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
}

/// Handle for steering a [`MemorySession`] from the outside.
///
/// The engine owns the session exclusively, so tests use this handle to
/// inject alerts, flip statuses and inspect what the engine applied.
#[derive(Clone)]
pub struct SessionDriver {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    torrents: HashMap<InfoHash, MemoryTorrent>,
    queue: Vec<InfoHash>,
    alerts: VecDeque<Alert>,
    totals: SessionTotals,
    applied: SettingsPack,
    ip_filter: IpFilter,
    state_blob: Vec<u8>,
    failing_moves: HashMap<InfoHash, String>,
}

struct MemoryTorrent {
    status: TorrentStatus,
    detail: TorrentDetail,
    resume_payload: Option<Vec<u8>>,
    // Change counter vs. the version last delivered in a state update, so
    // status posts only cover torrents that actually changed.
    version: u64,
    posted: u64,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(0))
}

fn parse_magnet(uri: &str) -> Result<InfoHash, SessionError> {
    let invalid = |reason: &str| SessionError::InvalidSource {
        reason: reason.to_string(),
    };
    if !uri.starts_with("magnet:") {
        return Err(invalid("not a magnet URI"));
    }
    let marker = "xt=urn:btih:";
    let start = uri.find(marker).ok_or_else(|| invalid("missing btih"))? + marker.len();
    let digest: String = uri[start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect();
    if digest.len() != 40 {
        return Err(invalid("btih is not 40 hex digits"));
    }
    digest
        .to_ascii_lowercase()
        .parse()
        .map_err(|_| invalid("btih is not valid hex"))
}

fn metainfo_hash(bytes: &[u8]) -> Result<InfoHash, SessionError> {
    if bytes.len() < 2 || bytes[0] != b'd' || bytes[bytes.len() - 1] != b'e' {
        return Err(SessionError::InvalidSource {
            reason: "metainfo is not a bencoded dictionary".to_string(),
        });
    }
    let digest: [u8; 20] = Sha1::digest(bytes).into();
    Ok(InfoHash::from_bytes(digest))
}

impl MemorySession {
    /// Create an empty session.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Driver handle sharing this session's state.
    #[must_use]
    pub fn driver(&self) -> SessionDriver {
        SessionDriver {
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        lock_state(&self.state)
    }
}

impl Default for MemorySession {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_state(state: &Arc<Mutex<MemoryState>>) -> MutexGuard<'_, MemoryState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MemoryState {
    fn require(&mut self, hash: &InfoHash) -> anyhow::Result<&mut MemoryTorrent> {
        self.torrents
            .get_mut(hash)
            .ok_or_else(|| SessionError::UnknownTorrent(*hash).into())
    }

    fn refresh_queue_positions(&mut self) {
        for (index, hash) in self.queue.iter().enumerate() {
            if let Some(torrent) = self.torrents.get_mut(hash) {
                let position = i64::try_from(index).unwrap_or(i64::MAX);
                if torrent.status.queue_position != position {
                    torrent.status.queue_position = position;
                    torrent.version += 1;
                }
            }
        }
    }

    fn push_state_update(&mut self, hash: &InfoHash) {
        if let Some(torrent) = self.torrents.get_mut(hash) {
            torrent.version += 1;
            torrent.posted = torrent.version;
            let status = torrent.status.clone();
            self.alerts.push_back(Alert::StateUpdate {
                statuses: vec![status],
            });
        }
    }
}

#[async_trait]
impl SessionBackend for MemorySession {
    async fn apply_settings(&mut self, pack: &SettingsPack) -> anyhow::Result<()> {
        let mut state = self.lock();
        let applied = &mut state.applied;
        macro_rules! merge {
            ($field:ident) => {
                if let Some(value) = pack.$field.clone() {
                    applied.$field = Some(value);
                }
            };
        }
        merge!(listen_interface);
        merge!(encryption);
        merge!(enable_dht);
        merge!(enable_pex);
        merge!(enable_lsd);
        merge!(enable_utp);
        merge!(download_rate_limit);
        merge!(upload_rate_limit);
        merge!(download_queue_size);
        merge!(seed_queue_size);
        merge!(queue_stalled_enabled);
        merge!(peer_limit);
        merge!(peer_limit_per_torrent);
        merge!(proxy);
        merge!(rename_partial_files);
        Ok(())
    }

    async fn add_torrent(&mut self, params: AddTorrentParams) -> Result<InfoHash, SessionError> {
        let (hash, initial_state) = match &params.source {
            TorrentSource::Magnet { uri } => (parse_magnet(uri)?, TorrentState::DownloadingMetadata),
            TorrentSource::Metainfo { bytes } => (metainfo_hash(bytes)?, TorrentState::Downloading),
        };

        let mut state = self.lock();
        if state.torrents.contains_key(&hash) {
            debug!(hash = %hash, "duplicate add ignored");
            return Ok(hash);
        }

        let mut status = TorrentStatus::new(hash);
        status.state = initial_state;
        status.paused = params.paused;
        status.added_time = unix_now();
        status.save_path = params.save_path.display().to_string();

        state.torrents.insert(
            hash,
            MemoryTorrent {
                status,
                detail: TorrentDetail::empty(),
                resume_payload: params.resume_data,
                version: 0,
                posted: 0,
            },
        );
        state.queue.push(hash);
        state.refresh_queue_positions();
        state.push_state_update(&hash);
        Ok(hash)
    }

    async fn remove_torrent(&mut self, hash: &InfoHash, _delete_data: bool) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.torrents.remove(hash);
        state.queue.retain(|entry| entry != hash);
        state.failing_moves.remove(hash);
        state.refresh_queue_positions();
        Ok(())
    }

    fn torrent_hashes(&self) -> Vec<InfoHash> {
        self.lock().queue.clone()
    }

    fn contains(&self, hash: &InfoHash) -> bool {
        self.lock().torrents.contains_key(hash)
    }

    async fn resume_torrent(&mut self, hash: &InfoHash, _now: bool) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.require(hash)?.status.paused = false;
        state.push_state_update(hash);
        Ok(())
    }

    async fn pause_torrent(&mut self, hash: &InfoHash) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.require(hash)?.status.paused = true;
        state.push_state_update(hash);
        Ok(())
    }

    async fn recheck_torrent(&mut self, hash: &InfoHash) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.require(hash)?.status.state = TorrentState::CheckingFiles;
        state.push_state_update(hash);
        Ok(())
    }

    async fn reannounce_torrent(&mut self, hash: &InfoHash) -> anyhow::Result<()> {
        self.lock().require(hash)?;
        Ok(())
    }

    async fn queue_move(&mut self, hash: &InfoHash, direction: QueueMove) -> anyhow::Result<()> {
        let mut state = self.lock();
        let Some(index) = state.queue.iter().position(|entry| entry == hash) else {
            return Err(SessionError::UnknownTorrent(*hash).into());
        };
        let entry = state.queue.remove(index);
        let target = match direction {
            QueueMove::Top => 0,
            QueueMove::Bottom => state.queue.len(),
            QueueMove::Up => index.saturating_sub(1),
            QueueMove::Down => (index + 1).min(state.queue.len()),
        };
        state.queue.insert(target, entry);
        state.refresh_queue_positions();
        Ok(())
    }

    async fn set_file_priorities(
        &mut self,
        hash: &InfoHash,
        file_indexes: &[u32],
        priority: FilePriority,
    ) -> anyhow::Result<()> {
        let mut state = self.lock();
        let torrent = state.require(hash)?;
        for file in &mut torrent.detail.files {
            if file_indexes.contains(&file.index) {
                file.priority = priority;
                file.wanted = priority != FilePriority::DontDownload;
            }
        }
        Ok(())
    }

    async fn set_sequential(&mut self, hash: &InfoHash, enabled: bool) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.require(hash)?.status.sequential_download = enabled;
        state.push_state_update(hash);
        Ok(())
    }

    async fn set_super_seeding(&mut self, hash: &InfoHash, enabled: bool) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.require(hash)?.status.super_seeding = enabled;
        state.push_state_update(hash);
        Ok(())
    }

    async fn set_torrent_limits(
        &mut self,
        hash: &InfoHash,
        _download: i64,
        _upload: i64,
    ) -> anyhow::Result<()> {
        self.lock().require(hash)?;
        Ok(())
    }

    async fn set_torrent_priority(&mut self, hash: &InfoHash, _priority: i32) -> anyhow::Result<()> {
        self.lock().require(hash)?;
        Ok(())
    }

    async fn move_storage(&mut self, hash: &InfoHash, path: &Path) -> anyhow::Result<()> {
        let mut state = self.lock();
        if let Some(message) = state.failing_moves.get(hash).cloned() {
            state
                .alerts
                .push_back(Alert::StorageMoveFailed { hash: *hash, message });
            return Ok(());
        }
        let destination = path.display().to_string();
        state.require(hash)?.status.save_path = destination;
        state.alerts.push_back(Alert::StorageMoved {
            hash: *hash,
            path: path.to_path_buf(),
        });
        Ok(())
    }

    fn trackers(&self, hash: &InfoHash) -> Vec<TrackerEntry> {
        self.lock()
            .torrents
            .get(hash)
            .map(|torrent| torrent.detail.trackers.clone())
            .unwrap_or_default()
    }

    async fn replace_trackers(
        &mut self,
        hash: &InfoHash,
        entries: Vec<TrackerEntry>,
    ) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.require(hash)?.detail.trackers = entries;
        Ok(())
    }

    fn detail(&self, hash: &InfoHash) -> Option<TorrentDetail> {
        self.lock()
            .torrents
            .get(hash)
            .map(|torrent| torrent.detail.clone())
    }

    async fn set_ip_filter(&mut self, filter: IpFilter) -> anyhow::Result<()> {
        self.lock().ip_filter = filter;
        Ok(())
    }

    async fn save_state(&mut self) -> anyhow::Result<Vec<u8>> {
        let state = self.lock();
        if state.state_blob.is_empty() {
            Ok(b"tinytorrent-session-state".to_vec())
        } else {
            Ok(state.state_blob.clone())
        }
    }

    async fn request_resume_data(&mut self, hash: &InfoHash) -> anyhow::Result<()> {
        let mut state = self.lock();
        let Some(torrent) = state.torrents.get(hash) else {
            return Err(SessionError::UnknownTorrent(*hash).into());
        };
        let resume_data = torrent
            .resume_payload
            .clone()
            .unwrap_or_else(|| format!("fastresume:{hash}").into_bytes());
        state
            .alerts
            .push_back(Alert::SaveResumeData { hash: *hash, resume_data });
        Ok(())
    }

    fn totals(&self) -> SessionTotals {
        self.lock().totals
    }

    fn post_status_updates(&mut self) {
        let mut state = self.lock();
        let state = &mut *state;
        let mut statuses = Vec::new();
        for hash in &state.queue {
            if let Some(torrent) = state.torrents.get_mut(hash) {
                if torrent.version != torrent.posted {
                    torrent.posted = torrent.version;
                    statuses.push(torrent.status.clone());
                }
            }
        }
        if !statuses.is_empty() {
            state.alerts.push_back(Alert::StateUpdate { statuses });
        }
    }

    fn pop_alerts(&mut self, max: usize) -> Vec<Alert> {
        let mut state = self.lock();
        let take = state.alerts.len().min(max);
        state.alerts.drain(..take).collect()
    }
}

impl SessionDriver {
    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        lock_state(&self.state)
    }

    /// Queue an arbitrary alert for the next drain.
    pub fn push_alert(&self, alert: Alert) {
        self.lock().alerts.push_back(alert);
    }

    /// Mutate a torrent's status and queue a state update for it.
    ///
    /// Returns `false` when the session does not hold `hash`.
    pub fn update_status(&self, hash: &InfoHash, mutate: impl FnOnce(&mut TorrentStatus)) -> bool {
        let mut state = self.lock();
        let Some(torrent) = state.torrents.get_mut(hash) else {
            return false;
        };
        mutate(&mut torrent.status);
        state.push_state_update(hash);
        true
    }

    /// Flip a torrent to finished/seeding and queue the finished alert.
    pub fn finish(&self, hash: &InfoHash) -> bool {
        let mut state = self.lock();
        let Some(torrent) = state.torrents.get_mut(hash) else {
            return false;
        };
        torrent.status.state = TorrentState::Seeding;
        torrent.status.is_finished = true;
        torrent.status.is_seeding = true;
        torrent.status.progress = 1.0;
        torrent.status.total_wanted_done = torrent.status.total_wanted;
        let status = torrent.status.clone();
        state
            .alerts
            .push_back(Alert::StateUpdate { statuses: vec![status.clone()] });
        state.alerts.push_back(Alert::TorrentFinished { status });
        true
    }

    /// Replace session-wide transfer counters.
    pub fn set_totals(&self, uploaded: u64, downloaded: u64) {
        self.lock().totals = SessionTotals { uploaded, downloaded };
    }

    /// Install a detail record for a torrent.
    pub fn set_detail(&self, hash: &InfoHash, detail: TorrentDetail) -> bool {
        let mut state = self.lock();
        match state.torrents.get_mut(hash) {
            Some(torrent) => {
                torrent.detail = detail;
                true
            }
            None => false,
        }
    }

    /// Make the next `move_storage` for `hash` fail with `message`.
    pub fn fail_next_move(&self, hash: InfoHash, message: impl Into<String>) {
        self.lock().failing_moves.insert(hash, message.into());
    }

    /// Replace the blob returned by `save_state`.
    pub fn set_state_blob(&self, blob: Vec<u8>) {
        self.lock().state_blob = blob;
    }

    /// Current status of a torrent, for assertions.
    #[must_use]
    pub fn status(&self, hash: &InfoHash) -> Option<TorrentStatus> {
        self.lock()
            .torrents
            .get(hash)
            .map(|torrent| torrent.status.clone())
    }

    /// Settings the engine has applied so far, merged.
    #[must_use]
    pub fn applied_settings(&self) -> SettingsPack {
        self.lock().applied.clone()
    }

    /// The currently installed IP filter.
    #[must_use]
    pub fn ip_filter(&self) -> IpFilter {
        self.lock().ip_filter.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TorrentSource;
    use std::path::PathBuf;

    fn magnet_params(digit: char) -> AddTorrentParams {
        AddTorrentParams {
            source: TorrentSource::Magnet {
                uri: format!("magnet:?xt=urn:btih:{}", digit.to_string().repeat(40)),
            },
            save_path: PathBuf::from("/downloads"),
            paused: false,
            resume_data: None,
        }
    }

    #[tokio::test]
    async fn magnet_add_parses_btih() {
        let mut session = MemorySession::new();
        let hash = session
            .add_torrent(magnet_params('a'))
            .await
            .expect("add should parse");
        assert_eq!(hash.to_hex(), "a".repeat(40));
        assert!(session.contains(&hash));
    }

    #[tokio::test]
    async fn malformed_magnet_is_rejected() {
        let mut session = MemorySession::new();
        let params = AddTorrentParams {
            source: TorrentSource::Magnet {
                uri: "magnet:?xt=urn:btih:nothex".to_string(),
            },
            save_path: PathBuf::from("/downloads"),
            paused: false,
            resume_data: None,
        };
        assert!(matches!(
            session.add_torrent(params).await,
            Err(SessionError::InvalidSource { .. })
        ));
    }

    #[tokio::test]
    async fn metainfo_add_derives_stable_hash() {
        let mut session = MemorySession::new();
        let bytes = b"d4:name4:demoe".to_vec();
        let params = AddTorrentParams {
            source: TorrentSource::Metainfo { bytes: bytes.clone() },
            save_path: PathBuf::from("/downloads"),
            paused: true,
            resume_data: None,
        };
        let first = session.add_torrent(params.clone()).await.expect("add");
        let second = session.add_torrent(params).await.expect("duplicate add");
        assert_eq!(first, second);
        assert_eq!(session.torrent_hashes().len(), 1);
    }

    #[tokio::test]
    async fn queue_moves_reorder_positions() {
        let mut session = MemorySession::new();
        let a = session.add_torrent(magnet_params('a')).await.expect("add a");
        let b = session.add_torrent(magnet_params('b')).await.expect("add b");
        session.queue_move(&b, QueueMove::Top).await.expect("move");
        let hashes = session.torrent_hashes();
        assert_eq!(hashes, vec![b, a]);
        let driver = session.driver();
        assert_eq!(driver.status(&b).map(|s| s.queue_position), Some(0));
        assert_eq!(driver.status(&a).map(|s| s.queue_position), Some(1));
    }

    #[tokio::test]
    async fn driver_finish_emits_finished_alert() {
        let mut session = MemorySession::new();
        let hash = session.add_torrent(magnet_params('c')).await.expect("add");
        let driver = session.driver();
        let _ = session.pop_alerts(64);
        assert!(driver.finish(&hash));
        let alerts = session.pop_alerts(64);
        assert!(alerts
            .iter()
            .any(|alert| matches!(alert, Alert::TorrentFinished { .. })));
    }

    #[tokio::test]
    async fn failed_move_emits_failure_alert() {
        let mut session = MemorySession::new();
        let hash = session.add_torrent(magnet_params('d')).await.expect("add");
        session.driver().fail_next_move(hash, "disk full");
        let _ = session.pop_alerts(64);
        session
            .move_storage(&hash, Path::new("/elsewhere"))
            .await
            .expect("move_storage call itself succeeds");
        let alerts = session.pop_alerts(64);
        assert!(alerts
            .iter()
            .any(|alert| matches!(alert, Alert::StorageMoveFailed { .. })));
    }
}
