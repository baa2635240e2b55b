use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use tinytorrent_data::{DataError, SessionStatisticsRow, StateStore, TorrentRow};
use tinytorrent_session::InfoHash;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Depth of the write-behind queue feeding the persistence worker.
const WRITE_QUEUE: usize = 1_024;

/// In-memory image of a persisted torrent.
///
/// Blobs (metainfo, resume data) are deliberately absent: they are written
/// through to the store and only read back during startup replay.
#[derive(Debug, Clone, Default)]
pub struct CachedTorrent {
    /// Magnet URI when the torrent was added by magnet.
    pub magnet_uri: Option<String>,
    /// Last known save path.
    pub save_path: String,
    /// Paused flag as persisted.
    pub paused: bool,
    /// Labels attached to the torrent.
    pub labels: Vec<String>,
    /// Unix seconds the torrent was first added.
    pub added_at: i64,
    /// Stable RPC id.
    pub rpc_id: i64,
    /// Metadata sidecar path once a magnet resolved.
    pub metadata_path: Option<PathBuf>,
}

impl CachedTorrent {
    fn from_row(row: &TorrentRow) -> Self {
        Self {
            magnet_uri: row.magnet_uri.clone(),
            save_path: row.save_path.clone(),
            paused: row.paused,
            labels: row.label_list(),
            added_at: row.added_at,
            rpc_id: row.rpc_id,
            metadata_path: row.metadata_path.clone().map(PathBuf::from),
        }
    }
}

enum WriteOp {
    Upsert(Box<TorrentRow>),
    Delete(String),
    RpcId(String, i64),
    SavePath(String, String),
    Labels(String, String),
    Paused(String, bool),
    Metadata { hash: String, path: String },
    ResumeData(String, Vec<u8>),
    Settings(Vec<(String, String)>),
    Statistics(SessionStatisticsRow),
}

/// Write-behind façade over the SQLite store.
///
/// Callers observe cache updates immediately; the actual writes drain on a
/// dedicated worker task in submission order. A failed write is logged and
/// the cache stays authoritative until the next successful flush.
pub struct PersistenceManager {
    cache: HashMap<InfoHash, CachedTorrent>,
    tx: mpsc::Sender<WriteOp>,
}

impl PersistenceManager {
    /// Load the torrent table into the cache and start the writer task.
    ///
    /// Returns the manager, the full rows for session replay (the cache
    /// itself drops the blobs), and the writer's join handle.
    ///
    /// # Errors
    ///
    /// Returns an error when the initial load fails.
    pub async fn load(
        store: StateStore,
    ) -> Result<(Self, Vec<TorrentRow>, JoinHandle<()>), DataError> {
        let rows = store.load_torrents().await?;
        let mut cache = HashMap::with_capacity(rows.len());
        for row in &rows {
            if let Ok(hash) = row.info_hash.parse::<InfoHash>() {
                cache.insert(hash, CachedTorrent::from_row(row));
            } else {
                warn!(info_hash = %row.info_hash, "skipping torrent row with bad hash");
            }
        }
        let (tx, rx) = mpsc::channel(WRITE_QUEUE);
        let join = tokio::spawn(writer_loop(store, rx));
        Ok((Self { cache, tx }, rows, join))
    }

    /// Insert or replace a torrent, updating the cache immediately.
    pub async fn add_or_update(&mut self, hash: InfoHash, row: TorrentRow) {
        self.cache.insert(hash, CachedTorrent::from_row(&row));
        self.send(WriteOp::Upsert(Box::new(row))).await;
    }

    /// Remove a torrent, returning its cached image (for sidecar cleanup).
    pub async fn remove(&mut self, hash: &InfoHash) -> Option<CachedTorrent> {
        let cached = self.cache.remove(hash);
        self.send(WriteOp::Delete(hash.to_hex())).await;
        cached
    }

    /// Record an id assignment.
    pub async fn update_rpc_id(&mut self, hash: &InfoHash, rpc_id: i64) {
        if let Some(cached) = self.cache.get_mut(hash) {
            cached.rpc_id = rpc_id;
        }
        self.send(WriteOp::RpcId(hash.to_hex(), rpc_id)).await;
    }

    /// Record a new save path.
    pub async fn update_save_path(&mut self, hash: &InfoHash, save_path: &str) {
        if let Some(cached) = self.cache.get_mut(hash) {
            cached.save_path = save_path.to_string();
        }
        self.send(WriteOp::SavePath(hash.to_hex(), save_path.to_string()))
            .await;
    }

    /// Replace a torrent's labels.
    pub async fn set_labels(&mut self, hash: &InfoHash, labels: Vec<String>) {
        let json = serde_json::to_string(&labels).unwrap_or_else(|_| "[]".to_string());
        if let Some(cached) = self.cache.get_mut(hash) {
            cached.labels = labels;
        }
        self.send(WriteOp::Labels(hash.to_hex(), json)).await;
    }

    /// Record the paused flag.
    pub async fn set_paused(&mut self, hash: &InfoHash, paused: bool) {
        if let Some(cached) = self.cache.get_mut(hash) {
            cached.paused = paused;
        }
        self.send(WriteOp::Paused(hash.to_hex(), paused)).await;
    }

    /// Record a freshly written metadata sidecar.
    pub async fn update_metadata(&mut self, hash: &InfoHash, path: &Path) {
        if let Some(cached) = self.cache.get_mut(hash) {
            cached.metadata_path = Some(path.to_path_buf());
            cached.magnet_uri = None;
        }
        self.send(WriteOp::Metadata {
            hash: hash.to_hex(),
            path: path.display().to_string(),
        })
        .await;
    }

    /// Replace a torrent's resume blob.
    pub async fn update_resume_data(&mut self, hash: &InfoHash, resume_data: Vec<u8>) {
        self.send(WriteOp::ResumeData(hash.to_hex(), resume_data))
            .await;
    }

    /// Persist the full settings key set.
    pub async fn persist_settings(&self, entries: Vec<(&'static str, String)>) {
        let owned = entries
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        self.send(WriteOp::Settings(owned)).await;
    }

    /// Persist the cumulative statistics.
    pub async fn persist_statistics(&self, stats: SessionStatisticsRow) {
        self.send(WriteOp::Statistics(stats)).await;
    }

    /// Labels for a torrent, from cache.
    #[must_use]
    pub fn labels(&self, hash: &InfoHash) -> Vec<String> {
        self.cache
            .get(hash)
            .map(|cached| cached.labels.clone())
            .unwrap_or_default()
    }

    /// Cached image for a torrent.
    #[must_use]
    pub fn get(&self, hash: &InfoHash) -> Option<&CachedTorrent> {
        self.cache.get(hash)
    }

    /// Whether a torrent is cached.
    #[must_use]
    pub fn contains(&self, hash: &InfoHash) -> bool {
        self.cache.contains_key(hash)
    }

    /// Number of cached torrents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Stop accepting writes; the worker drains what was queued and ends.
    pub fn close(self) {
        drop(self.tx);
    }

    async fn send(&self, op: WriteOp) {
        if self.tx.send(op).await.is_err() {
            warn!("persistence writer gone; write dropped");
        }
    }
}

async fn writer_loop(store: StateStore, mut rx: mpsc::Receiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        if let Err(err) = apply(&store, op).await {
            warn!(error = %err, "persistence write failed; cache remains authoritative");
        }
    }
}

async fn apply(store: &StateStore, op: WriteOp) -> Result<(), DataError> {
    match op {
        WriteOp::Upsert(row) => store.upsert_torrent(&row).await,
        WriteOp::Delete(hash) => store.delete_torrent(&hash).await,
        WriteOp::RpcId(hash, id) => store.update_rpc_id(&hash, id).await,
        WriteOp::SavePath(hash, path) => store.update_save_path(&hash, &path).await,
        WriteOp::Labels(hash, labels) => store.update_labels(&hash, &labels).await,
        WriteOp::Paused(hash, paused) => store.update_paused(&hash, paused).await,
        WriteOp::Metadata { hash, path } => store.update_metadata(&hash, &path, None).await,
        WriteOp::ResumeData(hash, blob) => store.update_resume_data(&hash, &blob).await,
        WriteOp::Settings(entries) => {
            for (key, value) in entries {
                store.set_setting(&key, &value).await?;
            }
            Ok(())
        }
        WriteOp::Statistics(stats) => store.save_session_statistics(&stats).await,
    }
}

/// Write a metainfo sidecar via temp file, fsync and rename.
///
/// # Errors
///
/// Returns the underlying I/O error when any step fails.
pub fn write_metadata_sidecar(
    dir: &Path,
    hash: &InfoHash,
    metainfo: &[u8],
) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let final_path = dir.join(format!("{hash}.torrent"));
    let temp_path = dir.join(format!("{hash}.torrent.tmp"));
    {
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(metainfo)?;
        file.sync_all()?;
    }
    std::fs::rename(&temp_path, &final_path)?;
    Ok(final_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    fn hash(byte: u8) -> InfoHash {
        InfoHash::from_bytes([byte; 20])
    }

    fn row(hash: &InfoHash, rpc_id: i64) -> TorrentRow {
        TorrentRow {
            info_hash: hash.to_hex(),
            magnet_uri: Some(format!("magnet:?xt=urn:btih:{hash}")),
            save_path: "/downloads".to_string(),
            paused: false,
            labels: "[]".to_string(),
            added_at: 1_700_000_000,
            rpc_id,
            ..TorrentRow::default()
        }
    }

    async fn drain(manager: PersistenceManager, join: JoinHandle<()>) {
        manager.close();
        join.await.expect("writer ends");
    }

    #[tokio::test]
    async fn cache_updates_are_immediate_and_writes_drain() {
        let store = StateStore::open_in_memory().await.expect("store");
        let (mut manager, replayed, join) =
            PersistenceManager::load(store.clone()).await.expect("load");
        assert!(replayed.is_empty());

        let first = hash(1);
        manager.add_or_update(first, row(&first, 1)).await;
        assert!(manager.contains(&first));
        manager.set_labels(&first, vec!["iso".to_string()]).await;
        assert_eq!(manager.labels(&first), vec!["iso".to_string()]);
        manager.update_save_path(&first, "/library").await;
        assert_eq!(manager.get(&first).map(|c| c.save_path.clone()).as_deref(), Some("/library"));

        drain(manager, join).await;

        let rows = store.load_torrents().await.expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].save_path, "/library");
        assert_eq!(rows[0].label_list(), vec!["iso".to_string()]);
    }

    #[tokio::test]
    async fn reload_restores_cache_without_blobs() {
        let store = StateStore::open_in_memory().await.expect("store");
        {
            let (mut manager, _, join) =
                PersistenceManager::load(store.clone()).await.expect("load");
            let first = hash(2);
            let mut record = row(&first, 5);
            record.metainfo = Some(b"d4:infoe".to_vec());
            manager.add_or_update(first, record).await;
            manager.update_resume_data(&first, b"resume".to_vec()).await;
            drain(manager, join).await;
        }

        let (manager, replayed, join) =
            PersistenceManager::load(store.clone()).await.expect("reload");
        assert_eq!(replayed.len(), 1);
        assert!(replayed[0].metainfo.is_some(), "replay rows keep the blob");
        assert_eq!(replayed[0].resume_data.as_deref(), Some(&b"resume"[..]));
        let cached = manager.get(&hash(2)).expect("cached");
        assert_eq!(cached.rpc_id, 5);
        drain(manager, join).await;
    }

    #[tokio::test]
    async fn remove_returns_cached_image() {
        let store = StateStore::open_in_memory().await.expect("store");
        let (mut manager, _, join) = PersistenceManager::load(store.clone()).await.expect("load");
        let first = hash(3);
        manager.add_or_update(first, row(&first, 1)).await;
        let cached = manager.remove(&first).await.expect("was cached");
        assert_eq!(cached.rpc_id, 1);
        assert!(!manager.contains(&first));
        drain(manager, join).await;
        assert!(store.load_torrents().await.expect("rows").is_empty());
    }

    #[tokio::test]
    async fn writer_failures_keep_cache_authoritative() {
        let store = StateStore::open_in_memory().await.expect("store");
        let (mut manager, _, join) = PersistenceManager::load(store.clone()).await.expect("load");
        let ghost = hash(4);
        // Updating a torrent that has no row logs on the worker but the
        // cache (which also has no entry) stays consistent.
        manager.update_save_path(&ghost, "/nowhere").await;
        sleep(Duration::from_millis(10)).await;
        assert!(!manager.contains(&ghost));
        drain(manager, join).await;
    }

    #[test]
    fn sidecar_write_is_atomic_rename() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = hash(5);
        let path = write_metadata_sidecar(dir.path(), &target, b"d4:infoe").expect("write");
        assert!(path.ends_with(format!("{target}.torrent")));
        assert_eq!(std::fs::read(&path).expect("read back"), b"d4:infoe");
        assert!(
            !dir.path().join(format!("{target}.torrent.tmp")).exists(),
            "temp file renamed away"
        );
    }
}
