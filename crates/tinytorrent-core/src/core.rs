use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tinytorrent_data::StateStore;
use tinytorrent_events::EventBus;
use tinytorrent_session::{QueueMove, SessionBackend};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::command::{
    AddStatus, COMMAND_QUEUE_CAPACITY, EngineCommand, TorrentAddRequest, TorrentDetailView,
    TrackerUpdate,
};
use crate::config::ConfigurationService;
use crate::engine::{Engine, EngineSeed, Shutdown};
use crate::error::CoreError;
use crate::history::{HistoryBucket, HistoryHandle};
use crate::persistence::PersistenceManager;
use crate::policy::SeedLimitUpdate;
use crate::settings::{CoreSettings, SessionUpdate};
use crate::snapshot::{SessionSnapshot, SnapshotCell, TorrentSnapshot};
use crate::state::SessionStatistics;
use crate::tasks::IoTaskService;

/// Startup configuration for the daemon core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Directory holding the database, metadata sidecars, session state
    /// and blocklists.
    pub data_root: PathBuf,
    /// Defaults merged under the persisted settings.
    pub defaults: CoreSettings,
}

/// Handle to a running daemon core.
///
/// Cloneable-by-`Arc` by the RPC layer: reads go straight to the published
/// snapshot or the configuration service; every mutation is enqueued onto
/// the engine task and, where a result is promised, awaited through a
/// one-shot channel. Submission blocks when the 4096-entry queue is full.
pub struct Core {
    commands: mpsc::Sender<EngineCommand>,
    snapshot: Arc<SnapshotCell>,
    config: Arc<ConfigurationService>,
    bus: EventBus,
    shutdown: Arc<Shutdown>,
    engine_join: Mutex<Option<JoinHandle<()>>>,
}

impl Core {
    /// Boot the core: load persisted settings/statistics/torrents from
    /// `store`, spawn the worker tasks and the engine loop.
    ///
    /// # Errors
    ///
    /// Returns an error when the data root cannot be laid out or the
    /// initial loads fail.
    pub async fn start(
        config: CoreConfig,
        store: StateStore,
        bus: EventBus,
        backend: Box<dyn SessionBackend>,
    ) -> anyhow::Result<Self> {
        let data_root = config.data_root;
        std::fs::create_dir_all(&data_root)
            .with_context(|| format!("creating data root {}", data_root.display()))?;
        let metadata_dir = data_root.join("metadata");
        let dht_state_path = data_root.join("session.dht");
        let blocklist_dir = data_root.join("blocklists");
        std::fs::create_dir_all(&blocklist_dir)
            .with_context(|| format!("creating blocklist dir {}", blocklist_dir.display()))?;
        let blocklist_path = blocklist_dir.join("blocklist.txt");

        let entries = store
            .load_settings()
            .await
            .context("loading persisted settings")?;
        let settings = CoreSettings::from_entries(
            config.defaults,
            entries
                .iter()
                .map(|(key, value)| (key.as_str(), value.as_str())),
        );

        let mut stats_row = store
            .load_session_statistics()
            .await
            .context("loading session statistics")?;
        stats_row.session_count += 1;
        store
            .save_session_statistics(&stats_row)
            .await
            .context("recording session start")?;
        let stats = SessionStatistics {
            uploaded_bytes: stats_row.uploaded_bytes,
            downloaded_bytes: stats_row.downloaded_bytes,
            seconds_active: stats_row.seconds_active,
            session_count: stats_row.session_count,
        };

        let (persistence, replay, persistence_join) = PersistenceManager::load(store.clone())
            .await
            .context("loading torrent table")?;
        let (history, history_join) = HistoryHandle::spawn(store, settings.history);

        let config_service = Arc::new(ConfigurationService::new(settings));
        let snapshot = Arc::new(SnapshotCell::new());
        let shutdown = Arc::new(Shutdown::default());
        let (commands, receiver) = mpsc::channel(COMMAND_QUEUE_CAPACITY);

        let engine = Engine::new(EngineSeed {
            backend,
            bus: bus.clone(),
            config: Arc::clone(&config_service),
            persistence,
            persistence_join,
            replay,
            history,
            history_join,
            io: IoTaskService::new(),
            snapshot: Arc::clone(&snapshot),
            shutdown: Arc::clone(&shutdown),
            commands_tx: commands.clone(),
            stats,
            metadata_dir,
            dht_state_path,
            blocklist_path,
        });
        let engine_join = tokio::spawn(engine.run(receiver));

        Ok(Self {
            commands,
            snapshot,
            config: config_service,
            bus,
            shutdown,
            engine_join: Mutex::new(Some(engine_join)),
        })
    }

    // ---- read surface -----------------------------------------------------

    /// The currently published snapshot; never blocks.
    #[must_use]
    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshot.load()
    }

    /// Snapshot entries for every torrent.
    #[must_use]
    pub fn torrent_list(&self) -> Vec<TorrentSnapshot> {
        self.snapshot.load().torrents.clone()
    }

    /// A copy of the effective settings.
    #[must_use]
    pub fn settings(&self) -> CoreSettings {
        self.config.get()
    }

    /// The domain-event bus.
    #[must_use]
    pub fn events(&self) -> EventBus {
        self.bus.clone()
    }

    /// Whether a graceful shutdown has been requested.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_requested()
    }

    // ---- commands ---------------------------------------------------------

    /// Add a torrent by magnet URI or metainfo.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] when the engine is gone; decode
    /// and path failures surface as the returned [`AddStatus`].
    pub async fn add_torrent(&self, request: TorrentAddRequest) -> Result<AddStatus, CoreError> {
        self.request(|reply| EngineCommand::AddTorrent { request, reply })
            .await?
    }

    /// Remove torrents, optionally deleting payload data.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] when the engine is gone.
    pub async fn remove_torrents(&self, ids: Vec<i64>, delete_data: bool) -> Result<(), CoreError> {
        self.submit(EngineCommand::Remove { ids, delete_data }).await
    }

    /// Resume torrents; `now` bypasses the queue.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] when the engine is gone.
    pub async fn start_torrents(&self, ids: Vec<i64>, now: bool) -> Result<(), CoreError> {
        self.submit(EngineCommand::Start { ids, now }).await
    }

    /// Pause torrents.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] when the engine is gone.
    pub async fn stop_torrents(&self, ids: Vec<i64>) -> Result<(), CoreError> {
        self.submit(EngineCommand::Stop { ids }).await
    }

    /// Force a recheck of on-disk data.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] when the engine is gone.
    pub async fn verify_torrents(&self, ids: Vec<i64>) -> Result<(), CoreError> {
        self.submit(EngineCommand::Verify { ids }).await
    }

    /// Force a reannounce to all trackers.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] when the engine is gone.
    pub async fn reannounce_torrents(&self, ids: Vec<i64>) -> Result<(), CoreError> {
        self.submit(EngineCommand::Reannounce { ids }).await
    }

    /// Reposition torrents in the queue.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] when the engine is gone.
    pub async fn queue_move(&self, ids: Vec<i64>, direction: QueueMove) -> Result<(), CoreError> {
        self.submit(EngineCommand::QueueMove { ids, direction }).await
    }

    /// Select or deselect files for download.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] when the engine is gone.
    pub async fn toggle_file_selection(
        &self,
        ids: Vec<i64>,
        file_indexes: Vec<u32>,
        wanted: bool,
    ) -> Result<(), CoreError> {
        self.submit(EngineCommand::ToggleFileSelection {
            ids,
            file_indexes,
            wanted,
        })
        .await
    }

    /// Toggle sequential download.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] when the engine is gone.
    pub async fn set_sequential(&self, ids: Vec<i64>, enabled: bool) -> Result<(), CoreError> {
        self.submit(EngineCommand::SetSequential { ids, enabled }).await
    }

    /// Toggle super seeding.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] when the engine is gone.
    pub async fn set_super_seeding(&self, ids: Vec<i64>, enabled: bool) -> Result<(), CoreError> {
        self.submit(EngineCommand::SetSuperSeeding { ids, enabled })
            .await
    }

    /// Move a torrent's storage, or just re-point it when `move_data` is
    /// false.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownTorrent`] for a bad id and
    /// [`CoreError::ShuttingDown`] when the engine is gone.
    pub async fn move_torrent_location(
        &self,
        id: i64,
        path: PathBuf,
        move_data: bool,
    ) -> Result<(), CoreError> {
        self.request(|reply| EngineCommand::MoveLocation {
            id,
            path,
            move_data,
            reply,
        })
        .await?
    }

    /// Apply a `session-set` diff.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] when the engine is gone.
    pub async fn update_settings(&self, update: SessionUpdate) -> Result<(), CoreError> {
        self.submit(EngineCommand::UpdateSettings {
            update: Box::new(update),
        })
        .await
    }

    /// Change the download directory, creating it when absent.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidPath`] when the directory cannot be
    /// created and [`CoreError::ShuttingDown`] when the engine is gone.
    pub async fn set_download_path(&self, path: PathBuf) -> Result<(), CoreError> {
        self.request(|reply| EngineCommand::SetDownloadPath { path, reply })
            .await?
    }

    /// Change the listen interface; the value is normalised first.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] when the engine is gone.
    pub async fn set_listen_interface(&self, value: String) -> Result<(), CoreError> {
        self.submit(EngineCommand::SetListenInterface { value }).await
    }

    /// Change only the listen port, keeping the current host.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] when the engine is gone.
    pub async fn set_listen_port(&self, port: u16) -> Result<(), CoreError> {
        self.submit(EngineCommand::SetListenPort { port }).await
    }

    /// Change the global rate limits.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] when the engine is gone.
    pub async fn set_limits(
        &self,
        download_kbps: Option<i64>,
        download_enabled: Option<bool>,
        upload_kbps: Option<i64>,
        upload_enabled: Option<bool>,
    ) -> Result<(), CoreError> {
        self.update_settings(SessionUpdate {
            download_rate_limit_kbps: download_kbps,
            download_rate_limit_enabled: download_enabled,
            upload_rate_limit_kbps: upload_kbps,
            upload_rate_limit_enabled: upload_enabled,
            ..SessionUpdate::default()
        })
        .await
    }

    /// Change the global and per-torrent peer limits.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] when the engine is gone.
    pub async fn set_peer_limits(
        &self,
        global: Option<i32>,
        per_torrent: Option<i32>,
    ) -> Result<(), CoreError> {
        self.update_settings(SessionUpdate {
            peer_limit: global,
            peer_limit_per_torrent: per_torrent,
            ..SessionUpdate::default()
        })
        .await
    }

    /// Edit announce lists; every edit forces a reannounce.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] when the engine is gone.
    pub async fn edit_trackers(&self, ids: Vec<i64>, update: TrackerUpdate) -> Result<(), CoreError> {
        self.submit(EngineCommand::EditTrackers { ids, update }).await
    }

    /// Apply per-torrent seed ratio/idle overrides.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] when the engine is gone.
    pub async fn set_torrent_seed_limits(
        &self,
        ids: Vec<i64>,
        update: SeedLimitUpdate,
    ) -> Result<(), CoreError> {
        self.submit(EngineCommand::SetSeedLimits { ids, update }).await
    }

    /// Set per-torrent bandwidth priority.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] when the engine is gone.
    pub async fn set_bandwidth_priority(
        &self,
        ids: Vec<i64>,
        priority: i32,
    ) -> Result<(), CoreError> {
        self.submit(EngineCommand::SetBandwidthPriority { ids, priority })
            .await
    }

    /// Set per-torrent rate caps in kbps (`0` = unlimited).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] when the engine is gone.
    pub async fn set_bandwidth_limits(
        &self,
        ids: Vec<i64>,
        download_kbps: i64,
        upload_kbps: i64,
    ) -> Result<(), CoreError> {
        self.submit(EngineCommand::SetBandwidthLimits {
            ids,
            download_kbps,
            upload_kbps,
        })
        .await
    }

    /// Replace torrent labels.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] when the engine is gone.
    pub async fn set_labels(&self, ids: Vec<i64>, labels: Vec<String>) -> Result<(), CoreError> {
        self.submit(EngineCommand::SetLabels { ids, labels }).await
    }

    /// Parse and apply the blocklist file asynchronously.
    ///
    /// Returns whether a filter was parsed and handed to the session.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] when the engine is gone.
    pub async fn request_blocklist_reload(&self) -> Result<bool, CoreError> {
        self.request(|reply| EngineCommand::ReloadBlocklist { reply })
            .await
    }

    /// Speed-history buckets in `[start, end]` resampled to `step`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] when the engine is gone.
    pub async fn history_query(
        &self,
        start: i64,
        end: i64,
        step: i64,
    ) -> Result<Vec<HistoryBucket>, CoreError> {
        self.request(|reply| EngineCommand::HistoryQuery {
            start,
            end,
            step,
            reply,
        })
        .await
    }

    /// Clear speed history, optionally only entries older than a cutoff.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] when the engine is gone.
    pub async fn history_clear(&self, older_than: Option<i64>) -> Result<bool, CoreError> {
        self.request(|reply| EngineCommand::HistoryClear { older_than, reply })
            .await
    }

    /// Detail view (files, trackers, peers) for one torrent.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] when the engine is gone.
    pub async fn torrent_detail(&self, id: i64) -> Result<Option<TorrentDetailView>, CoreError> {
        self.request(|reply| EngineCommand::TorrentDetail { id, reply })
            .await
    }

    /// Request a graceful shutdown; returns immediately.
    pub fn stop(&self) {
        self.shutdown.request();
    }

    /// Wait for the engine task to finish; call after [`stop`](Self::stop).
    pub async fn join(&self) {
        let handle = self.engine_join.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "engine task join failed");
            }
        }
    }

    async fn submit(&self, command: EngineCommand) -> Result<(), CoreError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CoreError::ShuttingDown)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T, CoreError> {
        let (reply, receiver) = oneshot::channel();
        self.submit(build(reply)).await?;
        receiver.await.map_err(|_| CoreError::ShuttingDown)
    }
}
