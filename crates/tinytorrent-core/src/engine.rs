use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tinytorrent_data::{SessionStatisticsRow, TorrentRow};
use tinytorrent_events::{ErrorSource, Event, EventBus};
use tinytorrent_session::{
    AddTorrentParams, Alert, FilePriority, InfoHash, ListenProtocol, SessionBackend, SessionError,
    TorrentSource, TorrentStatus, TrackerEntry,
};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::automation::{
    self, AutomationAgent, collect_watch_entries, determine_completion_destination,
    mark_watch_file, read_watch_files,
};
use crate::blocklist::BlocklistManager;
use crate::command::{AddStatus, EngineCommand, TorrentAddRequest, TorrentDetailView, TrackerUpdate};
use crate::config::ConfigurationService;
use crate::error::CoreError;
use crate::history::HistoryHandle;
use crate::ids::RpcIdRegistry;
use crate::persistence::{PersistenceManager, write_metadata_sidecar};
use crate::policy::{PolicyAction, TorrentLimitState, enforce_seed_limits};
use crate::resume::ResumeDataService;
use crate::scheduler::{kbps_to_bytes, rate_limit_pack, should_use_alt_speed};
use crate::settings::{SettingsDelta, SessionUpdate};
use crate::snapshot::{
    SessionSnapshot, SnapshotCell, SnapshotExtras, TorrentSnapshot, build_torrent_snapshot,
};
use crate::state::{SessionStatistics, StateService};
use crate::tasks::IoTaskService;

/// Upper bound on alerts drained per tick.
const ALERT_DRAIN_CAPACITY: usize = 65_536;

/// Housekeeping cadence.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(2);

/// Hard ceiling on the shutdown long tail.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Process-wide shutdown latch shared between the core handle and the
/// engine task.
#[derive(Debug, Default)]
pub(crate) struct Shutdown {
    requested: AtomicBool,
    notify: Notify,
    started_at: Mutex<Option<Instant>>,
}

impl Shutdown {
    pub(crate) fn request(&self) {
        let mut started = self.started_at.lock().unwrap_or_else(|p| p.into_inner());
        if started.is_none() {
            *started = Some(Instant::now());
        }
        drop(started);
        self.requested.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await;
    }

    fn started_at(&self) -> Option<Instant> {
        *self.started_at.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(0))
}

fn format_endpoint(address: &str, port: u16) -> String {
    if address.contains(':') {
        format!("[{address}]:{port}")
    } else {
        format!("{address}:{port}")
    }
}

/// Everything the engine needs at spawn time.
pub(crate) struct EngineSeed {
    pub(crate) backend: Box<dyn SessionBackend>,
    pub(crate) bus: EventBus,
    pub(crate) config: Arc<ConfigurationService>,
    pub(crate) persistence: PersistenceManager,
    pub(crate) persistence_join: JoinHandle<()>,
    pub(crate) replay: Vec<TorrentRow>,
    pub(crate) history: HistoryHandle,
    pub(crate) history_join: JoinHandle<()>,
    pub(crate) io: IoTaskService,
    pub(crate) snapshot: Arc<SnapshotCell>,
    pub(crate) shutdown: Arc<Shutdown>,
    pub(crate) commands_tx: mpsc::Sender<EngineCommand>,
    pub(crate) stats: SessionStatistics,
    pub(crate) metadata_dir: PathBuf,
    pub(crate) dht_state_path: PathBuf,
    pub(crate) blocklist_path: PathBuf,
}

pub(crate) struct Engine {
    backend: Box<dyn SessionBackend>,
    bus: EventBus,
    config: Arc<ConfigurationService>,
    persistence: PersistenceManager,
    persistence_join: JoinHandle<()>,
    replay: Vec<TorrentRow>,
    history: HistoryHandle,
    history_join: JoinHandle<()>,
    io: IoTaskService,
    snapshot_cell: Arc<SnapshotCell>,
    shutdown: Arc<Shutdown>,
    commands_tx: mpsc::Sender<EngineCommand>,
    automation: AutomationAgent,
    blocklist: BlocklistManager,
    ids: RpcIdRegistry,
    state: StateService,
    resume: ResumeDataService,

    statuses: HashMap<InfoHash, TorrentStatus>,
    errors: HashMap<InfoHash, String>,
    revisions: HashMap<i64, u64>,
    next_revision: u64,
    snapshot_cache: HashMap<i64, TorrentSnapshot>,
    limits: HashMap<i64, TorrentLimitState>,
    priorities: HashMap<i64, i32>,
    bandwidth: HashMap<i64, (i64, i64)>,

    effective_listen: Option<String>,
    listen_error: Option<String>,
    alt_speed_active: bool,
    save_resume_in_progress: bool,
    next_housekeeping: Instant,
    metadata_dir: PathBuf,
    dht_state_path: PathBuf,
}

impl Engine {
    pub(crate) fn new(seed: EngineSeed) -> Self {
        let now = Instant::now();
        let stats = seed.stats;
        let blocklist = BlocklistManager::new(seed.blocklist_path);
        Self {
            backend: seed.backend,
            bus: seed.bus,
            config: seed.config,
            persistence: seed.persistence,
            persistence_join: seed.persistence_join,
            replay: seed.replay,
            history: seed.history,
            history_join: seed.history_join,
            io: seed.io,
            snapshot_cell: seed.snapshot,
            shutdown: seed.shutdown,
            commands_tx: seed.commands_tx,
            automation: AutomationAgent::new(),
            blocklist,
            ids: RpcIdRegistry::new(),
            state: StateService::new(stats, Default::default(), now),
            resume: ResumeDataService::new(),
            statuses: HashMap::new(),
            errors: HashMap::new(),
            revisions: HashMap::new(),
            next_revision: 0,
            snapshot_cache: HashMap::new(),
            limits: HashMap::new(),
            priorities: HashMap::new(),
            bandwidth: HashMap::new(),
            effective_listen: None,
            listen_error: None,
            alt_speed_active: false,
            save_resume_in_progress: false,
            next_housekeeping: now,
            metadata_dir: seed.metadata_dir,
            dht_state_path: seed.dht_state_path,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<EngineCommand>) {
        self.startup().await;
        let settings = self.config.get();
        let shutdown = Arc::clone(&self.shutdown);
        let mut tick = interval(Duration::from_millis(settings.idle_sleep_ms.max(10)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let now = Instant::now();
            if self.shutdown.is_requested() && !self.save_resume_in_progress {
                self.begin_resume_save(now).await;
            }
            self.refresh_speed_limits(false).await;
            while let Ok(command) = commands.try_recv() {
                self.handle_command(command).await;
            }
            self.drain_alerts().await;
            self.update_snapshot().await;
            self.housekeeping().await;
            self.flush_settings_if_due(false).await;

            if self.shutdown.is_requested() && self.should_exit(Instant::now()) {
                break;
            }

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => shutdown.request(),
                },
                _ = tick.tick() => {}
                () = shutdown.notified() => {}
            }
        }

        self.finalize().await;
    }

    async fn startup(&mut self) {
        let settings = self.config.get();
        let full_pack = settings.session_pack(SettingsDelta::all());
        if let Err(err) = self.backend.apply_settings(&full_pack).await {
            warn!(error = %err, "initial settings application failed");
        }
        self.refresh_speed_limits(true).await;
        self.automation.configure(
            settings.watch_dir.clone(),
            settings.watch_dir_enabled,
            settings.download_path.clone(),
            settings.incomplete_dir.clone(),
            settings.incomplete_dir_enabled,
        );
        self.state = StateService::new(
            self.state.cumulative(),
            self.backend.totals(),
            Instant::now(),
        );

        let rows = std::mem::take(&mut self.replay);
        self.ids.restore(rows.iter().filter_map(|row| {
            row.info_hash
                .parse::<InfoHash>()
                .ok()
                .map(|hash| (hash, row.rpc_id))
        }));
        for row in rows {
            self.replay_torrent(row).await;
        }

        let blocklist_path = self.blocklist.path().to_path_buf();
        if blocklist_path.exists() {
            self.spawn_blocklist_load(blocklist_path, None);
        }
        info!(torrents = self.ids.len(), "engine started");
    }

    async fn replay_torrent(&mut self, row: TorrentRow) {
        let source = if let Some(uri) = row.magnet_uri.clone() {
            TorrentSource::Magnet { uri }
        } else if let Some(bytes) = row.metainfo.clone() {
            TorrentSource::Metainfo { bytes }
        } else if let Some(path) = row.metadata_path.as_deref() {
            match tokio::fs::read(path).await {
                Ok(bytes) => TorrentSource::Metainfo { bytes },
                Err(err) => {
                    warn!(
                        info_hash = %row.info_hash,
                        path,
                        error = %err,
                        "metadata sidecar unreadable; torrent not restored"
                    );
                    return;
                }
            }
        } else {
            warn!(info_hash = %row.info_hash, "persisted torrent has no source; skipped");
            return;
        };

        let params = AddTorrentParams {
            source,
            save_path: PathBuf::from(&row.save_path),
            paused: row.paused,
            resume_data: row.resume_data.clone(),
        };
        match self.backend.add_torrent(params).await {
            Ok(hash) => debug!(hash = %hash, "torrent restored"),
            Err(err) => {
                warn!(info_hash = %row.info_hash, error = %err, "torrent restore failed");
            }
        }
    }

    // ---- command handling -------------------------------------------------

    #[allow(clippy::too_many_lines)]
    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::AddTorrent { request, reply } => {
                let result = self.add_torrent(request).await;
                let _ = reply.send(result);
            }
            EngineCommand::Remove { ids, delete_data } => {
                for id in ids {
                    self.remove_torrent(id, delete_data).await;
                }
            }
            EngineCommand::Start { ids, now } => {
                for id in ids {
                    let Some(hash) = self.ids.hash_for(id) else { continue };
                    if let Err(err) = self.backend.resume_torrent(&hash, now).await {
                        warn!(id, error = %err, "resume failed");
                        continue;
                    }
                    self.persistence.set_paused(&hash, false).await;
                    self.bump_revision(id);
                }
            }
            EngineCommand::Stop { ids } => {
                for id in ids {
                    let Some(hash) = self.ids.hash_for(id) else { continue };
                    if let Err(err) = self.backend.pause_torrent(&hash).await {
                        warn!(id, error = %err, "pause failed");
                        continue;
                    }
                    self.persistence.set_paused(&hash, true).await;
                    self.bump_revision(id);
                }
            }
            EngineCommand::Verify { ids } => {
                for id in ids {
                    let Some(hash) = self.ids.hash_for(id) else { continue };
                    if let Err(err) = self.backend.recheck_torrent(&hash).await {
                        warn!(id, error = %err, "recheck failed");
                    }
                    self.bump_revision(id);
                }
            }
            EngineCommand::Reannounce { ids } => {
                for id in ids {
                    let Some(hash) = self.ids.hash_for(id) else { continue };
                    if let Err(err) = self.backend.reannounce_torrent(&hash).await {
                        warn!(id, error = %err, "reannounce failed");
                    }
                }
            }
            EngineCommand::QueueMove { ids, direction } => {
                for id in ids {
                    let Some(hash) = self.ids.hash_for(id) else { continue };
                    if let Err(err) = self.backend.queue_move(&hash, direction).await {
                        warn!(id, error = %err, "queue move failed");
                    }
                    self.bump_revision(id);
                }
            }
            EngineCommand::ToggleFileSelection {
                ids,
                file_indexes,
                wanted,
            } => {
                let priority = if wanted {
                    FilePriority::Default
                } else {
                    FilePriority::DontDownload
                };
                for id in ids {
                    let Some(hash) = self.ids.hash_for(id) else { continue };
                    if let Err(err) = self
                        .backend
                        .set_file_priorities(&hash, &file_indexes, priority)
                        .await
                    {
                        warn!(id, error = %err, "file selection failed");
                    }
                    self.bump_revision(id);
                }
            }
            EngineCommand::SetSequential { ids, enabled } => {
                for id in ids {
                    let Some(hash) = self.ids.hash_for(id) else { continue };
                    if let Err(err) = self.backend.set_sequential(&hash, enabled).await {
                        warn!(id, error = %err, "sequential toggle failed");
                    }
                    self.bump_revision(id);
                }
            }
            EngineCommand::SetSuperSeeding { ids, enabled } => {
                for id in ids {
                    let Some(hash) = self.ids.hash_for(id) else { continue };
                    if let Err(err) = self.backend.set_super_seeding(&hash, enabled).await {
                        warn!(id, error = %err, "super-seeding toggle failed");
                    }
                    self.bump_revision(id);
                }
            }
            EngineCommand::MoveLocation {
                id,
                path,
                move_data,
                reply,
            } => {
                let result = self.move_location(id, path, move_data).await;
                let _ = reply.send(result);
            }
            EngineCommand::UpdateSettings { update } => {
                self.apply_settings_update(*update).await;
            }
            EngineCommand::SetDownloadPath { path, reply } => {
                let result = self.set_download_path(path).await;
                let _ = reply.send(result);
            }
            EngineCommand::SetListenInterface { value } => {
                self.apply_listen_interface(&value).await;
            }
            EngineCommand::SetListenPort { port } => {
                let current = self.config.get().listen_interface;
                let host = current
                    .rsplit_once(':')
                    .map_or("0.0.0.0", |(host, _)| host)
                    .trim_matches(['[', ']']);
                let value = format_endpoint(host, port);
                self.apply_listen_interface(&value).await;
            }
            EngineCommand::EditTrackers { ids, update } => {
                for id in ids {
                    self.edit_trackers(id, &update).await;
                }
            }
            EngineCommand::SetSeedLimits { ids, update } => {
                let now = Instant::now();
                for id in ids {
                    self.limits
                        .entry(id)
                        .or_insert_with(|| TorrentLimitState::new(now))
                        .apply(update, now);
                    self.bump_revision(id);
                }
            }
            EngineCommand::SetBandwidthPriority { ids, priority } => {
                for id in ids {
                    let Some(hash) = self.ids.hash_for(id) else { continue };
                    if let Err(err) = self.backend.set_torrent_priority(&hash, priority).await {
                        warn!(id, error = %err, "priority change failed");
                    }
                    self.priorities.insert(id, priority);
                    self.bump_revision(id);
                }
            }
            EngineCommand::SetBandwidthLimits {
                ids,
                download_kbps,
                upload_kbps,
            } => {
                let download = kbps_to_bytes(download_kbps, true);
                let upload = kbps_to_bytes(upload_kbps, true);
                for id in ids {
                    let Some(hash) = self.ids.hash_for(id) else { continue };
                    if let Err(err) = self
                        .backend
                        .set_torrent_limits(&hash, download, upload)
                        .await
                    {
                        warn!(id, error = %err, "torrent limit change failed");
                    }
                    self.bandwidth.insert(id, (download_kbps, upload_kbps));
                    self.bump_revision(id);
                }
            }
            EngineCommand::SetLabels { ids, labels } => {
                for id in ids {
                    let Some(hash) = self.ids.hash_for(id) else { continue };
                    self.persistence.set_labels(&hash, labels.clone()).await;
                    self.bump_revision(id);
                }
            }
            EngineCommand::ReloadBlocklist { reply } => {
                let path = self.blocklist.path().to_path_buf();
                self.spawn_blocklist_load(path, Some(reply));
            }
            EngineCommand::HistoryQuery {
                start,
                end,
                step,
                reply,
            } => {
                let buckets = self.history.query(start, end, step).await;
                let _ = reply.send(buckets);
            }
            EngineCommand::HistoryClear { older_than, reply } => {
                let cleared = self.history.clear(older_than).await;
                let _ = reply.send(cleared);
            }
            EngineCommand::TorrentDetail { id, reply } => {
                let _ = reply.send(self.torrent_detail(id));
            }

            EngineCommand::WatchEntriesCollected {
                entries,
                collected_at,
            } => {
                let stable = self.automation.process_entries(entries, collected_at);
                if !stable.is_empty() {
                    self.relay(
                        self.io.submit(move || read_watch_files(stable)),
                        |files| Some(EngineCommand::WatchFilesLoaded { files }),
                    );
                }
            }
            EngineCommand::WatchFilesLoaded { files } => {
                for (entry, bytes) in files {
                    self.ingest_watch_file(entry, bytes).await;
                }
            }
            EngineCommand::MetadataSidecarWritten { hash, path } => {
                self.persistence.update_metadata(&hash, &path).await;
                let _ = self.bus.publish(Event::MetadataPersisted {
                    hash: hash.to_hex(),
                    path: path.display().to_string(),
                });
            }
            EngineCommand::ExecuteCompletionMove { hash, destination } => {
                if !self.backend.contains(&hash) {
                    return;
                }
                info!(hash = %hash, destination = %destination.display(), "moving completed torrent");
                self.automation.note_pending_move(hash, destination.clone());
                if let Err(err) = self.backend.move_storage(&hash, &destination).await {
                    warn!(hash = %hash, error = %err, "move-on-complete failed to start");
                    let _ = self.automation.cancel_move(&hash);
                }
            }
            EngineCommand::ApplyBlocklist {
                filter,
                entries,
                reply,
            } => {
                if let Err(err) = self.backend.set_ip_filter(filter).await {
                    warn!(error = %err, "ip filter application failed");
                    if let Some(reply) = reply {
                        let _ = reply.send(false);
                    }
                    return;
                }
                self.blocklist.note_loaded(entries, unix_now());
                let _ = self.bus.publish(Event::BlocklistApplied { entries });
                if let Some(reply) = reply {
                    let _ = reply.send(true);
                }
            }
        }
    }

    async fn add_torrent(&mut self, request: TorrentAddRequest) -> Result<AddStatus, CoreError> {
        let settings = self.config.get();
        let save_path = request
            .download_path
            .clone()
            .filter(|path| !path.as_os_str().is_empty())
            .unwrap_or_else(|| {
                if settings.incomplete_dir_enabled && !settings.incomplete_dir.as_os_str().is_empty()
                {
                    settings.incomplete_dir.clone()
                } else {
                    settings.download_path.clone()
                }
            });
        if let Err(err) = std::fs::create_dir_all(&save_path) {
            warn!(path = %save_path.display(), error = %err, "save path creation failed");
            return Ok(AddStatus::InvalidPath);
        }

        let source = if let Some(uri) = request.uri.clone() {
            TorrentSource::Magnet { uri }
        } else if !request.metainfo.is_empty() {
            TorrentSource::Metainfo {
                bytes: request.metainfo.clone(),
            }
        } else {
            return Ok(AddStatus::InvalidUri);
        };

        let params = AddTorrentParams {
            source,
            save_path: save_path.clone(),
            paused: request.paused,
            resume_data: None,
        };
        let hash = match self.backend.add_torrent(params).await {
            Ok(hash) => hash,
            Err(SessionError::InvalidSource { reason }) => {
                debug!(reason, "add rejected: invalid source");
                return Ok(AddStatus::InvalidUri);
            }
            Err(err) => {
                warn!(error = %err, "session add failed");
                return Ok(AddStatus::InvalidUri);
            }
        };

        let (id, newly_assigned) = self.ids.ensure(hash);
        if newly_assigned {
            self.bump_revision(id);
        }
        let labels =
            serde_json::to_string(&request.labels).unwrap_or_else(|_| "[]".to_string());
        let row = TorrentRow {
            info_hash: hash.to_hex(),
            magnet_uri: request.uri.clone(),
            save_path: save_path.display().to_string(),
            resume_data: None,
            metainfo: (!request.metainfo.is_empty()).then(|| request.metainfo.clone()),
            paused: request.paused,
            labels,
            added_at: unix_now(),
            rpc_id: id,
            metadata_path: None,
        };
        self.persistence.add_or_update(hash, row).await;
        info!(id, hash = %hash, paused = request.paused, "torrent added");
        let _ = self.bus.publish(Event::TorrentAdded {
            id,
            hash: hash.to_hex(),
            name: hash.to_hex(),
        });
        Ok(AddStatus::Ok)
    }

    async fn remove_torrent(&mut self, id: i64, delete_data: bool) {
        let Some(hash) = self.ids.hash_for(id) else {
            debug!(id, "remove skipped: unknown id");
            return;
        };
        if let Err(err) = self.backend.remove_torrent(&hash, delete_data).await {
            warn!(id, error = %err, "session removal failed");
        }
        let cached = self.persistence.remove(&hash).await;
        if let Some(sidecar) = cached.and_then(|cached| cached.metadata_path) {
            self.relay(
                self.io.submit(move || {
                    if let Err(err) = std::fs::remove_file(&sidecar) {
                        debug!(path = %sidecar.display(), error = %err, "sidecar removal failed");
                    }
                }),
                |()| None,
            );
        }
        self.ids.release(&hash);
        self.statuses.remove(&hash);
        self.errors.remove(&hash);
        self.revisions.remove(&id);
        self.snapshot_cache.remove(&id);
        self.limits.remove(&id);
        self.priorities.remove(&id);
        self.bandwidth.remove(&id);
        let _ = self.automation.cancel_move(&hash);
        info!(id, hash = %hash, delete_data, "torrent removed");
        let _ = self.bus.publish(Event::TorrentRemoved {
            id,
            hash: hash.to_hex(),
        });
    }

    async fn move_location(
        &mut self,
        id: i64,
        path: PathBuf,
        move_data: bool,
    ) -> Result<(), CoreError> {
        let Some(hash) = self.ids.hash_for(id) else {
            return Err(CoreError::UnknownTorrent(id));
        };
        if move_data {
            self.automation.note_pending_move(hash, path.clone());
            if let Err(err) = self.backend.move_storage(&hash, &path).await {
                warn!(id, error = %err, "move-storage failed to start");
                let _ = self.automation.cancel_move(&hash);
            }
        } else {
            let rendered = path.display().to_string();
            self.persistence.update_save_path(&hash, &rendered).await;
            if let Some(status) = self.statuses.get_mut(&hash) {
                status.save_path = rendered.clone();
            }
            self.bump_revision(id);
            let _ = self.bus.publish(Event::StorageMoved {
                hash: hash.to_hex(),
                path: rendered,
            });
        }
        Ok(())
    }

    async fn apply_settings_update(&mut self, mut update: SessionUpdate) {
        self.validate_update_paths(&mut update);
        let delta = self.config.update(&update);
        if !delta.any() {
            return;
        }
        let settings = self.config.get();
        let pack = settings.session_pack(delta);
        if delta.encryption
            || delta.network
            || delta.queue
            || delta.proxy
            || delta.pex
            || delta.partfile
        {
            if let Err(err) = self.backend.apply_settings(&pack).await {
                warn!(error = %err, "settings application failed");
            }
        }
        if delta.limits || delta.alt_speed {
            self.refresh_speed_limits(true).await;
        }
        if delta.history {
            self.history.update_config(settings.history);
        }
        if delta.paths {
            self.automation.configure(
                settings.watch_dir.clone(),
                settings.watch_dir_enabled,
                settings.download_path.clone(),
                settings.incomplete_dir.clone(),
                settings.incomplete_dir_enabled,
            );
        }
        let _ = self.bus.publish(Event::SettingsChanged);
    }

    /// Drop path fields whose directories cannot be created.
    fn validate_update_paths(&self, update: &mut SessionUpdate) {
        for field in [
            &mut update.download_path,
            &mut update.incomplete_dir,
            &mut update.watch_dir,
        ] {
            let invalid = field.as_deref().is_some_and(|path| {
                !path.as_os_str().is_empty() && std::fs::create_dir_all(path).is_err()
            });
            if invalid {
                warn!(path = ?field, "directory creation failed; change rejected");
                *field = None;
            }
        }
    }

    async fn apply_listen_interface(&mut self, value: &str) {
        let Some(normalised) = self.config.set_listen_interface(value) else {
            return;
        };
        let settings = self.config.get();
        let pack = settings.session_pack(SettingsDelta {
            network: true,
            ..SettingsDelta::default()
        });
        if let Err(err) = self.backend.apply_settings(&pack).await {
            warn!(error = %err, "listen interface application failed");
        }
        debug!(interface = %normalised, "listen interface updated");
        let _ = self.bus.publish(Event::SettingsChanged);
    }

    async fn set_download_path(&mut self, path: PathBuf) -> Result<(), CoreError> {
        if let Err(err) = std::fs::create_dir_all(&path) {
            warn!(path = %path.display(), error = %err, "download path creation failed");
            return Err(CoreError::InvalidPath { path });
        }
        self.config.set_download_path(path.clone());
        self.automation.set_download_path(path);
        let _ = self.bus.publish(Event::SettingsChanged);
        Ok(())
    }

    async fn edit_trackers(&mut self, id: i64, update: &TrackerUpdate) {
        let Some(hash) = self.ids.hash_for(id) else {
            debug!(id, "tracker edit skipped: unknown id");
            return;
        };
        let mut entries = self.backend.trackers(&hash);
        match update {
            TrackerUpdate::Add(urls) => {
                let next_tier = entries.iter().map(|entry| entry.tier + 1).max().unwrap_or(0);
                for url in urls {
                    if !entries.iter().any(|entry| &entry.announce == url) {
                        entries.push(TrackerEntry {
                            announce: url.clone(),
                            tier: next_tier,
                        });
                    }
                }
            }
            TrackerUpdate::Remove(urls) => {
                entries.retain(|entry| !urls.contains(&entry.announce));
            }
            TrackerUpdate::Replace(replacement) => {
                entries = replacement.clone();
            }
        }
        if let Err(err) = self.backend.replace_trackers(&hash, entries).await {
            warn!(id, error = %err, "tracker edit failed");
            return;
        }
        if let Err(err) = self.backend.reannounce_torrent(&hash).await {
            debug!(id, error = %err, "post-edit reannounce failed");
        }
        self.bump_revision(id);
    }

    fn torrent_detail(&mut self, id: i64) -> Option<TorrentDetailView> {
        let hash = self.ids.hash_for(id)?;
        let status = self.statuses.get(&hash)?.clone();
        let revision = self.ensure_revision(id);
        let summary = build_torrent_snapshot(id, &status, revision, self.snapshot_extras(id, &hash));
        let detail = self.backend.detail(&hash).unwrap_or_default();
        Some(TorrentDetailView {
            summary,
            files: detail.files,
            trackers: detail.trackers,
            peers: detail.peers,
            piece_count: detail.piece_count,
            piece_size: detail.piece_size,
        })
    }

    fn spawn_blocklist_load(
        &mut self,
        path: PathBuf,
        reply: Option<tokio::sync::oneshot::Sender<bool>>,
    ) {
        let Some(handle) = self.io.submit(move || BlocklistManager::load(&path)) else {
            if let Some(reply) = reply {
                let _ = reply.send(false);
            }
            return;
        };
        let tx = self.commands_tx.clone();
        tokio::spawn(async move {
            match handle.await {
                Ok(Some(result)) => {
                    let _ = tx
                        .send(EngineCommand::ApplyBlocklist {
                            filter: result.filter,
                            entries: result.entries,
                            reply,
                        })
                        .await;
                }
                Ok(None) => {
                    if let Some(reply) = reply {
                        let _ = reply.send(false);
                    }
                }
                Err(err) => {
                    warn!(error = %err, "blocklist load task failed");
                    if let Some(reply) = reply {
                        let _ = reply.send(false);
                    }
                }
            }
        });
    }

    async fn ingest_watch_file(&mut self, entry: automation::WatchEntry, bytes: Vec<u8>) {
        self.automation.forget(&entry.path);
        let path = entry.path.clone();
        if bytes.is_empty() {
            self.mark_watch(path, ".invalid");
            return;
        }
        let request = TorrentAddRequest {
            metainfo: bytes,
            ..TorrentAddRequest::default()
        };
        let suffix = match self.add_torrent(request).await {
            Ok(AddStatus::Ok) => ".added",
            Ok(AddStatus::InvalidUri | AddStatus::InvalidPath) | Err(_) => {
                info!(file = %path.display(), "watch-dir enqueue failed");
                ".invalid"
            }
        };
        self.mark_watch(path, suffix);
    }

    fn mark_watch(&self, path: PathBuf, suffix: &'static str) {
        self.relay(
            self.io.submit(move || mark_watch_file(&path, suffix)),
            |()| None,
        );
    }

    // ---- alerts -----------------------------------------------------------

    async fn drain_alerts(&mut self) {
        self.backend.post_status_updates();
        let alerts = self.backend.pop_alerts(ALERT_DRAIN_CAPACITY);
        for alert in alerts {
            self.route_alert(alert).await;
        }
    }

    async fn route_alert(&mut self, alert: Alert) {
        match alert {
            Alert::StateUpdate { statuses } => {
                for status in statuses {
                    let hash = status.info_hash;
                    if let Some(id) = self.ids.id_for(&hash) {
                        self.bump_revision(id);
                    }
                    self.statuses.insert(hash, status);
                }
            }
            Alert::TorrentFinished { status } => self.handle_finished(status).await,
            Alert::MetadataReceived { hash, metainfo } => {
                let dir = self.metadata_dir.clone();
                self.relay(
                    self.io
                        .submit(move || write_metadata_sidecar(&dir, &hash, &metainfo)),
                    move |written| match written {
                        Ok(path) => Some(EngineCommand::MetadataSidecarWritten { hash, path }),
                        Err(err) => {
                            warn!(hash = %hash, error = %err, "metadata sidecar write failed");
                            None
                        }
                    },
                );
            }
            Alert::SaveResumeData { hash, resume_data } => {
                self.persistence.update_resume_data(&hash, resume_data).await;
                self.resume.mark_completed(&hash, Instant::now());
                let _ = self.bus.publish(Event::ResumeDataSaved {
                    hash: hash.to_hex(),
                });
            }
            Alert::SaveResumeDataFailed { hash, message } => {
                warn!(hash = %hash, message, "resume data generation failed");
                self.resume.mark_completed(&hash, Instant::now());
            }
            Alert::ListenSucceeded {
                address,
                port,
                protocol,
            } => {
                if protocol != ListenProtocol::Tcp {
                    return;
                }
                let interface = format_endpoint(&address, port);
                info!(interface = %interface, "listen succeeded");
                self.effective_listen = Some(interface.clone());
                self.listen_error = None;
                let _ = self.bus.publish(Event::ListenSucceeded { interface });
            }
            Alert::ListenFailed {
                address,
                port,
                message,
                protocol,
            } => {
                if protocol != ListenProtocol::Tcp {
                    return;
                }
                let interface = format_endpoint(&address, port);
                let rendered = format!("listen failed on {interface}: {message}");
                info!("{rendered}");
                self.listen_error = Some(rendered.clone());
                let _ = self.bus.publish(Event::ListenFailed {
                    interface,
                    message: rendered,
                });
            }
            Alert::FileError { hash, message } => {
                self.record_torrent_error(&hash, message, ErrorSource::File);
            }
            Alert::TrackerError { hash, message } => {
                self.record_torrent_error(&hash, message, ErrorSource::Tracker);
            }
            Alert::PortmapError { message } => {
                debug!(message, "portmap error");
                self.listen_error = Some(message);
            }
            Alert::StorageMoved { hash, path } => {
                let _ = self.automation.complete_move(&hash);
                let rendered = path.display().to_string();
                self.persistence.update_save_path(&hash, &rendered).await;
                if let Some(status) = self.statuses.get_mut(&hash) {
                    status.save_path = rendered.clone();
                }
                if let Some(id) = self.ids.id_for(&hash) {
                    self.bump_revision(id);
                }
                info!(hash = %hash, path = %rendered, "storage moved");
                let _ = self.bus.publish(Event::StorageMoved {
                    hash: hash.to_hex(),
                    path: rendered,
                });
            }
            Alert::StorageMoveFailed { hash, message } => {
                let _ = self.automation.cancel_move(&hash);
                self.record_torrent_error(&hash, message.clone(), ErrorSource::Storage);
                let _ = self.bus.publish(Event::StorageMoveFailed {
                    hash: hash.to_hex(),
                    message,
                });
            }
            Alert::FastresumeRejected { hash, message } => {
                self.record_torrent_error(&hash, message, ErrorSource::File);
            }
            Alert::TorrentAddFailed { hash, message } => {
                warn!(hash = %hash, message, "session add failed; scrubbing persistence");
                let _ = self.persistence.remove(&hash).await;
                if let Some(id) = self.ids.release(&hash) {
                    self.revisions.remove(&id);
                    self.snapshot_cache.remove(&id);
                }
                self.statuses.remove(&hash);
            }
        }
    }

    async fn handle_finished(&mut self, status: TorrentStatus) {
        let hash = status.info_hash;
        if let Some(id) = self.ids.id_for(&hash) {
            self.bump_revision(id);
            let _ = self.bus.publish(Event::TorrentFinished {
                id,
                hash: hash.to_hex(),
            });
        }
        self.statuses.insert(hash, status.clone());

        if !self.automation.should_move_on_complete(&status) {
            return;
        }
        let base = self.automation.download_path().to_path_buf();
        let current = PathBuf::from(&status.save_path);
        let name = status.name.clone();
        let hex = hash.to_hex();
        self.relay(
            self.io.submit(move || {
                determine_completion_destination(&base, &current, &name, &hex)
                    .filter(|destination| destination != &current)
            }),
            move |destination| {
                destination.map(|destination| EngineCommand::ExecuteCompletionMove {
                    hash,
                    destination,
                })
            },
        );
    }

    fn record_torrent_error(&mut self, hash: &InfoHash, message: String, source: ErrorSource) {
        debug!(hash = %hash, source = %source, message, "torrent error");
        self.errors.insert(*hash, message.clone());
        if let Some(id) = self.ids.id_for(hash) {
            self.bump_revision(id);
        }
        let _ = self.bus.publish(Event::TorrentError {
            hash: hash.to_hex(),
            source,
            message,
        });
    }

    // ---- snapshot ---------------------------------------------------------

    fn bump_revision(&mut self, id: i64) {
        self.next_revision += 1;
        self.revisions.insert(id, self.next_revision);
    }

    fn ensure_revision(&mut self, id: i64) -> u64 {
        if let Some(revision) = self.revisions.get(&id) {
            return *revision;
        }
        self.next_revision += 1;
        self.revisions.insert(id, self.next_revision);
        self.next_revision
    }

    fn snapshot_extras(&self, id: i64, hash: &InfoHash) -> SnapshotExtras {
        SnapshotExtras {
            labels: self.persistence.labels(hash),
            bandwidth_priority: self.priorities.get(&id).copied().unwrap_or(0),
            bandwidth_limits: self.bandwidth.get(&id).copied().unwrap_or((0, 0)),
            error_override: self.errors.get(hash).cloned().filter(|text| !text.is_empty()),
        }
    }

    async fn update_snapshot(&mut self) {
        let settings = self.config.get();
        let now = Instant::now();
        let hashes = self.backend.torrent_hashes();
        let mut entries = Vec::with_capacity(hashes.len());
        let mut seen_ids = HashSet::with_capacity(hashes.len());

        for hash in &hashes {
            if hash.is_zero() {
                continue;
            }
            let Some(status) = self.statuses.get(hash).cloned() else {
                continue;
            };
            let (id, newly_assigned) = self.ids.ensure(*hash);
            if newly_assigned {
                self.bump_revision(id);
                self.persistence.update_rpc_id(hash, id).await;
            }
            seen_ids.insert(id);

            let action = {
                let state = self
                    .limits
                    .entry(id)
                    .or_insert_with(|| TorrentLimitState::new(now));
                enforce_seed_limits(state, &settings, &status, now)
            };
            if action == PolicyAction::Pause {
                info!(id, hash = %hash, "seed limit reached; pausing");
                if let Err(err) = self.backend.pause_torrent(hash).await {
                    warn!(id, error = %err, "policy pause failed");
                }
                self.persistence.set_paused(hash, true).await;
                self.bump_revision(id);
            }

            let revision = self.ensure_revision(id);
            let reusable = self
                .snapshot_cache
                .get(&id)
                .is_some_and(|cached| cached.revision == revision);
            let entry = if reusable {
                self.snapshot_cache
                    .get(&id)
                    .cloned()
                    .unwrap_or_default()
            } else {
                let built =
                    build_torrent_snapshot(id, &status, revision, self.snapshot_extras(id, hash));
                self.snapshot_cache.insert(id, built.clone());
                built
            };
            entries.push(entry);
        }

        // Purge per-id caches for torrents no longer in the session.
        self.revisions.retain(|id, _| seen_ids.contains(id));
        self.snapshot_cache.retain(|id, _| seen_ids.contains(id));
        self.limits.retain(|id, _| seen_ids.contains(id));
        self.priorities.retain(|id, _| seen_ids.contains(id));
        self.bandwidth.retain(|id, _| seen_ids.contains(id));
        let live: HashSet<InfoHash> = hashes.into_iter().collect();
        self.statuses.retain(|hash, _| live.contains(hash));
        self.errors.retain(|hash, _| live.contains(hash));

        entries.sort_by_key(|entry| (entry.queue_position, entry.id));
        let download_rate: u64 = entries.iter().map(|entry| entry.download_rate).sum();
        let upload_rate: u64 = entries.iter().map(|entry| entry.upload_rate).sum();
        let paused = entries.iter().filter(|entry| entry.status == 0).count();
        let torrent_count = entries.len();

        let totals = self.backend.totals();
        let (down_delta, up_delta) = self.state.record(totals, now);
        self.history
            .record(down_delta, up_delta, download_rate, upload_rate);

        let snapshot = SessionSnapshot {
            torrents: entries,
            download_rate,
            upload_rate,
            torrent_count,
            active_torrent_count: torrent_count - paused,
            paused_torrent_count: paused,
            listen_interface: self
                .effective_listen
                .clone()
                .or_else(|| Some(settings.listen_interface.clone())),
            listen_error: self.listen_error.clone(),
            cumulative_stats: self.state.cumulative(),
            current_stats: self.state.current(totals, now),
        };
        self.snapshot_cell.store(snapshot);
    }

    // ---- periodic work ----------------------------------------------------

    async fn refresh_speed_limits(&mut self, force: bool) {
        let settings = self.config.get();
        let active = should_use_alt_speed(&settings);
        if !force && active == self.alt_speed_active {
            return;
        }
        let flipped = active != self.alt_speed_active;
        self.alt_speed_active = active;
        let pack = rate_limit_pack(&settings, active);
        if let Err(err) = self.backend.apply_settings(&pack).await {
            warn!(error = %err, "rate limit application failed");
            return;
        }
        if flipped {
            info!(active, "alt-speed state changed");
            let _ = self.bus.publish(Event::AltSpeedChanged { active });
        }
    }

    async fn housekeeping(&mut self) {
        let now = Instant::now();
        if now < self.next_housekeeping {
            return;
        }
        self.next_housekeeping = now + HOUSEKEEPING_INTERVAL;

        if self.automation.watch_active() {
            let dir = self.automation.watch_dir().to_path_buf();
            self.relay(
                self.io.submit(move || {
                    let entries = collect_watch_entries(&dir);
                    (entries, Instant::now())
                }),
                |(entries, collected_at)| {
                    Some(EngineCommand::WatchEntriesCollected {
                        entries,
                        collected_at,
                    })
                },
            );
        }

        if let Some(stats) = self.state.take_flush(now, false) {
            self.persist_statistics(stats).await;
        }
        self.history.retention();
    }

    async fn persist_statistics(&mut self, stats: SessionStatistics) {
        self.persistence
            .persist_statistics(SessionStatisticsRow {
                uploaded_bytes: stats.uploaded_bytes,
                downloaded_bytes: stats.downloaded_bytes,
                seconds_active: stats.seconds_active,
                session_count: stats.session_count,
            })
            .await;
    }

    async fn flush_settings_if_due(&mut self, force: bool) {
        if let Some(settings) = self.config.take_flush(Instant::now(), force) {
            self.persistence.persist_settings(settings.to_entries()).await;
        }
    }

    // ---- shutdown ---------------------------------------------------------

    async fn begin_resume_save(&mut self, now: Instant) {
        self.save_resume_in_progress = true;
        let hashes = self.backend.torrent_hashes();
        for hash in &hashes {
            if let Err(err) = self.backend.request_resume_data(hash).await {
                debug!(hash = %hash, error = %err, "resume request failed");
            }
        }
        let pending = self.resume.begin(hashes, now);
        info!(pending = self.resume.pending_len(), "resume-data save started");
        if !pending {
            debug!("no torrents pending resume data");
        }
    }

    fn should_exit(&self, now: Instant) -> bool {
        if !self.save_resume_in_progress {
            return true;
        }
        if self.resume.pending_len() == 0 {
            return true;
        }
        if !self.resume.in_progress(now) {
            info!("resume-data quiet deadline reached");
            return true;
        }
        if let Some(started) = self.shutdown.started_at() {
            if now.saturating_duration_since(started) >= SHUTDOWN_TIMEOUT {
                warn!(
                    pending = self.resume.pending_len(),
                    "shutdown timeout reached; forcing exit"
                );
                return true;
            }
        }
        false
    }

    async fn finalize(mut self) {
        self.io.stop();
        self.history.flush(true);

        match self.backend.save_state().await {
            Ok(blob) => {
                if let Err(err) = std::fs::write(&self.dht_state_path, blob) {
                    warn!(
                        path = %self.dht_state_path.display(),
                        error = %err,
                        "session state write failed"
                    );
                }
            }
            Err(err) => warn!(error = %err, "session state serialisation failed"),
        }

        if let Some(stats) = self.state.take_flush(Instant::now(), true) {
            self.persist_statistics(stats).await;
        }
        self.flush_settings_if_due(true).await;

        let Self {
            history,
            history_join,
            persistence,
            persistence_join,
            ..
        } = self;
        drop(history);
        if let Err(err) = history_join.await {
            warn!(error = %err, "history worker join failed");
        }
        persistence.close();
        if let Err(err) = persistence_join.await {
            warn!(error = %err, "persistence writer join failed");
        }
        info!("engine stopped");
    }

    // ---- io plumbing ------------------------------------------------------

    fn relay<T, F>(&self, handle: Option<JoinHandle<T>>, map: F)
    where
        T: Send + 'static,
        F: FnOnce(T) -> Option<EngineCommand> + Send + 'static,
    {
        let Some(handle) = handle else {
            return;
        };
        let tx = self.commands_tx.clone();
        tokio::spawn(async move {
            match handle.await {
                Ok(value) => {
                    if let Some(command) = map(value) {
                        let _ = tx.send(command).await;
                    }
                }
                Err(err) => warn!(error = %err, "io task panicked"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_formatting_brackets_ipv6() {
        assert_eq!(format_endpoint("0.0.0.0", 6_881), "0.0.0.0:6881");
        assert_eq!(format_endpoint("::1", 6_881), "[::1]:6881");
    }

    #[test]
    fn shutdown_latch_records_first_request() {
        let shutdown = Shutdown::default();
        assert!(!shutdown.is_requested());
        assert!(shutdown.started_at().is_none());
        shutdown.request();
        let first = shutdown.started_at().expect("stamped");
        shutdown.request();
        assert_eq!(shutdown.started_at(), Some(first));
        assert!(shutdown.is_requested());
    }
}
