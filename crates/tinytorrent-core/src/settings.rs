use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tinytorrent_session::{EncryptionMode, ProxyKind, ProxySpec, SettingsPack};

/// Minutes in a day; schedule boundaries are clamped below this.
const MINUTES_PER_DAY: i64 = 24 * 60;

/// Speed-history sampling configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Whether rate samples are recorded at all.
    pub enabled: bool,
    /// Bucket width in seconds; values below 60 are raised to 60.
    pub interval_seconds: i64,
    /// Prune buckets older than this many days; `0` keeps everything.
    pub retention_days: i64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 60,
            retention_days: 30,
        }
    }
}

impl HistoryConfig {
    /// Interval with the 60-second floor applied.
    #[must_use]
    pub const fn effective_interval(&self) -> i64 {
        if self.interval_seconds < 60 {
            60
        } else {
            self.interval_seconds
        }
    }
}

/// The daemon's effective settings.
///
/// One flat record: the configuration service hands out copies and the
/// engine derives backend settings packs from the relevant slices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreSettings {
    /// Directory completed payloads live in.
    pub download_path: PathBuf,
    /// Directory in-progress payloads live in when enabled.
    pub incomplete_dir: PathBuf,
    /// Whether `incomplete_dir` is used for new torrents.
    pub incomplete_dir_enabled: bool,
    /// Directory scanned for `.torrent` files.
    pub watch_dir: PathBuf,
    /// Whether watch-dir ingestion runs.
    pub watch_dir_enabled: bool,
    /// Normalised `host:port` (or `[v6]:port`) listen endpoint.
    pub listen_interface: String,
    /// Peer-connection encryption policy.
    pub encryption: EncryptionMode,
    /// DHT participation.
    pub dht_enabled: bool,
    /// Peer exchange.
    pub pex_enabled: bool,
    /// Local peer discovery.
    pub lpd_enabled: bool,
    /// uTP transport.
    pub utp_enabled: bool,
    /// Global download cap in kbps.
    pub download_rate_limit_kbps: i64,
    /// Whether the download cap is enforced.
    pub download_rate_limit_enabled: bool,
    /// Global upload cap in kbps.
    pub upload_rate_limit_kbps: i64,
    /// Whether the upload cap is enforced.
    pub upload_rate_limit_enabled: bool,
    /// Alternative download cap in kbps (`0` = unlimited).
    pub alt_download_rate_limit_kbps: i64,
    /// Alternative upload cap in kbps (`0` = unlimited).
    pub alt_upload_rate_limit_kbps: i64,
    /// Alternative limits forced on, regardless of schedule.
    pub alt_speed_enabled: bool,
    /// Whether the weekly schedule below is evaluated.
    pub alt_speed_time_enabled: bool,
    /// Schedule start, minute of day.
    pub alt_speed_time_begin: i64,
    /// Schedule end, minute of day.
    pub alt_speed_time_end: i64,
    /// Day-of-week bitmask, Sunday = bit 0; `0` means every day.
    pub alt_speed_time_day: i64,
    /// Concurrent active downloads.
    pub download_queue_size: i32,
    /// Concurrent active seeds.
    pub seed_queue_size: i32,
    /// Whether stalled torrents consume queue slots.
    pub queue_stalled_enabled: bool,
    /// Global peer connection cap.
    pub peer_limit: i32,
    /// Per-torrent peer connection cap.
    pub peer_limit_per_torrent: i32,
    /// Proxy protocol.
    pub proxy_type: ProxyKind,
    /// Proxy host.
    pub proxy_host: String,
    /// Proxy port.
    pub proxy_port: u16,
    /// Whether proxy credentials are sent.
    pub proxy_auth_enabled: bool,
    /// Proxy username.
    pub proxy_username: String,
    /// Proxy password.
    pub proxy_password: String,
    /// Route peer connections through the proxy.
    pub proxy_peer_connections: bool,
    /// Global seed ratio limit.
    pub seed_ratio_limit: f64,
    /// Whether the global ratio limit pauses seeding torrents.
    pub seed_ratio_enabled: bool,
    /// Whether the global idle limit pauses seeding torrents.
    pub seed_idle_enabled: bool,
    /// Global idle limit in minutes.
    pub seed_idle_limit_minutes: i64,
    /// Append a partial suffix to incomplete files.
    pub rename_partial_files: bool,
    /// Speed-history sampling configuration.
    pub history: HistoryConfig,
    /// Engine idle sleep in milliseconds.
    pub idle_sleep_ms: u64,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            download_path: PathBuf::from("data"),
            incomplete_dir: PathBuf::new(),
            incomplete_dir_enabled: false,
            watch_dir: PathBuf::new(),
            watch_dir_enabled: false,
            listen_interface: "0.0.0.0:6881".to_string(),
            encryption: EncryptionMode::Tolerated,
            dht_enabled: true,
            pex_enabled: true,
            lpd_enabled: true,
            utp_enabled: true,
            download_rate_limit_kbps: 0,
            download_rate_limit_enabled: false,
            upload_rate_limit_kbps: 0,
            upload_rate_limit_enabled: false,
            alt_download_rate_limit_kbps: 50,
            alt_upload_rate_limit_kbps: 50,
            alt_speed_enabled: false,
            alt_speed_time_enabled: false,
            alt_speed_time_begin: 540,
            alt_speed_time_end: 1_020,
            alt_speed_time_day: 0,
            download_queue_size: 5,
            seed_queue_size: 10,
            queue_stalled_enabled: true,
            peer_limit: 200,
            peer_limit_per_torrent: 50,
            proxy_type: ProxyKind::None,
            proxy_host: String::new(),
            proxy_port: 0,
            proxy_auth_enabled: false,
            proxy_username: String::new(),
            proxy_password: String::new(),
            proxy_peer_connections: false,
            seed_ratio_limit: 2.0,
            seed_ratio_enabled: false,
            seed_idle_enabled: false,
            seed_idle_limit_minutes: 30,
            rename_partial_files: true,
            history: HistoryConfig::default(),
            idle_sleep_ms: 500,
        }
    }
}

/// Optional-per-field settings diff carried by the `session-set` command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionUpdate {
    /// New listen endpoint (normalised before it is stored).
    pub listen_interface: Option<String>,
    /// New download directory.
    pub download_path: Option<PathBuf>,
    /// New incomplete directory.
    pub incomplete_dir: Option<PathBuf>,
    /// Toggle use of the incomplete directory.
    pub incomplete_dir_enabled: Option<bool>,
    /// New watch directory.
    pub watch_dir: Option<PathBuf>,
    /// Toggle watch-dir ingestion.
    pub watch_dir_enabled: Option<bool>,
    /// New encryption policy.
    pub encryption: Option<EncryptionMode>,
    /// Toggle DHT.
    pub dht_enabled: Option<bool>,
    /// Toggle PEX.
    pub pex_enabled: Option<bool>,
    /// Toggle local peer discovery.
    pub lpd_enabled: Option<bool>,
    /// Toggle uTP.
    pub utp_enabled: Option<bool>,
    /// Download cap in kbps.
    pub download_rate_limit_kbps: Option<i64>,
    /// Toggle download cap.
    pub download_rate_limit_enabled: Option<bool>,
    /// Upload cap in kbps.
    pub upload_rate_limit_kbps: Option<i64>,
    /// Toggle upload cap.
    pub upload_rate_limit_enabled: Option<bool>,
    /// Alt download cap in kbps.
    pub alt_speed_down_kbps: Option<i64>,
    /// Alt upload cap in kbps.
    pub alt_speed_up_kbps: Option<i64>,
    /// Force alt limits on or off.
    pub alt_speed_enabled: Option<bool>,
    /// Toggle the weekly schedule.
    pub alt_speed_time_enabled: Option<bool>,
    /// Schedule start minute.
    pub alt_speed_time_begin: Option<i64>,
    /// Schedule end minute.
    pub alt_speed_time_end: Option<i64>,
    /// Schedule day bitmask.
    pub alt_speed_time_day: Option<i64>,
    /// Concurrent active downloads.
    pub download_queue_size: Option<i32>,
    /// Concurrent active seeds.
    pub seed_queue_size: Option<i32>,
    /// Toggle stalled-torrent queue accounting.
    pub queue_stalled_enabled: Option<bool>,
    /// Global peer cap.
    pub peer_limit: Option<i32>,
    /// Per-torrent peer cap.
    pub peer_limit_per_torrent: Option<i32>,
    /// Proxy protocol.
    pub proxy_type: Option<ProxyKind>,
    /// Proxy host.
    pub proxy_host: Option<String>,
    /// Proxy port.
    pub proxy_port: Option<u16>,
    /// Toggle proxy credentials.
    pub proxy_auth_enabled: Option<bool>,
    /// Proxy username.
    pub proxy_username: Option<String>,
    /// Proxy password.
    pub proxy_password: Option<String>,
    /// Toggle proxying peer connections.
    pub proxy_peer_connections: Option<bool>,
    /// Global seed ratio limit.
    pub seed_ratio_limit: Option<f64>,
    /// Toggle the global ratio limit.
    pub seed_ratio_enabled: Option<bool>,
    /// Toggle the global idle limit.
    pub seed_idle_enabled: Option<bool>,
    /// Global idle limit in minutes.
    pub seed_idle_limit: Option<i64>,
    /// Toggle the partial-file suffix.
    pub rename_partial_files: Option<bool>,
    /// Toggle history recording.
    pub history_enabled: Option<bool>,
    /// History bucket width in seconds.
    pub history_interval: Option<i64>,
    /// History retention in days.
    pub history_retention_days: Option<i64>,
}

/// Which settings categories an update touched.
///
/// The engine applies only the matching settings-pack subsets to the
/// backend and reconfigures the matching subsystems.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsDelta {
    /// Encryption policy changed.
    pub encryption: bool,
    /// Listen interface, discovery toggles or peer limits changed.
    pub network: bool,
    /// Queue sizes or stalled accounting changed.
    pub queue: bool,
    /// Alt-speed limits, toggle or schedule changed.
    pub alt_speed: bool,
    /// Proxy configuration changed.
    pub proxy: bool,
    /// PEX toggle changed.
    pub pex: bool,
    /// Partial-file suffix toggle changed.
    pub partfile: bool,
    /// History configuration changed.
    pub history: bool,
    /// Download/incomplete/watch directories changed.
    pub paths: bool,
    /// Global rate limits changed.
    pub limits: bool,
    /// Global seed ratio/idle limits changed.
    pub seed_limits: bool,
}

impl SettingsDelta {
    /// Whether any category changed.
    #[must_use]
    pub const fn any(&self) -> bool {
        self.encryption
            || self.network
            || self.queue
            || self.alt_speed
            || self.proxy
            || self.pex
            || self.partfile
            || self.history
            || self.paths
            || self.limits
            || self.seed_limits
    }

    /// A delta with every category set, for initial application.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            encryption: true,
            network: true,
            queue: true,
            alt_speed: true,
            proxy: true,
            pex: true,
            partfile: true,
            history: true,
            paths: true,
            limits: true,
            seed_limits: true,
        }
    }
}

fn clamp_minute(value: i64) -> i64 {
    value.clamp(0, MINUTES_PER_DAY - 1)
}

impl CoreSettings {
    /// Fold a diff into the settings, reporting which categories changed.
    pub fn apply(&mut self, update: &SessionUpdate) -> SettingsDelta {
        let mut delta = SettingsDelta::default();

        macro_rules! set {
            ($field:ident, $source:expr, $category:ident) => {
                if let Some(value) = $source.clone() {
                    if self.$field != value {
                        self.$field = value;
                        delta.$category = true;
                    }
                }
            };
        }

        if let Some(raw) = update.listen_interface.as_deref() {
            let normalised = normalize_listen_interface(raw);
            if self.listen_interface != normalised {
                self.listen_interface = normalised;
                delta.network = true;
            }
        }
        set!(download_path, update.download_path, paths);
        set!(incomplete_dir, update.incomplete_dir, paths);
        set!(incomplete_dir_enabled, update.incomplete_dir_enabled, paths);
        set!(watch_dir, update.watch_dir, paths);
        set!(watch_dir_enabled, update.watch_dir_enabled, paths);
        set!(encryption, update.encryption, encryption);
        set!(dht_enabled, update.dht_enabled, network);
        set!(pex_enabled, update.pex_enabled, pex);
        set!(lpd_enabled, update.lpd_enabled, network);
        set!(utp_enabled, update.utp_enabled, network);
        if let Some(value) = update.download_rate_limit_kbps {
            let value = value.max(0);
            if self.download_rate_limit_kbps != value {
                self.download_rate_limit_kbps = value;
                delta.limits = true;
            }
        }
        set!(
            download_rate_limit_enabled,
            update.download_rate_limit_enabled,
            limits
        );
        if let Some(value) = update.upload_rate_limit_kbps {
            let value = value.max(0);
            if self.upload_rate_limit_kbps != value {
                self.upload_rate_limit_kbps = value;
                delta.limits = true;
            }
        }
        set!(
            upload_rate_limit_enabled,
            update.upload_rate_limit_enabled,
            limits
        );
        if let Some(value) = update.alt_speed_down_kbps {
            let value = value.max(0);
            if self.alt_download_rate_limit_kbps != value {
                self.alt_download_rate_limit_kbps = value;
                delta.alt_speed = true;
            }
        }
        if let Some(value) = update.alt_speed_up_kbps {
            let value = value.max(0);
            if self.alt_upload_rate_limit_kbps != value {
                self.alt_upload_rate_limit_kbps = value;
                delta.alt_speed = true;
            }
        }
        set!(alt_speed_enabled, update.alt_speed_enabled, alt_speed);
        set!(
            alt_speed_time_enabled,
            update.alt_speed_time_enabled,
            alt_speed
        );
        if let Some(value) = update.alt_speed_time_begin {
            let value = clamp_minute(value);
            if self.alt_speed_time_begin != value {
                self.alt_speed_time_begin = value;
                delta.alt_speed = true;
            }
        }
        if let Some(value) = update.alt_speed_time_end {
            let value = clamp_minute(value);
            if self.alt_speed_time_end != value {
                self.alt_speed_time_end = value;
                delta.alt_speed = true;
            }
        }
        set!(alt_speed_time_day, update.alt_speed_time_day, alt_speed);
        set!(download_queue_size, update.download_queue_size, queue);
        set!(seed_queue_size, update.seed_queue_size, queue);
        set!(queue_stalled_enabled, update.queue_stalled_enabled, queue);
        set!(peer_limit, update.peer_limit, network);
        set!(peer_limit_per_torrent, update.peer_limit_per_torrent, network);
        set!(proxy_type, update.proxy_type, proxy);
        set!(proxy_host, update.proxy_host, proxy);
        set!(proxy_port, update.proxy_port, proxy);
        set!(proxy_auth_enabled, update.proxy_auth_enabled, proxy);
        set!(proxy_username, update.proxy_username, proxy);
        set!(proxy_password, update.proxy_password, proxy);
        set!(
            proxy_peer_connections,
            update.proxy_peer_connections,
            proxy
        );
        if let Some(value) = update.seed_ratio_limit {
            if (self.seed_ratio_limit - value).abs() > f64::EPSILON {
                self.seed_ratio_limit = value.max(0.0);
                delta.seed_limits = true;
            }
        }
        set!(seed_ratio_enabled, update.seed_ratio_enabled, seed_limits);
        set!(seed_idle_enabled, update.seed_idle_enabled, seed_limits);
        set!(seed_idle_limit_minutes, update.seed_idle_limit, seed_limits);
        set!(rename_partial_files, update.rename_partial_files, partfile);
        if let Some(value) = update.history_enabled {
            if self.history.enabled != value {
                self.history.enabled = value;
                delta.history = true;
            }
        }
        if let Some(value) = update.history_interval {
            if self.history.interval_seconds != value {
                self.history.interval_seconds = value;
                delta.history = true;
            }
        }
        if let Some(value) = update.history_retention_days {
            if self.history.retention_days != value {
                self.history.retention_days = value;
                delta.history = true;
            }
        }
        delta
    }

    /// Build the backend settings pack for the changed categories.
    #[must_use]
    pub fn session_pack(&self, delta: SettingsDelta) -> SettingsPack {
        let mut pack = SettingsPack::default();
        if delta.network {
            pack.listen_interface = Some(self.listen_interface.clone());
            pack.enable_dht = Some(self.dht_enabled);
            pack.enable_lsd = Some(self.lpd_enabled);
            pack.enable_utp = Some(self.utp_enabled);
            pack.peer_limit = Some(self.peer_limit);
            pack.peer_limit_per_torrent = Some(self.peer_limit_per_torrent);
        }
        if delta.pex {
            pack.enable_pex = Some(self.pex_enabled);
        }
        if delta.encryption {
            pack.encryption = Some(self.encryption);
        }
        if delta.queue {
            pack.download_queue_size = Some(self.download_queue_size);
            pack.seed_queue_size = Some(self.seed_queue_size);
            pack.queue_stalled_enabled = Some(self.queue_stalled_enabled);
        }
        if delta.proxy {
            pack.proxy = Some(ProxySpec {
                kind: self.proxy_type,
                host: self.proxy_host.clone(),
                port: self.proxy_port,
                username: if self.proxy_auth_enabled {
                    self.proxy_username.clone()
                } else {
                    String::new()
                },
                password: if self.proxy_auth_enabled {
                    self.proxy_password.clone()
                } else {
                    String::new()
                },
                peer_connections: self.proxy_peer_connections,
            });
        }
        if delta.partfile {
            pack.rename_partial_files = Some(self.rename_partial_files);
        }
        pack
    }

    /// The setting table rows for every persisted key.
    #[must_use]
    pub fn to_entries(&self) -> Vec<(&'static str, String)> {
        let bool_text = |value: bool| if value { "1" } else { "0" }.to_string();
        vec![
            ("listenInterface", self.listen_interface.clone()),
            ("historyEnabled", bool_text(self.history.enabled)),
            ("historyInterval", self.history.interval_seconds.to_string()),
            (
                "historyRetentionDays",
                self.history.retention_days.to_string(),
            ),
            ("altSpeedEnabled", bool_text(self.alt_speed_enabled)),
            ("altSpeedTime", bool_text(self.alt_speed_time_enabled)),
            ("altSpeedTimeBegin", self.alt_speed_time_begin.to_string()),
            ("altSpeedTimeEnd", self.alt_speed_time_end.to_string()),
            ("altSpeedTimeDay", self.alt_speed_time_day.to_string()),
            (
                "altSpeedDownload",
                self.alt_download_rate_limit_kbps.to_string(),
            ),
            ("altSpeedUpload", self.alt_upload_rate_limit_kbps.to_string()),
            ("seedRatioLimit", self.seed_ratio_limit.to_string()),
            ("seedRatioEnabled", bool_text(self.seed_ratio_enabled)),
            ("seedIdleEnabled", bool_text(self.seed_idle_enabled)),
            ("seedIdleLimit", self.seed_idle_limit_minutes.to_string()),
            ("peerLimit", self.peer_limit.to_string()),
            (
                "peerLimitPerTorrent",
                self.peer_limit_per_torrent.to_string(),
            ),
            ("dhtEnabled", bool_text(self.dht_enabled)),
            ("pexEnabled", bool_text(self.pex_enabled)),
            ("lpdEnabled", bool_text(self.lpd_enabled)),
            ("utpEnabled", bool_text(self.utp_enabled)),
            ("downloadQueueSize", self.download_queue_size.to_string()),
            ("seedQueueSize", self.seed_queue_size.to_string()),
            ("queueStalledEnabled", bool_text(self.queue_stalled_enabled)),
            ("renamePartialFiles", bool_text(self.rename_partial_files)),
            (
                "downloadPath",
                self.download_path.display().to_string(),
            ),
            ("incompleteDir", self.incomplete_dir.display().to_string()),
            (
                "incompleteDirEnabled",
                bool_text(self.incomplete_dir_enabled),
            ),
            ("watchDir", self.watch_dir.display().to_string()),
            ("watchDirEnabled", bool_text(self.watch_dir_enabled)),
            ("proxyType", proxy_kind_code(self.proxy_type).to_string()),
            ("proxyHost", self.proxy_host.clone()),
            ("proxyPort", self.proxy_port.to_string()),
            ("proxyAuthEnabled", bool_text(self.proxy_auth_enabled)),
            ("proxyUsername", self.proxy_username.clone()),
            ("proxyPassword", self.proxy_password.clone()),
            (
                "proxyPeerConnections",
                bool_text(self.proxy_peer_connections),
            ),
        ]
    }

    /// Rebuild settings from persisted rows, starting from `defaults`.
    #[must_use]
    pub fn from_entries<'a>(
        defaults: Self,
        entries: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let mut settings = defaults;
        for (key, value) in entries {
            settings.apply_entry(key, value);
        }
        settings
    }

    fn apply_entry(&mut self, key: &str, value: &str) {
        let as_bool = || value == "1";
        let as_i64 = || value.parse::<i64>().ok();
        let as_i32 = || value.parse::<i32>().ok();
        match key {
            "listenInterface" => self.listen_interface = normalize_listen_interface(value),
            "historyEnabled" => self.history.enabled = as_bool(),
            "historyInterval" => {
                if let Some(parsed) = as_i64() {
                    self.history.interval_seconds = parsed;
                }
            }
            "historyRetentionDays" => {
                if let Some(parsed) = as_i64() {
                    self.history.retention_days = parsed;
                }
            }
            "altSpeedEnabled" => self.alt_speed_enabled = as_bool(),
            "altSpeedTime" => self.alt_speed_time_enabled = as_bool(),
            "altSpeedTimeBegin" => {
                if let Some(parsed) = as_i64() {
                    self.alt_speed_time_begin = clamp_minute(parsed);
                }
            }
            "altSpeedTimeEnd" => {
                if let Some(parsed) = as_i64() {
                    self.alt_speed_time_end = clamp_minute(parsed);
                }
            }
            "altSpeedTimeDay" => {
                if let Some(parsed) = as_i64() {
                    self.alt_speed_time_day = parsed;
                }
            }
            "altSpeedDownload" => {
                if let Some(parsed) = parse_kbps(value) {
                    self.alt_download_rate_limit_kbps = parsed;
                }
            }
            "altSpeedUpload" => {
                if let Some(parsed) = parse_kbps(value) {
                    self.alt_upload_rate_limit_kbps = parsed;
                }
            }
            "seedRatioLimit" => {
                if let Ok(parsed) = value.parse::<f64>() {
                    self.seed_ratio_limit = parsed.max(0.0);
                }
            }
            "seedRatioEnabled" => self.seed_ratio_enabled = as_bool(),
            "seedIdleEnabled" => self.seed_idle_enabled = as_bool(),
            "seedIdleLimit" => {
                if let Some(parsed) = as_i64() {
                    self.seed_idle_limit_minutes = parsed;
                }
            }
            "peerLimit" => {
                if let Some(parsed) = as_i32() {
                    self.peer_limit = parsed;
                }
            }
            "peerLimitPerTorrent" => {
                if let Some(parsed) = as_i32() {
                    self.peer_limit_per_torrent = parsed;
                }
            }
            "dhtEnabled" => self.dht_enabled = as_bool(),
            "pexEnabled" => self.pex_enabled = as_bool(),
            "lpdEnabled" => self.lpd_enabled = as_bool(),
            "utpEnabled" => self.utp_enabled = as_bool(),
            "downloadQueueSize" => {
                if let Some(parsed) = as_i32() {
                    self.download_queue_size = parsed;
                }
            }
            "seedQueueSize" => {
                if let Some(parsed) = as_i32() {
                    self.seed_queue_size = parsed;
                }
            }
            "queueStalledEnabled" => self.queue_stalled_enabled = as_bool(),
            "renamePartialFiles" => self.rename_partial_files = as_bool(),
            "downloadPath" => self.download_path = PathBuf::from(value),
            "incompleteDir" => self.incomplete_dir = PathBuf::from(value),
            "incompleteDirEnabled" => self.incomplete_dir_enabled = as_bool(),
            "watchDir" => self.watch_dir = PathBuf::from(value),
            "watchDirEnabled" => self.watch_dir_enabled = as_bool(),
            "proxyType" => {
                if let Some(parsed) = as_i64() {
                    self.proxy_type = proxy_kind_from_code(parsed);
                }
            }
            "proxyHost" => self.proxy_host = value.to_string(),
            "proxyPort" => {
                if let Ok(parsed) = value.parse::<u16>() {
                    self.proxy_port = parsed;
                }
            }
            "proxyAuthEnabled" => self.proxy_auth_enabled = as_bool(),
            "proxyUsername" => self.proxy_username = value.to_string(),
            "proxyPassword" => self.proxy_password = value.to_string(),
            "proxyPeerConnections" => self.proxy_peer_connections = as_bool(),
            _ => {}
        }
    }
}

/// `altSpeedDownload` historically persisted as a stringified double.
fn parse_kbps(value: &str) -> Option<i64> {
    value
        .parse::<f64>()
        .ok()
        .map(|parsed| parsed.max(0.0).round() as i64)
}

const fn proxy_kind_code(kind: ProxyKind) -> i64 {
    match kind {
        ProxyKind::None => 0,
        ProxyKind::Socks4 => 1,
        ProxyKind::Socks5 => 2,
        ProxyKind::Http => 3,
    }
}

const fn proxy_kind_from_code(code: i64) -> ProxyKind {
    match code {
        1 => ProxyKind::Socks4,
        2 => ProxyKind::Socks5,
        3 => ProxyKind::Http,
        _ => ProxyKind::None,
    }
}

/// Normalise a listen endpoint to `host:port` / `[v6]:port` form.
///
/// Missing pieces fall back to host `0.0.0.0` and port `6881`. A bare IPv6
/// literal is recognised by its multiple colons and bracketed on output.
#[must_use]
pub fn normalize_listen_interface(input: &str) -> String {
    let trimmed = input.trim();
    let (host, port_text) = split_host_port(trimmed);
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    let port = port_text.trim().parse::<u16>().unwrap_or(6_881);
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn split_host_port(value: &str) -> (&str, &str) {
    if let Some(rest) = value.strip_prefix('[') {
        if let Some(close) = rest.find(']') {
            let host = &rest[..close];
            let tail = &rest[close + 1..];
            let port = tail.strip_prefix(':').unwrap_or("");
            return (host, port);
        }
        return (rest, "");
    }
    let colons = value.matches(':').count();
    match colons {
        0 => (value, ""),
        1 => {
            let (host, port) = value.split_once(':').unwrap_or((value, ""));
            (host, port)
        }
        // Multiple colons without brackets: a bare IPv6 literal.
        _ => (value, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_interface_normalisation() {
        assert_eq!(normalize_listen_interface(""), "0.0.0.0:6881");
        assert_eq!(normalize_listen_interface("0.0.0.0"), "0.0.0.0:6881");
        assert_eq!(normalize_listen_interface(":7000"), "0.0.0.0:7000");
        assert_eq!(normalize_listen_interface("10.0.0.1:51413"), "10.0.0.1:51413");
        assert_eq!(normalize_listen_interface("[::1]:6881"), "[::1]:6881");
        assert_eq!(normalize_listen_interface("::1"), "[::1]:6881");
        assert_eq!(normalize_listen_interface("[2001:db8::2]"), "[2001:db8::2]:6881");
        assert_eq!(normalize_listen_interface("host:notaport"), "host:6881");
    }

    #[test]
    fn apply_reports_changed_categories() {
        let mut settings = CoreSettings::default();
        let delta = settings.apply(&SessionUpdate {
            encryption: Some(EncryptionMode::Required),
            pex_enabled: Some(false),
            alt_speed_enabled: Some(true),
            download_path: Some(PathBuf::from("/library")),
            history_interval: Some(120),
            ..SessionUpdate::default()
        });
        assert!(delta.encryption);
        assert!(delta.pex);
        assert!(delta.alt_speed);
        assert!(delta.paths);
        assert!(delta.history);
        assert!(!delta.proxy);
        assert!(delta.any());
        assert_eq!(settings.encryption, EncryptionMode::Required);
        assert!(!settings.pex_enabled);
        assert_eq!(settings.history.interval_seconds, 120);
    }

    #[test]
    fn apply_is_a_no_op_for_equal_values() {
        let mut settings = CoreSettings::default();
        let delta = settings.apply(&SessionUpdate {
            dht_enabled: Some(settings.dht_enabled),
            peer_limit: Some(settings.peer_limit),
            ..SessionUpdate::default()
        });
        assert!(!delta.any());
    }

    #[test]
    fn schedule_minutes_are_clamped() {
        let mut settings = CoreSettings::default();
        let _ = settings.apply(&SessionUpdate {
            alt_speed_time_begin: Some(-5),
            alt_speed_time_end: Some(4_000),
            ..SessionUpdate::default()
        });
        assert_eq!(settings.alt_speed_time_begin, 0);
        assert_eq!(settings.alt_speed_time_end, 1_439);
    }

    #[test]
    fn entries_round_trip_every_key() {
        let mut original = CoreSettings::default();
        let _ = original.apply(&SessionUpdate {
            listen_interface: Some("[::1]:7001".to_string()),
            download_path: Some(PathBuf::from("/library")),
            incomplete_dir: Some(PathBuf::from("/scratch")),
            incomplete_dir_enabled: Some(true),
            watch_dir: Some(PathBuf::from("/watch")),
            watch_dir_enabled: Some(true),
            dht_enabled: Some(false),
            pex_enabled: Some(false),
            lpd_enabled: Some(false),
            utp_enabled: Some(false),
            alt_speed_down_kbps: Some(123),
            alt_speed_up_kbps: Some(45),
            alt_speed_enabled: Some(true),
            alt_speed_time_enabled: Some(true),
            alt_speed_time_begin: Some(540),
            alt_speed_time_end: Some(1_020),
            alt_speed_time_day: Some(0x3E),
            download_queue_size: Some(3),
            seed_queue_size: Some(4),
            queue_stalled_enabled: Some(false),
            peer_limit: Some(99),
            peer_limit_per_torrent: Some(12),
            proxy_type: Some(ProxyKind::Socks5),
            proxy_host: Some("proxy.local".to_string()),
            proxy_port: Some(1_080),
            proxy_auth_enabled: Some(true),
            proxy_username: Some("user".to_string()),
            proxy_password: Some("secret".to_string()),
            proxy_peer_connections: Some(true),
            seed_ratio_limit: Some(1.5),
            seed_ratio_enabled: Some(true),
            seed_idle_enabled: Some(true),
            seed_idle_limit: Some(45),
            rename_partial_files: Some(false),
            history_enabled: Some(false),
            history_interval: Some(300),
            history_retention_days: Some(7),
            ..SessionUpdate::default()
        });

        let entries = original.to_entries();
        let restored = CoreSettings::from_entries(
            CoreSettings::default(),
            entries.iter().map(|(key, value)| (*key, value.as_str())),
        );
        assert_eq!(restored, original);
    }

    #[test]
    fn session_pack_covers_only_requested_categories() {
        let settings = CoreSettings::default();
        let pack = settings.session_pack(SettingsDelta {
            pex: true,
            ..SettingsDelta::default()
        });
        assert_eq!(pack.enable_pex, Some(true));
        assert!(pack.listen_interface.is_none());
        assert!(pack.proxy.is_none());

        let full = settings.session_pack(SettingsDelta::all());
        assert!(full.listen_interface.is_some());
        assert!(full.proxy.is_some());
        assert_eq!(full.rename_partial_files, Some(true));
    }
}
