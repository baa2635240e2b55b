use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tinytorrent_session::{InfoHash, TorrentStatus};
use tracing::{info, warn};

/// Watch files above this size are ignored outright.
pub const MAX_WATCH_FILE_SIZE: u64 = 64 * 1024 * 1024;

/// A watch file must keep its size and mtime this long before ingestion.
pub const WATCH_STABILITY_THRESHOLD: Duration = Duration::from_secs(3);

/// Give up on move-on-complete name collisions past this many suffixes.
const MAX_COMPLETION_ATTEMPTS: u32 = 1_024;

/// One candidate file observed in the watch directory.
#[derive(Debug, Clone)]
pub struct WatchEntry {
    /// Absolute path of the `.torrent` file.
    pub path: PathBuf,
    /// File size at scan time.
    pub size: u64,
    /// Modification time at scan time.
    pub mtime: SystemTime,
}

#[derive(Debug)]
struct WatchFileSnapshot {
    size: u64,
    mtime: SystemTime,
    last_change: Instant,
}

/// Watch-directory ingestion and move-on-complete scheduling.
///
/// The agent owns only bookkeeping; every filesystem touch happens on the
/// I/O service, with results handed back through the engine's command
/// queue.
#[derive(Debug, Default)]
pub struct AutomationAgent {
    watch_dir: PathBuf,
    watch_enabled: bool,
    download_path: PathBuf,
    incomplete_dir: PathBuf,
    incomplete_enabled: bool,
    snapshots: HashMap<PathBuf, WatchFileSnapshot>,
    pending_moves: HashMap<InfoHash, PathBuf>,
}

impl AutomationAgent {
    /// An agent with nothing configured.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the directory configuration; changing or disabling the watch
    /// directory forgets all stability snapshots.
    pub fn configure(
        &mut self,
        watch_dir: PathBuf,
        watch_enabled: bool,
        download_path: PathBuf,
        incomplete_dir: PathBuf,
        incomplete_enabled: bool,
    ) {
        let dir_changed = self.watch_dir != watch_dir;
        self.watch_dir = watch_dir;
        self.watch_enabled = watch_enabled;
        self.download_path = download_path;
        self.incomplete_dir = incomplete_dir;
        self.incomplete_enabled = incomplete_enabled;
        if !self.watch_enabled || self.watch_dir.as_os_str().is_empty() || dir_changed {
            self.snapshots.clear();
        }
    }

    /// Update just the completed-download directory.
    pub fn set_download_path(&mut self, download_path: PathBuf) {
        self.download_path = download_path;
    }

    /// Whether scans should run at all.
    #[must_use]
    pub fn watch_active(&self) -> bool {
        self.watch_enabled && !self.watch_dir.as_os_str().is_empty()
    }

    /// The configured watch directory.
    #[must_use]
    pub fn watch_dir(&self) -> &Path {
        &self.watch_dir
    }

    /// The completed-download directory.
    #[must_use]
    pub fn download_path(&self) -> &Path {
        &self.download_path
    }

    /// Fold one scan's entries into the stability tracker.
    ///
    /// Returns the entries whose size and mtime have been unchanged for the
    /// stability threshold; snapshots for vanished files are dropped.
    pub fn process_entries(&mut self, entries: Vec<WatchEntry>, now: Instant) -> Vec<WatchEntry> {
        let mut stable = Vec::new();
        let mut seen = Vec::with_capacity(entries.len());
        for entry in entries {
            seen.push(entry.path.clone());
            match self.snapshots.get_mut(&entry.path) {
                None => {
                    self.snapshots.insert(
                        entry.path.clone(),
                        WatchFileSnapshot {
                            size: entry.size,
                            mtime: entry.mtime,
                            last_change: now,
                        },
                    );
                }
                Some(snapshot) => {
                    if snapshot.size != entry.size || snapshot.mtime != entry.mtime {
                        snapshot.size = entry.size;
                        snapshot.mtime = entry.mtime;
                        snapshot.last_change = now;
                    } else if now.saturating_duration_since(snapshot.last_change)
                        >= WATCH_STABILITY_THRESHOLD
                    {
                        stable.push(entry);
                    }
                }
            }
        }
        self.snapshots.retain(|path, _| seen.contains(path));
        stable
    }

    /// Forget the snapshot for an ingested or renamed file.
    pub fn forget(&mut self, path: &Path) {
        self.snapshots.remove(path);
    }

    /// Whether a finished torrent qualifies for move-on-complete.
    #[must_use]
    pub fn should_move_on_complete(&self, status: &TorrentStatus) -> bool {
        if !self.incomplete_enabled
            || self.incomplete_dir.as_os_str().is_empty()
            || self.download_path.as_os_str().is_empty()
        {
            return false;
        }
        if Path::new(&status.save_path) != self.incomplete_dir {
            return false;
        }
        if !status.is_seeding {
            return false;
        }
        self.download_path != self.incomplete_dir
    }

    /// Record the destination a storage move is expected to land at.
    pub fn note_pending_move(&mut self, hash: InfoHash, destination: PathBuf) {
        if !destination.as_os_str().is_empty() {
            self.pending_moves.insert(hash, destination);
        }
    }

    /// Take the pending destination once the move completed.
    pub fn complete_move(&mut self, hash: &InfoHash) -> Option<PathBuf> {
        self.pending_moves.remove(hash)
    }

    /// Drop the pending destination after a failed move.
    pub fn cancel_move(&mut self, hash: &InfoHash) -> Option<PathBuf> {
        self.pending_moves.remove(hash)
    }

    /// The destination a hash is currently moving toward.
    #[must_use]
    pub fn pending_move(&self, hash: &InfoHash) -> Option<&PathBuf> {
        self.pending_moves.get(hash)
    }
}

/// Enumerate `.torrent` candidates under `watch_dir`. Runs on the I/O
/// service; the directory is created when absent.
#[must_use]
pub fn collect_watch_entries(watch_dir: &Path) -> Vec<WatchEntry> {
    let mut result = Vec::new();
    if watch_dir.as_os_str().is_empty() {
        return result;
    }
    if let Err(err) = std::fs::create_dir_all(watch_dir) {
        warn!(dir = %watch_dir.display(), error = %err, "failed to create watch-dir");
        return result;
    }
    let entries = match std::fs::read_dir(watch_dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %watch_dir.display(), error = %err, "watch-dir iteration failed");
            return result;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("torrent") {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        if metadata.len() > MAX_WATCH_FILE_SIZE {
            info!(
                file = %path.display(),
                bytes = metadata.len(),
                "watch-dir skipping oversized file"
            );
            continue;
        }
        let Ok(mtime) = metadata.modified() else {
            continue;
        };
        result.push(WatchEntry {
            path,
            size: metadata.len(),
            mtime,
        });
    }
    result
}

/// Read stable watch files into memory. Runs on the I/O service.
#[must_use]
pub fn read_watch_files(entries: Vec<WatchEntry>) -> Vec<(WatchEntry, Vec<u8>)> {
    entries
        .into_iter()
        .map(|entry| {
            let bytes = std::fs::read(&entry.path).unwrap_or_default();
            (entry, bytes)
        })
        .collect()
}

/// Rename a processed watch file by appending `suffix` (".added" or
/// ".invalid"). Runs on the I/O service.
pub fn mark_watch_file(source: &Path, suffix: &str) {
    if source.as_os_str().is_empty() {
        return;
    }
    let mut target = source.as_os_str().to_owned();
    target.push(suffix);
    let target = PathBuf::from(target);
    let _ = std::fs::remove_file(&target);
    if let Err(err) = std::fs::rename(source, &target) {
        warn!(file = %source.display(), error = %err, "failed to rename watch file");
    }
}

/// Resolve the move-on-complete destination. Runs on the I/O service.
///
/// The base directory is probed, never created; when it is a directory the
/// torrent's name (or hash) is appended. Collisions are resolved with
/// ` (N)` suffixes up to the attempt cap.
#[must_use]
pub fn determine_completion_destination(
    base: &Path,
    current: &Path,
    name: &str,
    hash: &str,
) -> Option<PathBuf> {
    if base.as_os_str().is_empty() {
        return None;
    }
    let base_exists = base.exists();
    let mut candidate = base.to_path_buf();
    if base_exists && base.is_dir() {
        let safe_name = if name.is_empty() { hash } else { name };
        candidate.push(safe_name);
    }
    resolve_unique_target(&candidate, current)
}

fn resolve_unique_target(target: &Path, current: &Path) -> Option<PathBuf> {
    if target.as_os_str().is_empty() {
        return None;
    }
    if target == current {
        return Some(target.to_path_buf());
    }
    if !target.exists() {
        return Some(target.to_path_buf());
    }
    let parent = target.parent().unwrap_or_else(|| Path::new(""));
    let stem = target
        .file_stem()
        .or_else(|| target.file_name())
        .and_then(|value| value.to_str())
        .unwrap_or_default();
    let extension = target
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| format!(".{value}"))
        .unwrap_or_default();
    for index in 1..=MAX_COMPLETION_ATTEMPTS {
        let candidate = parent.join(format!("{stem} ({index}){extension}"));
        if !candidate.exists() {
            return Some(candidate);
        }
    }
    warn!(
        target = %target.display(),
        attempts = MAX_COMPLETION_ATTEMPTS,
        "unable to find unique completion destination"
    );
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tinytorrent_session::TorrentStatus;

    fn entry(path: &Path, size: u64, mtime: SystemTime) -> WatchEntry {
        WatchEntry {
            path: path.to_path_buf(),
            size,
            mtime,
        }
    }

    fn configured_agent() -> AutomationAgent {
        let mut agent = AutomationAgent::new();
        agent.configure(
            PathBuf::from("/watch"),
            true,
            PathBuf::from("/library"),
            PathBuf::from("/scratch"),
            true,
        );
        agent
    }

    #[test]
    fn files_become_stable_after_the_threshold() {
        let mut agent = configured_agent();
        let path = PathBuf::from("/watch/demo.torrent");
        let mtime = SystemTime::now();
        let t0 = Instant::now();

        assert!(agent.process_entries(vec![entry(&path, 4, mtime)], t0).is_empty());
        // Unchanged but not old enough.
        assert!(
            agent
                .process_entries(vec![entry(&path, 4, mtime)], t0 + Duration::from_secs(1))
                .is_empty()
        );
        let stable =
            agent.process_entries(vec![entry(&path, 4, mtime)], t0 + Duration::from_secs(3));
        assert_eq!(stable.len(), 1);
    }

    #[test]
    fn growth_resets_the_stability_clock() {
        let mut agent = configured_agent();
        let path = PathBuf::from("/watch/demo.torrent");
        let mtime = SystemTime::now();
        let t0 = Instant::now();

        let _ = agent.process_entries(vec![entry(&path, 4, mtime)], t0);
        // Grows just before it would have become stable.
        let _ = agent.process_entries(vec![entry(&path, 8, mtime)], t0 + Duration::from_secs(2));
        assert!(
            agent
                .process_entries(vec![entry(&path, 8, mtime)], t0 + Duration::from_secs(4))
                .is_empty(),
            "only two seconds since the growth"
        );
        assert_eq!(
            agent
                .process_entries(vec![entry(&path, 8, mtime)], t0 + Duration::from_secs(5))
                .len(),
            1
        );
    }

    #[test]
    fn vanished_files_lose_their_snapshots() {
        let mut agent = configured_agent();
        let path = PathBuf::from("/watch/demo.torrent");
        let mtime = SystemTime::now();
        let t0 = Instant::now();
        let _ = agent.process_entries(vec![entry(&path, 4, mtime)], t0);
        let _ = agent.process_entries(Vec::new(), t0 + Duration::from_secs(1));
        // Reappearing restarts the clock from scratch.
        assert!(
            agent
                .process_entries(vec![entry(&path, 4, mtime)], t0 + Duration::from_secs(10))
                .is_empty()
        );
    }

    #[test]
    fn move_on_complete_gate() {
        let agent = configured_agent();
        let mut status = TorrentStatus::new(InfoHash::from_bytes([1; 20]));
        status.save_path = "/scratch".to_string();
        status.is_seeding = true;
        assert!(agent.should_move_on_complete(&status));

        status.save_path = "/library".to_string();
        assert!(!agent.should_move_on_complete(&status), "already moved");

        status.save_path = "/scratch".to_string();
        status.is_seeding = false;
        assert!(!agent.should_move_on_complete(&status));
    }

    #[test]
    fn pending_moves_complete_and_cancel() {
        let mut agent = configured_agent();
        let hash = InfoHash::from_bytes([2; 20]);
        agent.note_pending_move(hash, PathBuf::from("/library/demo"));
        assert!(agent.pending_move(&hash).is_some());
        assert_eq!(
            agent.complete_move(&hash),
            Some(PathBuf::from("/library/demo"))
        );
        assert!(agent.cancel_move(&hash).is_none());
    }

    #[test]
    fn destination_resolution_appends_suffixes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path();
        std::fs::create_dir(base.join("demo")).expect("occupy name");
        std::fs::create_dir(base.join("demo (1)")).expect("occupy first suffix");

        let destination =
            determine_completion_destination(base, Path::new("/scratch"), "demo", "feed")
                .expect("destination");
        assert_eq!(destination, base.join("demo (2)"));
    }

    #[test]
    fn missing_base_yields_no_destination() {
        let destination = determine_completion_destination(
            Path::new("/does/not/exist/anywhere"),
            Path::new("/scratch"),
            "demo",
            "feed",
        );
        // The base is probed but never created; a missing base resolves to
        // the base path itself only if its parent chain exists.
        assert_eq!(
            destination,
            Some(PathBuf::from("/does/not/exist/anywhere")),
            "non-existent base is returned as-is for the backend to reject"
        );
    }

    #[test]
    fn collision_exhaustion_returns_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path();
        std::fs::create_dir(base.join("demo")).expect("occupy name");
        for index in 1..=1_024 {
            std::fs::create_dir(base.join(format!("demo ({index})"))).expect("occupy suffix");
        }
        assert!(
            determine_completion_destination(base, Path::new("/scratch"), "demo", "feed").is_none()
        );
    }
}
