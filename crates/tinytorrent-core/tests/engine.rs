//! End-to-end engine scenarios driven through the public `Core` handle and
//! the in-memory session driver.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tempfile::TempDir;
use tinytorrent_core::{
    AddStatus, Core, CoreConfig, CoreSettings, SeedLimitUpdate, SessionUpdate, TorrentAddRequest,
};
use tinytorrent_data::StateStore;
use tinytorrent_events::{Event, EventBus};
use tinytorrent_session::{
    Alert, InfoHash, ListenProtocol, MemorySession, SessionDriver, TorrentState,
};
use tokio::time::sleep;

const POLL: Duration = Duration::from_millis(25);

struct Daemon {
    core: Core,
    driver: SessionDriver,
    store: StateStore,
}

async fn boot(root: &Path) -> Daemon {
    let store = StateStore::open(&root.join("tinytorrent.db"))
        .await
        .expect("state store opens");
    let session = MemorySession::new();
    let driver = session.driver();
    let defaults = CoreSettings {
        idle_sleep_ms: 25,
        download_path: root.join("downloads"),
        ..CoreSettings::default()
    };
    let core = Core::start(
        CoreConfig {
            data_root: root.to_path_buf(),
            defaults,
        },
        store.clone(),
        EventBus::new(),
        Box::new(session),
    )
    .await
    .expect("core starts");
    Daemon {
        core,
        driver,
        store,
    }
}

async fn shutdown(daemon: Daemon) {
    daemon.core.stop();
    daemon.core.join().await;
}

async fn wait_for(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        sleep(POLL).await;
    }
    predicate()
}

fn magnet_for(digit: char) -> (String, InfoHash) {
    let hex: String = digit.to_string().repeat(40);
    let hash = hex.parse().expect("valid hex");
    (format!("magnet:?xt=urn:btih:{hex}"), hash)
}

fn magnet_request(digit: char) -> (TorrentAddRequest, InfoHash) {
    let (uri, hash) = magnet_for(digit);
    (
        TorrentAddRequest {
            uri: Some(uri),
            ..TorrentAddRequest::default()
        },
        hash,
    )
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(0))
}

#[tokio::test]
async fn session_set_download_dir_reaches_settings_and_store() {
    let tmp = TempDir::new().expect("tempdir");
    let daemon = boot(tmp.path()).await;
    let target = tmp.path().join("library");

    daemon
        .core
        .update_settings(SessionUpdate {
            download_path: Some(target.clone()),
            ..SessionUpdate::default()
        })
        .await
        .expect("update accepted");

    assert_eq!(daemon.core.settings().download_path, target);

    let expected = target.display().to_string();
    let store = daemon.store.clone();
    let start = Instant::now();
    let mut persisted = false;
    while start.elapsed() < Duration::from_secs(2) {
        if store.get_setting("downloadPath").await.expect("setting read") == Some(expected.clone())
        {
            persisted = true;
            break;
        }
        sleep(POLL).await;
    }
    assert!(persisted, "downloadPath key persisted within the deadline");
    shutdown(daemon).await;
}

#[tokio::test]
async fn magnet_add_appears_in_torrent_list() {
    let tmp = TempDir::new().expect("tempdir");
    let daemon = boot(tmp.path()).await;
    let (request, hash) = magnet_request('1');

    let status = daemon.core.add_torrent(request).await.expect("add runs");
    assert_eq!(status, AddStatus::Ok);

    let core = &daemon.core;
    let hex = hash.to_hex();
    let listed = wait_for(Duration::from_secs(2), || {
        core.torrent_list().iter().any(|entry| entry.hash == hex)
    })
    .await;
    assert!(listed, "added torrent visible in the list within 2s");

    let entry = core
        .torrent_list()
        .into_iter()
        .find(|entry| entry.hash == hex)
        .expect("entry present");
    assert!(entry.id >= 1);
    assert!(entry.total_wanted_done <= entry.total_wanted);
    shutdown(daemon).await;
}

#[tokio::test]
async fn invalid_sources_are_rejected_synchronously() {
    let tmp = TempDir::new().expect("tempdir");
    let daemon = boot(tmp.path()).await;

    let status = daemon
        .core
        .add_torrent(TorrentAddRequest {
            uri: Some("magnet:?xt=urn:btih:nothex".to_string()),
            ..TorrentAddRequest::default()
        })
        .await
        .expect("command runs");
    assert_eq!(status, AddStatus::InvalidUri);

    let status = daemon
        .core
        .add_torrent(TorrentAddRequest::default())
        .await
        .expect("command runs");
    assert_eq!(status, AddStatus::InvalidUri, "no source at all");

    assert!(daemon.core.torrent_list().is_empty());
    shutdown(daemon).await;
}

#[tokio::test]
async fn restart_preserves_hash_and_rpc_id() {
    let tmp = TempDir::new().expect("tempdir");
    let (request, hash) = magnet_request('2');
    let hex = hash.to_hex();

    let first_id = {
        let daemon = boot(tmp.path()).await;
        assert_eq!(
            daemon.core.add_torrent(request).await.expect("add"),
            AddStatus::Ok
        );
        let core = &daemon.core;
        let seen = wait_for(Duration::from_secs(2), || {
            core.torrent_list().iter().any(|entry| entry.hash == hex)
        })
        .await;
        assert!(seen, "torrent listed before shutdown");
        let id = core
            .torrent_list()
            .into_iter()
            .find(|entry| entry.hash == hex)
            .map(|entry| entry.id)
            .expect("id assigned");
        shutdown(daemon).await;
        id
    };

    // Two further restarts: the id must stay pinned each time.
    for round in 0..2 {
        let daemon = boot(tmp.path()).await;
        let core = &daemon.core;
        let restored = wait_for(Duration::from_secs(2), || {
            core.torrent_list().iter().any(|entry| entry.hash == hex)
        })
        .await;
        assert!(restored, "torrent restored after restart {round}");
        let entry = core
            .torrent_list()
            .into_iter()
            .find(|entry| entry.hash == hex)
            .expect("restored entry");
        assert_eq!(entry.id, first_id, "rpc id survives restart {round}");
        shutdown(daemon).await;
    }
}

#[tokio::test]
async fn watch_dir_file_is_ingested_and_renamed() {
    let tmp = TempDir::new().expect("tempdir");
    let daemon = boot(tmp.path()).await;
    let watch = tmp.path().join("watch");
    std::fs::create_dir_all(&watch).expect("watch dir");

    daemon
        .core
        .update_settings(SessionUpdate {
            watch_dir: Some(watch.clone()),
            watch_dir_enabled: Some(true),
            ..SessionUpdate::default()
        })
        .await
        .expect("watch config");

    let file = watch.join("demo.torrent");
    std::fs::write(&file, b"d4:name4:demoe").expect("drop watch file");

    let renamed = watch.join("demo.torrent.added");
    let ingested = wait_for(Duration::from_secs(15), || renamed.exists()).await;
    assert!(ingested, "stable file renamed to .added");
    assert!(!file.exists(), "original file was renamed away");

    let core = &daemon.core;
    let listed = wait_for(Duration::from_secs(2), || core.torrent_list().len() == 1).await;
    assert!(listed, "ingested torrent joined the session");
    shutdown(daemon).await;
}

#[tokio::test]
async fn unreadable_watch_file_is_marked_invalid() {
    let tmp = TempDir::new().expect("tempdir");
    let daemon = boot(tmp.path()).await;
    let watch = tmp.path().join("watch");
    std::fs::create_dir_all(&watch).expect("watch dir");

    daemon
        .core
        .update_settings(SessionUpdate {
            watch_dir: Some(watch.clone()),
            watch_dir_enabled: Some(true),
            ..SessionUpdate::default()
        })
        .await
        .expect("watch config");

    // Not a bencoded dictionary: the session rejects it.
    std::fs::write(watch.join("bogus.torrent"), b"xxxx").expect("drop watch file");

    let renamed = watch.join("bogus.torrent.invalid");
    assert!(
        wait_for(Duration::from_secs(15), || renamed.exists()).await,
        "rejected file renamed to .invalid"
    );
    assert!(daemon.core.torrent_list().is_empty());
    shutdown(daemon).await;
}

#[tokio::test]
async fn per_torrent_ratio_limit_pauses_once() {
    let tmp = TempDir::new().expect("tempdir");
    let daemon = boot(tmp.path()).await;
    let (request, hash) = magnet_request('3');
    assert_eq!(
        daemon.core.add_torrent(request).await.expect("add"),
        AddStatus::Ok
    );

    let core = &daemon.core;
    let hex = hash.to_hex();
    assert!(
        wait_for(Duration::from_secs(2), || {
            core.torrent_list().iter().any(|entry| entry.hash == hex)
        })
        .await
    );
    let id = core
        .torrent_list()
        .into_iter()
        .find(|entry| entry.hash == hex)
        .map(|entry| entry.id)
        .expect("id");

    core.set_torrent_seed_limits(
        vec![id],
        SeedLimitUpdate {
            ratio_limit: Some(1.0),
            ratio_enabled: Some(true),
            ..SeedLimitUpdate::default()
        },
    )
    .await
    .expect("limits set");

    daemon.driver.update_status(&hash, |status| {
        status.state = TorrentState::Seeding;
        status.is_seeding = true;
        status.is_finished = true;
        status.total_upload = 10;
        status.total_download = 10;
    });

    let driver = daemon.driver.clone();
    let paused = wait_for(Duration::from_secs(2), || {
        driver.status(&hash).is_some_and(|status| status.paused)
    })
    .await;
    assert!(paused, "ratio limit paused the torrent");

    // The latch keeps it paused across further ticks.
    sleep(Duration::from_millis(200)).await;
    assert!(driver.status(&hash).is_some_and(|status| status.paused));

    let snapshot_paused = wait_for(Duration::from_secs(2), || {
        core.torrent_list()
            .iter()
            .any(|entry| entry.hash == hex && entry.status == 0)
    })
    .await;
    assert!(snapshot_paused, "snapshot reports transmission status 0");
    shutdown(daemon).await;
}

#[tokio::test]
async fn listen_failures_set_and_clear_the_session_error() {
    let tmp = TempDir::new().expect("tempdir");
    let daemon = boot(tmp.path()).await;

    daemon.driver.push_alert(Alert::ListenFailed {
        address: "0.0.0.0".to_string(),
        port: 6_881,
        message: "address in use".to_string(),
        protocol: ListenProtocol::Tcp,
    });

    let core = &daemon.core;
    let recorded = wait_for(Duration::from_secs(2), || {
        core.snapshot()
            .listen_error
            .as_deref()
            .is_some_and(|error| !error.is_empty())
    })
    .await;
    assert!(recorded, "tcp listen failure recorded");

    daemon.driver.push_alert(Alert::ListenSucceeded {
        address: "0.0.0.0".to_string(),
        port: 6_881,
        protocol: ListenProtocol::Tcp,
    });
    let cleared = wait_for(Duration::from_secs(2), || {
        core.snapshot().listen_error.is_none()
    })
    .await;
    assert!(cleared, "listen success clears the error");
    assert_eq!(
        core.snapshot().listen_interface.as_deref(),
        Some("0.0.0.0:6881")
    );

    // Non-TCP failures are filtered out.
    daemon.driver.push_alert(Alert::ListenFailed {
        address: "0.0.0.0".to_string(),
        port: 6_881,
        message: "udp bind failed".to_string(),
        protocol: ListenProtocol::Udp,
    });
    sleep(Duration::from_millis(200)).await;
    assert!(core.snapshot().listen_error.is_none());
    shutdown(daemon).await;
}

#[tokio::test]
async fn remove_with_data_scrubs_store_and_sidecar() {
    let tmp = TempDir::new().expect("tempdir");
    let daemon = boot(tmp.path()).await;
    let (request, hash) = magnet_request('4');
    assert_eq!(
        daemon.core.add_torrent(request).await.expect("add"),
        AddStatus::Ok
    );

    // Metadata arrives for the magnet; the engine writes the sidecar.
    daemon.driver.push_alert(Alert::MetadataReceived {
        hash,
        metainfo: b"d4:name4:demoe".to_vec(),
    });
    let sidecar = tmp
        .path()
        .join("metadata")
        .join(format!("{}.torrent", hash.to_hex()));
    assert!(
        wait_for(Duration::from_secs(5), || sidecar.exists()).await,
        "metadata sidecar written"
    );

    let core = &daemon.core;
    let hex = hash.to_hex();
    assert!(
        wait_for(Duration::from_secs(2), || {
            core.torrent_list().iter().any(|entry| entry.hash == hex)
        })
        .await,
        "torrent listed before removal"
    );
    let id = core
        .torrent_list()
        .into_iter()
        .find(|entry| entry.hash == hex)
        .map(|entry| entry.id)
        .expect("id assigned");

    core.remove_torrents(vec![id], true).await.expect("remove");
    let gone = wait_for(Duration::from_secs(2), || {
        core.torrent_list().iter().all(|entry| entry.hash != hex)
    })
    .await;
    assert!(gone, "torrent left the list");
    assert!(
        wait_for(Duration::from_secs(2), || !sidecar.exists()).await,
        "sidecar deleted"
    );

    let store = daemon.store.clone();
    let start = Instant::now();
    let mut row_gone = false;
    while start.elapsed() < Duration::from_secs(2) {
        if store
            .load_torrents()
            .await
            .expect("rows")
            .iter()
            .all(|row| row.info_hash != hex)
        {
            row_gone = true;
            break;
        }
        sleep(POLL).await;
    }
    assert!(row_gone, "persistence row deleted");
    shutdown(daemon).await;
}

#[tokio::test]
async fn move_on_complete_relocates_finished_torrents() {
    let tmp = TempDir::new().expect("tempdir");
    let daemon = boot(tmp.path()).await;
    let incomplete = tmp.path().join("incomplete");
    let library = tmp.path().join("library");

    daemon
        .core
        .update_settings(SessionUpdate {
            download_path: Some(library.clone()),
            incomplete_dir: Some(incomplete.clone()),
            incomplete_dir_enabled: Some(true),
            ..SessionUpdate::default()
        })
        .await
        .expect("paths configured");

    let (request, hash) = magnet_request('5');
    assert_eq!(
        daemon.core.add_torrent(request).await.expect("add"),
        AddStatus::Ok
    );
    let driver = daemon.driver.clone();
    assert!(
        wait_for(Duration::from_secs(2), || {
            driver
                .status(&hash)
                .is_some_and(|status| Path::new(&status.save_path) == incomplete)
        })
        .await,
        "new torrent downloads into the incomplete dir"
    );

    driver.finish(&hash);

    let expected = library.join(hash.to_hex());
    let moved = wait_for(Duration::from_secs(5), || {
        driver
            .status(&hash)
            .is_some_and(|status| PathBuf::from(&status.save_path) == expected)
    })
    .await;
    assert!(moved, "storage moved into the completed directory");

    let store = daemon.store.clone();
    let rendered = expected.display().to_string();
    let start = Instant::now();
    let mut persisted = false;
    while start.elapsed() < Duration::from_secs(2) {
        if store
            .load_torrents()
            .await
            .expect("rows")
            .iter()
            .any(|row| row.save_path == rendered)
        {
            persisted = true;
            break;
        }
        sleep(POLL).await;
    }
    assert!(persisted, "new save path persisted");
    shutdown(daemon).await;
}

#[tokio::test]
async fn blocklist_reload_applies_rules_to_the_session() {
    let tmp = TempDir::new().expect("tempdir");
    let daemon = boot(tmp.path()).await;
    let path = tmp.path().join("blocklists").join("blocklist.txt");
    std::fs::write(&path, "# bad peers\n10.0.0.0/24\n192.168.1.5\n").expect("blocklist file");

    let applied = daemon
        .core
        .request_blocklist_reload()
        .await
        .expect("reload runs");
    assert!(applied, "blocklist parsed and applied");

    let driver = daemon.driver.clone();
    let installed = wait_for(Duration::from_secs(2), || driver.ip_filter().len() == 2).await;
    assert!(installed, "both rules reached the session");
    shutdown(daemon).await;
}

#[tokio::test]
async fn history_records_transfer_deltas() {
    let tmp = TempDir::new().expect("tempdir");
    let daemon = boot(tmp.path()).await;

    daemon.driver.set_totals(5_000, 10_000);
    // Give the engine a few ticks to fold the totals in.
    sleep(Duration::from_millis(200)).await;

    // Shrinking the interval forces the worker to seal the open bucket.
    daemon
        .core
        .update_settings(SessionUpdate {
            history_interval: Some(120),
            ..SessionUpdate::default()
        })
        .await
        .expect("history reconfig");

    let core = &daemon.core;
    let start = Instant::now();
    let mut downloaded = 0;
    while start.elapsed() < Duration::from_secs(3) {
        let buckets = core
            .history_query(0, unix_now() + 600, 60)
            .await
            .expect("query runs");
        downloaded = buckets.iter().map(|bucket| bucket.downloaded).sum();
        if downloaded >= 10_000 {
            break;
        }
        sleep(POLL).await;
    }
    assert_eq!(downloaded, 10_000, "download delta landed in history");

    assert!(daemon.core.history_clear(None).await.expect("clear runs"));
    let buckets = daemon
        .core
        .history_query(0, unix_now() + 600, 60)
        .await
        .expect("query runs");
    assert!(buckets.is_empty(), "history cleared");
    shutdown(daemon).await;
}

#[tokio::test]
async fn alt_speed_toggle_swaps_the_limit_set() {
    let tmp = TempDir::new().expect("tempdir");
    let daemon = boot(tmp.path()).await;

    daemon
        .core
        .update_settings(SessionUpdate {
            alt_speed_down_kbps: Some(50),
            alt_speed_up_kbps: Some(25),
            alt_speed_enabled: Some(true),
            ..SessionUpdate::default()
        })
        .await
        .expect("alt limits on");

    let driver = daemon.driver.clone();
    let throttled = wait_for(Duration::from_secs(2), || {
        let applied = driver.applied_settings();
        applied.download_rate_limit == Some(50 * 128) && applied.upload_rate_limit == Some(25 * 128)
    })
    .await;
    assert!(throttled, "alternative limits reached the session");

    daemon
        .core
        .update_settings(SessionUpdate {
            alt_speed_enabled: Some(false),
            ..SessionUpdate::default()
        })
        .await
        .expect("alt limits off");

    let restored = wait_for(Duration::from_secs(2), || {
        let applied = driver.applied_settings();
        // The normal limit set is disabled, which the backend sees as 0.
        applied.download_rate_limit == Some(0) && applied.upload_rate_limit == Some(0)
    })
    .await;
    assert!(restored, "normal (unlimited) limits reapplied");
    shutdown(daemon).await;
}

#[tokio::test]
async fn revisions_grow_with_observable_changes() {
    let tmp = TempDir::new().expect("tempdir");
    let daemon = boot(tmp.path()).await;
    let (request, hash) = magnet_request('6');
    assert_eq!(
        daemon.core.add_torrent(request).await.expect("add"),
        AddStatus::Ok
    );

    let core = &daemon.core;
    let hex = hash.to_hex();
    assert!(
        wait_for(Duration::from_secs(2), || {
            core.torrent_list().iter().any(|entry| entry.hash == hex)
        })
        .await
    );
    let before = core
        .torrent_list()
        .into_iter()
        .find(|entry| entry.hash == hex)
        .expect("entry");

    core.stop_torrents(vec![before.id]).await.expect("pause");
    let advanced = wait_for(Duration::from_secs(2), || {
        core.torrent_list()
            .iter()
            .any(|entry| entry.hash == hex && entry.status == 0 && entry.revision > before.revision)
    })
    .await;
    assert!(advanced, "pause bumped the revision monotonically");
    shutdown(daemon).await;
}

#[tokio::test]
async fn tracker_errors_surface_in_the_snapshot_and_bus() {
    let tmp = TempDir::new().expect("tempdir");
    let daemon = boot(tmp.path()).await;
    let (request, hash) = magnet_request('7');
    assert_eq!(
        daemon.core.add_torrent(request).await.expect("add"),
        AddStatus::Ok
    );
    let mut stream = daemon.core.events().subscribe(None);

    daemon.driver.push_alert(Alert::TrackerError {
        hash,
        message: "announce timed out".to_string(),
    });

    let core = &daemon.core;
    let hex = hash.to_hex();
    let surfaced = wait_for(Duration::from_secs(2), || {
        core.torrent_list()
            .iter()
            .any(|entry| entry.hash == hex && entry.error_string == "announce timed out")
    })
    .await;
    assert!(surfaced, "error string visible in the snapshot");

    let mut saw_error_event = false;
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(200), stream.next()).await {
            Ok(Some(envelope)) => {
                if matches!(envelope.event, Event::TorrentError { .. }) {
                    saw_error_event = true;
                    break;
                }
            }
            _ => break,
        }
    }
    assert!(saw_error_event, "torrent error published on the bus");
    shutdown(daemon).await;
}

#[tokio::test]
async fn graceful_shutdown_waits_for_resume_data() {
    let tmp = TempDir::new().expect("tempdir");
    let daemon = boot(tmp.path()).await;
    let (request, hash) = magnet_request('8');
    assert_eq!(
        daemon.core.add_torrent(request).await.expect("add"),
        AddStatus::Ok
    );
    let hex = hash.to_hex();
    let core = &daemon.core;
    assert!(
        wait_for(Duration::from_secs(2), || {
            core.torrent_list().iter().any(|entry| entry.hash == hex)
        })
        .await
    );

    daemon.core.stop();
    daemon.core.join().await;

    let rows = daemon.store.load_torrents().await.expect("rows");
    let row = rows
        .iter()
        .find(|row| row.info_hash == hex)
        .expect("row kept");
    assert!(
        row.resume_data.is_some(),
        "resume blob persisted during shutdown"
    );
    assert!(
        tmp.path().join("session.dht").exists(),
        "session state written before exit"
    );
}
