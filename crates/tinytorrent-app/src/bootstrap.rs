use std::path::PathBuf;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use tinytorrent_core::{Core, CoreConfig, CoreSettings};
use tinytorrent_data::StateStore;
use tinytorrent_events::EventBus;
use tinytorrent_session::MemorySession;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Process-wide data root, resolved once from `TINYTORRENT_DATA_ROOT`
/// (falling back to `./tinytorrent-data`).
static DATA_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var_os("TINYTORRENT_DATA_ROOT")
        .map_or_else(|| PathBuf::from("tinytorrent-data"), PathBuf::from)
});

/// The resolved data root for this process.
#[must_use]
pub fn data_root() -> &'static PathBuf {
    &DATA_ROOT
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Boot the daemon and block until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error when the data root, store or core cannot be brought
/// up.
pub async fn run_daemon() -> Result<()> {
    init_logging();
    let root = data_root().clone();
    std::fs::create_dir_all(&root)
        .with_context(|| format!("creating data root {}", root.display()))?;
    info!(data_root = %root.display(), "tinytorrent daemon starting");

    let store = StateStore::open(&root.join("tinytorrent.db"))
        .await
        .context("opening state store")?;
    let bus = EventBus::new();
    let backend = Box::new(MemorySession::new());

    let core = Core::start(
        CoreConfig {
            data_root: root,
            defaults: CoreSettings::default(),
        },
        store,
        bus,
        backend,
    )
    .await
    .context("starting daemon core")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    core.stop();
    core.join().await;
    info!("daemon stopped");
    Ok(())
}
