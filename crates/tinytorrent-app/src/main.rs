#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::cargo,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::multiple_crate_versions)]

//! Daemon entrypoint: wires the store, event bus and session backend into
//! the core engine and blocks until shutdown.

/// Application bootstrap wiring.
pub mod bootstrap;

use anyhow::Result;

/// Bootstraps the daemon and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<()> {
    bootstrap::run_daemon().await
}
