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
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

//! Domain-event bus for the TinyTorrent daemon.
//!
//! The engine publishes every externally observable state change here:
//! torrent lifecycle transitions, listener changes, storage moves, settings
//! updates. Consumers (the RPC/WebSocket layer, tests) subscribe and may
//! replay recent events by sequence id after a reconnect. Internally the bus
//! is a `tokio::broadcast` channel paired with a bounded replay ring; when
//! either overflows, the oldest events are dropped.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::error;

/// Sequence number assigned to each published event.
pub type EventId = u64;

/// Default capacity of the replay ring and broadcast channel.
const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Origin of a per-torrent error recorded on a snapshot entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    /// Disk read/write failure reported by the backend.
    File,
    /// Announce failure reported by a tracker.
    Tracker,
    /// A storage move was rejected or failed mid-flight.
    Storage,
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::File => "file",
            Self::Tracker => "tracker",
            Self::Storage => "storage",
        };
        f.write_str(tag)
    }
}

/// Observable domain events emitted by the daemon core.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A torrent was accepted into the session.
    TorrentAdded {
        /// RPC id assigned to the torrent.
        id: i64,
        /// Hex-encoded infohash.
        hash: String,
        /// Display name, or the hash when metadata is not yet known.
        name: String,
    },
    /// A torrent finished downloading its wanted payload.
    TorrentFinished {
        /// RPC id of the finished torrent.
        id: i64,
        /// Hex-encoded infohash.
        hash: String,
    },
    /// A torrent was removed from the session.
    TorrentRemoved {
        /// RPC id of the removed torrent.
        id: i64,
        /// Hex-encoded infohash.
        hash: String,
    },
    /// Metainfo for a magnet add was written to the metadata sidecar dir.
    MetadataPersisted {
        /// Hex-encoded infohash.
        hash: String,
        /// Absolute path of the sidecar file.
        path: String,
    },
    /// Resume data for a torrent reached the persistence layer.
    ResumeDataSaved {
        /// Hex-encoded infohash.
        hash: String,
    },
    /// A TCP listener came up.
    ListenSucceeded {
        /// Normalised `host:port` the session is listening on.
        interface: String,
    },
    /// A TCP listener failed to bind.
    ListenFailed {
        /// Endpoint that failed.
        interface: String,
        /// Failure detail from the backend.
        message: String,
    },
    /// A storage move completed and the new save path was persisted.
    StorageMoved {
        /// Hex-encoded infohash.
        hash: String,
        /// New save path.
        path: String,
    },
    /// A storage move failed; the pending move was cancelled.
    StorageMoveFailed {
        /// Hex-encoded infohash.
        hash: String,
        /// Failure detail from the backend.
        message: String,
    },
    /// A per-torrent fault was recorded.
    TorrentError {
        /// Hex-encoded infohash.
        hash: String,
        /// Which subsystem produced the fault.
        source: ErrorSource,
        /// Human-readable failure description.
        message: String,
    },
    /// The effective session settings changed.
    SettingsChanged,
    /// The alt-speed limit set was switched on or off.
    AltSpeedChanged {
        /// Whether the alternative limits are now in force.
        active: bool,
    },
    /// A blocklist was parsed and handed to the session.
    BlocklistApplied {
        /// Number of accepted rules.
        entries: usize,
    },
}

impl Event {
    /// Machine-friendly discriminator for streaming consumers.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::TorrentAdded { .. } => "torrent_added",
            Self::TorrentFinished { .. } => "torrent_finished",
            Self::TorrentRemoved { .. } => "torrent_removed",
            Self::MetadataPersisted { .. } => "metadata_persisted",
            Self::ResumeDataSaved { .. } => "resume_data_saved",
            Self::ListenSucceeded { .. } => "listen_succeeded",
            Self::ListenFailed { .. } => "listen_failed",
            Self::StorageMoved { .. } => "storage_moved",
            Self::StorageMoveFailed { .. } => "storage_move_failed",
            Self::TorrentError { .. } => "torrent_error",
            Self::SettingsChanged => "settings_changed",
            Self::AltSpeedChanged { .. } => "alt_speed_changed",
            Self::BlocklistApplied { .. } => "blocklist_applied",
        }
    }
}

/// Envelope wrapping an event with its sequence id and emission time.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EventEnvelope {
    /// Monotonic identifier assigned to the wrapped event.
    pub id: EventId,
    /// Timestamp recorded when the envelope was produced.
    pub timestamp: DateTime<Utc>,
    /// Wrapped event payload.
    pub event: Event,
}

/// Shared event bus built on `tokio::broadcast` with a replay ring.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    replay: Arc<Mutex<VecDeque<EventEnvelope>>>,
    next_id: Arc<AtomicU64>,
    replay_capacity: usize,
}

impl EventBus {
    /// Construct a bus whose broadcast channel and replay ring share
    /// `capacity`, so overflow drops affect both structures consistently.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "event bus capacity must be positive");
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            replay: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            next_id: Arc::new(AtomicU64::new(1)),
            replay_capacity: capacity,
        }
    }

    /// Construct a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Publish an event, assigning it the next sequence id.
    pub fn publish(&self, event: Event) -> EventId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };

        {
            let mut replay = self.lock_replay();
            if replay.len() == self.replay_capacity {
                replay.pop_front();
            }
            replay.push_back(envelope.clone());
        }

        let _ = self.sender.send(envelope);
        id
    }

    /// Subscribe, replaying buffered events newer than `since_id` first.
    #[must_use]
    pub fn subscribe(&self, since_id: Option<EventId>) -> EventStream {
        let mut backlog = VecDeque::new();
        if let Some(since) = since_id {
            let replay = self.lock_replay();
            backlog.extend(replay.iter().filter(|item| item.id > since).cloned());
        }
        EventStream {
            backlog,
            receiver: self.sender.subscribe(),
        }
    }

    /// Buffered events newer than `since_id`, for incremental polling.
    #[must_use]
    pub fn backlog_since(&self, since_id: EventId) -> Vec<EventEnvelope> {
        let replay = self.lock_replay();
        replay
            .iter()
            .filter(|item| item.id > since_id)
            .cloned()
            .collect()
    }

    /// The most recently assigned id, if anything has been published.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        self.lock_replay().back().map(|event| event.id)
    }

    fn lock_replay(&self) -> MutexGuard<'_, VecDeque<EventEnvelope>> {
        match self.replay.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("event replay mutex poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream yielding replayed events first, then live broadcasts.
pub struct EventStream {
    backlog: VecDeque<EventEnvelope>,
    receiver: broadcast::Receiver<EventEnvelope>,
}

impl EventStream {
    /// Receive the next event, draining the replay backlog first.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => self.receiver.recv().await.ok(),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Receive without waiting; `None` when no event is immediately ready.
    pub fn try_next(&mut self) -> Option<EventEnvelope> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return None,
            }
        }
    }
}
