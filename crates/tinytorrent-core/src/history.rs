use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tinytorrent_data::{SpeedHistoryRow, StateStore};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::settings::HistoryConfig;

/// Check retention at most this often.
const RETENTION_CHECK_INTERVAL: Duration = Duration::from_secs(3_600);

/// Command queue depth for the history worker.
const HISTORY_QUEUE: usize = 256;

/// One resampled speed-history bucket, as returned to RPC clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryBucket {
    /// Bucket start, unix seconds, aligned to the query step.
    pub timestamp: i64,
    /// Bytes downloaded within the bucket.
    pub downloaded: i64,
    /// Bytes uploaded within the bucket.
    pub uploaded: i64,
    /// Peak download rate observed, bytes/sec.
    pub peak_down: i64,
    /// Peak upload rate observed, bytes/sec.
    pub peak_up: i64,
}

enum HistoryCommand {
    Record {
        down_delta: u64,
        up_delta: u64,
        down_rate: u64,
        up_rate: u64,
    },
    Flush {
        force: bool,
    },
    Retention,
    UpdateConfig(HistoryConfig),
    Query {
        start: i64,
        end: i64,
        step: i64,
        reply: oneshot::Sender<Vec<HistoryBucket>>,
    },
    Clear {
        older_than: Option<i64>,
        reply: oneshot::Sender<bool>,
    },
}

/// Handle to the history worker task.
///
/// Samples are fire-and-forget; queries await a reply from the worker. The
/// worker seals its final bucket and exits when the last handle is
/// dropped.
#[derive(Clone)]
pub struct HistoryHandle {
    tx: mpsc::Sender<HistoryCommand>,
}

impl HistoryHandle {
    /// Spawn the worker over `store` with the initial configuration.
    #[must_use]
    pub fn spawn(store: StateStore, config: HistoryConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(HISTORY_QUEUE);
        let worker = HistoryWorker::new(store, config);
        let join = tokio::spawn(worker.run(rx));
        (Self { tx }, join)
    }

    /// Feed one tick's transfer deltas and rate sample.
    pub fn record(&self, down_delta: u64, up_delta: u64, down_rate: u64, up_rate: u64) {
        self.send(HistoryCommand::Record {
            down_delta,
            up_delta,
            down_rate,
            up_rate,
        });
    }

    /// Seal the current bucket now when `force` is set.
    pub fn flush(&self, force: bool) {
        self.send(HistoryCommand::Flush { force });
    }

    /// Run the hourly retention check.
    pub fn retention(&self) {
        self.send(HistoryCommand::Retention);
    }

    /// Swap the sampling configuration; the current bucket is sealed
    /// first and the window realigned.
    pub fn update_config(&self, config: HistoryConfig) {
        self.send(HistoryCommand::UpdateConfig(config));
    }

    /// Buckets in `[start, end]` resampled to `step` seconds.
    pub async fn query(&self, start: i64, end: i64, step: i64) -> Vec<HistoryBucket> {
        let (reply, rx) = oneshot::channel();
        self.send(HistoryCommand::Query {
            start,
            end,
            step,
            reply,
        });
        rx.await.unwrap_or_default()
    }

    /// Delete buckets older than `older_than`, or everything when `None`.
    pub async fn clear(&self, older_than: Option<i64>) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send(HistoryCommand::Clear { older_than, reply });
        rx.await.unwrap_or(false)
    }

    fn send(&self, command: HistoryCommand) {
        if self.tx.try_send(command).is_err() {
            warn!("history worker queue full; sample dropped");
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(0))
}

const fn align_to_interval(seconds: i64, interval: i64) -> i64 {
    if interval <= 0 {
        return seconds;
    }
    (seconds / interval) * interval
}

struct HistoryWorker {
    store: StateStore,
    config: HistoryConfig,
    bucket_start: i64,
    acc_down: u64,
    acc_up: u64,
    peak_down: u64,
    peak_up: u64,
    last_flush: Instant,
    next_retention: Instant,
}

impl HistoryWorker {
    fn new(store: StateStore, config: HistoryConfig) -> Self {
        let now = Instant::now();
        let mut worker = Self {
            store,
            config,
            bucket_start: 0,
            acc_down: 0,
            acc_up: 0,
            peak_down: 0,
            peak_up: 0,
            last_flush: now,
            next_retention: now,
        };
        worker.configure_window();
        worker
    }

    async fn run(mut self, mut rx: mpsc::Receiver<HistoryCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                HistoryCommand::Record {
                    down_delta,
                    up_delta,
                    down_rate,
                    up_rate,
                } => {
                    self.record(down_delta, up_delta, down_rate, up_rate).await;
                }
                HistoryCommand::Flush { force } => self.flush_if_due(Instant::now(), force).await,
                HistoryCommand::Retention => self.perform_retention(Instant::now()).await,
                HistoryCommand::UpdateConfig(config) => {
                    self.flush_if_due(Instant::now(), true).await;
                    self.config = config;
                    self.configure_window();
                }
                HistoryCommand::Query {
                    start,
                    end,
                    step,
                    reply,
                } => {
                    let _ = reply.send(self.query(start, end, step).await);
                }
                HistoryCommand::Clear { older_than, reply } => {
                    let _ = reply.send(self.clear(older_than).await);
                }
            }
        }
        // Seal whatever is in flight before the task ends.
        self.flush_if_due(Instant::now(), true).await;
    }

    fn configure_window(&mut self) {
        self.bucket_start = align_to_interval(unix_now(), self.config.effective_interval());
        self.acc_down = 0;
        self.acc_up = 0;
        self.peak_down = 0;
        self.peak_up = 0;
        self.last_flush = Instant::now();
        self.next_retention = self.last_flush;
    }

    async fn record(&mut self, down_delta: u64, up_delta: u64, down_rate: u64, up_rate: u64) {
        if !self.config.enabled {
            return;
        }
        self.acc_down += down_delta;
        self.acc_up += up_delta;
        self.peak_down = self.peak_down.max(down_rate);
        self.peak_up = self.peak_up.max(up_rate);
        self.flush_if_due(Instant::now(), false).await;
    }

    async fn flush_if_due(&mut self, now: Instant, force: bool) {
        if !self.config.enabled && !force {
            return;
        }
        let interval = self.config.effective_interval();
        let due = now.saturating_duration_since(self.last_flush).as_secs()
            >= u64::try_from(interval).unwrap_or(u64::MAX);
        if !force && !due {
            return;
        }

        let timestamp = if self.bucket_start == 0 {
            align_to_interval(unix_now(), interval)
        } else {
            self.bucket_start
        };
        let row = SpeedHistoryRow {
            timestamp,
            total_down: i64::try_from(self.acc_down).unwrap_or(i64::MAX),
            total_up: i64::try_from(self.acc_up).unwrap_or(i64::MAX),
            peak_down: i64::try_from(self.peak_down).unwrap_or(i64::MAX),
            peak_up: i64::try_from(self.peak_up).unwrap_or(i64::MAX),
        };
        self.acc_down = 0;
        self.acc_up = 0;
        self.peak_down = 0;
        self.peak_up = 0;
        self.bucket_start = timestamp + interval;
        self.last_flush = now;

        if row.total_down == 0 && row.total_up == 0 && row.peak_down == 0 && row.peak_up == 0 {
            debug!("skipping empty history bucket");
            return;
        }
        if let Err(err) = self.store.insert_speed_history(&row).await {
            warn!(error = %err, timestamp = row.timestamp, "history bucket insert failed");
        }
    }

    async fn perform_retention(&mut self, now: Instant) {
        if self.config.retention_days <= 0 {
            return;
        }
        if now < self.next_retention {
            return;
        }
        self.next_retention = now + RETENTION_CHECK_INTERVAL;
        let cutoff = (unix_now() - self.config.retention_days * 86_400).max(0);
        match self.store.delete_speed_history_before(cutoff).await {
            Ok(removed) if removed > 0 => {
                debug!(removed, cutoff, "history retention pruned buckets");
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "history retention delete failed"),
        }
    }

    async fn query(&self, start: i64, end: i64, step: i64) -> Vec<HistoryBucket> {
        match self.store.query_speed_history(start, end, step).await {
            Ok(rows) => rows
                .into_iter()
                .map(|row| HistoryBucket {
                    timestamp: row.timestamp,
                    downloaded: row.total_down,
                    uploaded: row.total_up,
                    peak_down: row.peak_down,
                    peak_up: row.peak_up,
                })
                .collect(),
            Err(err) => {
                warn!(error = %err, "history query failed");
                Vec::new()
            }
        }
    }

    async fn clear(&self, older_than: Option<i64>) -> bool {
        let result = match older_than {
            Some(cutoff) => self.store.delete_speed_history_before(cutoff).await,
            None => self.store.delete_speed_history_all().await,
        };
        match result {
            Ok(_) => true,
            Err(err) => {
                warn!(error = %err, "history clear failed");
                false
            }
        }
    }
}
