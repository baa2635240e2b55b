use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::{DataError, Result};

/// Setting keys the cumulative session statistics are stored under.
const KEY_SESSION_COUNT: &str = "sessionCount";
const KEY_UPLOADED_BYTES: &str = "uploadedBytes";
const KEY_DOWNLOADED_BYTES: &str = "downloadedBytes";
const KEY_SECONDS_ACTIVE: &str = "secondsActive";

/// One persisted torrent row.
///
/// Exactly one of `magnet_uri`, `metainfo` and `metadata_path` is expected
/// to be populated; the engine replays whichever is present at startup.
#[derive(Debug, Clone, Default)]
pub struct TorrentRow {
    /// Hex-encoded infohash, the primary key.
    pub info_hash: String,
    /// Magnet URI for magnet adds without persisted metadata.
    pub magnet_uri: Option<String>,
    /// Save path the torrent was last using.
    pub save_path: String,
    /// Fast-resume blob from the last shutdown.
    pub resume_data: Option<Vec<u8>>,
    /// Raw metainfo for file-based adds.
    pub metainfo: Option<Vec<u8>>,
    /// Whether the torrent was paused.
    pub paused: bool,
    /// JSON array of label strings.
    pub labels: String,
    /// Unix seconds the torrent was first added.
    pub added_at: i64,
    /// Stable RPC id assigned by the engine.
    pub rpc_id: i64,
    /// Path of the metadata sidecar written after a magnet resolved.
    pub metadata_path: Option<String>,
}

impl TorrentRow {
    /// Decode the label JSON into a vector, tolerating bad rows.
    #[must_use]
    pub fn label_list(&self) -> Vec<String> {
        serde_json::from_str(&self.labels).unwrap_or_default()
    }
}

/// One sealed speed-history bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedHistoryRow {
    /// Bucket start, aligned to the sampling interval.
    pub timestamp: i64,
    /// Bytes downloaded within the bucket.
    pub total_down: i64,
    /// Bytes uploaded within the bucket.
    pub total_up: i64,
    /// Peak download rate observed within the bucket, bytes/sec.
    pub peak_down: i64,
    /// Peak upload rate observed within the bucket, bytes/sec.
    pub peak_up: i64,
}

/// Cumulative session statistics, persisted as settings keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStatisticsRow {
    /// All-time uploaded bytes.
    pub uploaded_bytes: u64,
    /// All-time downloaded bytes.
    pub downloaded_bytes: u64,
    /// All-time active seconds.
    pub seconds_active: u64,
    /// Number of daemon starts.
    pub session_count: u64,
}

/// Async SQLite store backing the daemon's persistence manager.
#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    /// Open (or create) the store at `path` and run pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error when the path is not UTF-8, the database cannot be
    /// opened, or migrations fail.
    pub async fn open(path: &Path) -> Result<Self> {
        if path.to_str().is_none() {
            return Err(DataError::PathNotUtf8 {
                field: "database_path",
                path: path.to_path_buf(),
            });
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(DataError::query("open database"))?;
        Self::from_pool(pool).await
    }

    /// Open a private in-memory store, for tests.
    ///
    /// # Errors
    ///
    /// Returns an error when the database cannot be created or migrations
    /// fail.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(DataError::query("parse in-memory dsn"))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(DataError::query("open in-memory database"))?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|source| DataError::MigrationFailed { source })?;
        Ok(Self { pool })
    }

    /// Fetch one setting value.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(DataError::query("get_setting"))?;
        row.map(|row| row.try_get::<String, _>("value"))
            .transpose()
            .map_err(DataError::query("get_setting"))
    }

    /// Insert or replace one setting value.
    ///
    /// # Errors
    ///
    /// Returns an error when the write fails.
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(DataError::query("set_setting"))?;
        Ok(())
    }

    /// All persisted settings, for the startup merge.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn load_settings(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT key, value FROM settings ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(DataError::query("load_settings"))?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push((
                row.try_get("key").map_err(DataError::query("load_settings"))?,
                row.try_get("value")
                    .map_err(DataError::query("load_settings"))?,
            ));
        }
        Ok(entries)
    }

    /// Insert or fully replace a torrent row, keyed by infohash.
    ///
    /// # Errors
    ///
    /// Returns an error when the write fails.
    pub async fn upsert_torrent(&self, row: &TorrentRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO torrents
                 (info_hash, magnet_uri, save_path, resume_data, metainfo,
                  paused, labels, added_at, rpc_id, metadata_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(info_hash) DO UPDATE SET
                 magnet_uri = excluded.magnet_uri,
                 save_path = excluded.save_path,
                 resume_data = excluded.resume_data,
                 metainfo = excluded.metainfo,
                 paused = excluded.paused,
                 labels = excluded.labels,
                 added_at = excluded.added_at,
                 rpc_id = excluded.rpc_id,
                 metadata_path = excluded.metadata_path",
        )
        .bind(&row.info_hash)
        .bind(&row.magnet_uri)
        .bind(&row.save_path)
        .bind(&row.resume_data)
        .bind(&row.metainfo)
        .bind(row.paused)
        .bind(&row.labels)
        .bind(row.added_at)
        .bind(row.rpc_id)
        .bind(&row.metadata_path)
        .execute(&self.pool)
        .await
        .map_err(DataError::query("upsert_torrent"))?;
        Ok(())
    }

    /// Delete a torrent row.
    ///
    /// # Errors
    ///
    /// Returns an error when the write fails.
    pub async fn delete_torrent(&self, info_hash: &str) -> Result<()> {
        sqlx::query("DELETE FROM torrents WHERE info_hash = ?1")
            .bind(info_hash)
            .execute(&self.pool)
            .await
            .map_err(DataError::query("delete_torrent"))?;
        Ok(())
    }

    /// Record the RPC id assigned to a torrent.
    ///
    /// # Errors
    ///
    /// Returns an error when the write fails.
    pub async fn update_rpc_id(&self, info_hash: &str, rpc_id: i64) -> Result<()> {
        let result = sqlx::query("UPDATE torrents SET rpc_id = ?2 WHERE info_hash = ?1")
            .bind(info_hash)
            .bind(rpc_id)
            .execute(&self.pool)
            .await
            .map_err(DataError::query("update_rpc_id"))?;
        log_missing_row("update_rpc_id", info_hash, result.rows_affected());
        Ok(())
    }

    /// Record a torrent's new save path.
    ///
    /// # Errors
    ///
    /// Returns an error when the write fails.
    pub async fn update_save_path(&self, info_hash: &str, save_path: &str) -> Result<()> {
        let result = sqlx::query("UPDATE torrents SET save_path = ?2 WHERE info_hash = ?1")
            .bind(info_hash)
            .bind(save_path)
            .execute(&self.pool)
            .await
            .map_err(DataError::query("update_save_path"))?;
        log_missing_row("update_save_path", info_hash, result.rows_affected());
        Ok(())
    }

    /// Replace a torrent's labels with a JSON array string.
    ///
    /// # Errors
    ///
    /// Returns an error when the write fails.
    pub async fn update_labels(&self, info_hash: &str, labels: &str) -> Result<()> {
        let result = sqlx::query("UPDATE torrents SET labels = ?2 WHERE info_hash = ?1")
            .bind(info_hash)
            .bind(labels)
            .execute(&self.pool)
            .await
            .map_err(DataError::query("update_labels"))?;
        log_missing_row("update_labels", info_hash, result.rows_affected());
        Ok(())
    }

    /// Record the paused flag for a torrent.
    ///
    /// # Errors
    ///
    /// Returns an error when the write fails.
    pub async fn update_paused(&self, info_hash: &str, paused: bool) -> Result<()> {
        let result = sqlx::query("UPDATE torrents SET paused = ?2 WHERE info_hash = ?1")
            .bind(info_hash)
            .bind(paused)
            .execute(&self.pool)
            .await
            .map_err(DataError::query("update_paused"))?;
        log_missing_row("update_paused", info_hash, result.rows_affected());
        Ok(())
    }

    /// Record where a magnet's resolved metadata was written; the magnet
    /// URI and inline metainfo are cleared since the sidecar now wins.
    ///
    /// # Errors
    ///
    /// Returns an error when the write fails.
    pub async fn update_metadata(
        &self,
        info_hash: &str,
        metadata_path: &str,
        metainfo: Option<&[u8]>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE torrents
             SET metadata_path = ?2, metainfo = ?3, magnet_uri = NULL
             WHERE info_hash = ?1",
        )
        .bind(info_hash)
        .bind(metadata_path)
        .bind(metainfo)
        .execute(&self.pool)
        .await
        .map_err(DataError::query("update_metadata"))?;
        Ok(())
    }

    /// Replace a torrent's resume-data blob.
    ///
    /// # Errors
    ///
    /// Returns an error when the write fails.
    pub async fn update_resume_data(&self, info_hash: &str, resume_data: &[u8]) -> Result<()> {
        let result = sqlx::query("UPDATE torrents SET resume_data = ?2 WHERE info_hash = ?1")
            .bind(info_hash)
            .bind(resume_data)
            .execute(&self.pool)
            .await
            .map_err(DataError::query("update_resume_data"))?;
        log_missing_row("update_resume_data", info_hash, result.rows_affected());
        Ok(())
    }

    /// Load every persisted torrent, ordered by RPC id.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn load_torrents(&self) -> Result<Vec<TorrentRow>> {
        let rows = sqlx::query(
            "SELECT info_hash, magnet_uri, save_path, resume_data, metainfo,
                    paused, labels, added_at, rpc_id, metadata_path
             FROM torrents ORDER BY rpc_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DataError::query("load_torrents"))?;

        let failed = DataError::query("load_torrents");
        let mut torrents = Vec::with_capacity(rows.len());
        for row in rows {
            torrents.push(TorrentRow {
                info_hash: row.try_get("info_hash").map_err(&failed)?,
                magnet_uri: row.try_get("magnet_uri").map_err(&failed)?,
                save_path: row.try_get("save_path").map_err(&failed)?,
                resume_data: row.try_get("resume_data").map_err(&failed)?,
                metainfo: row.try_get("metainfo").map_err(&failed)?,
                paused: row.try_get("paused").map_err(&failed)?,
                labels: row.try_get("labels").map_err(&failed)?,
                added_at: row.try_get("added_at").map_err(&failed)?,
                rpc_id: row.try_get("rpc_id").map_err(&failed)?,
                metadata_path: row.try_get("metadata_path").map_err(&failed)?,
            });
        }
        Ok(torrents)
    }

    /// Load the cumulative session statistics from their settings keys.
    ///
    /// # Errors
    ///
    /// Returns an error when a query fails.
    pub async fn load_session_statistics(&self) -> Result<SessionStatisticsRow> {
        let parse = |value: Option<String>| {
            value
                .as_deref()
                .and_then(|text| text.parse::<u64>().ok())
                .unwrap_or(0)
        };
        Ok(SessionStatisticsRow {
            uploaded_bytes: parse(self.get_setting(KEY_UPLOADED_BYTES).await?),
            downloaded_bytes: parse(self.get_setting(KEY_DOWNLOADED_BYTES).await?),
            seconds_active: parse(self.get_setting(KEY_SECONDS_ACTIVE).await?),
            session_count: parse(self.get_setting(KEY_SESSION_COUNT).await?),
        })
    }

    /// Write the cumulative session statistics back to their settings keys.
    ///
    /// # Errors
    ///
    /// Returns an error when a write fails.
    pub async fn save_session_statistics(&self, stats: &SessionStatisticsRow) -> Result<()> {
        self.set_setting(KEY_UPLOADED_BYTES, &stats.uploaded_bytes.to_string())
            .await?;
        self.set_setting(KEY_DOWNLOADED_BYTES, &stats.downloaded_bytes.to_string())
            .await?;
        self.set_setting(KEY_SECONDS_ACTIVE, &stats.seconds_active.to_string())
            .await?;
        self.set_setting(KEY_SESSION_COUNT, &stats.session_count.to_string())
            .await
    }

    /// Insert (or replace) one sealed history bucket.
    ///
    /// # Errors
    ///
    /// Returns an error when the write fails.
    pub async fn insert_speed_history(&self, row: &SpeedHistoryRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO speed_history (timestamp, total_down, total_up, peak_down, peak_up)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(timestamp) DO UPDATE SET
                 total_down = total_down + excluded.total_down,
                 total_up = total_up + excluded.total_up,
                 peak_down = MAX(peak_down, excluded.peak_down),
                 peak_up = MAX(peak_up, excluded.peak_up)",
        )
        .bind(row.timestamp)
        .bind(row.total_down)
        .bind(row.total_up)
        .bind(row.peak_down)
        .bind(row.peak_up)
        .execute(&self.pool)
        .await
        .map_err(DataError::query("insert_speed_history"))?;
        Ok(())
    }

    /// Buckets in `[start, end]` resampled to `step` seconds.
    ///
    /// Returned timestamps are aligned to `step` and never precede `start`.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn query_speed_history(
        &self,
        start: i64,
        end: i64,
        step: i64,
    ) -> Result<Vec<SpeedHistoryRow>> {
        let step = step.max(1);
        let rows = sqlx::query(
            "SELECT (timestamp / ?1) * ?1 AS bucket,
                    SUM(total_down) AS total_down,
                    SUM(total_up) AS total_up,
                    MAX(peak_down) AS peak_down,
                    MAX(peak_up) AS peak_up
             FROM speed_history
             WHERE timestamp >= ?2 AND timestamp <= ?3
             GROUP BY bucket
             HAVING bucket >= ?2
             ORDER BY bucket",
        )
        .bind(step)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(DataError::query("query_speed_history"))?;

        let failed = DataError::query("query_speed_history");
        let mut buckets = Vec::with_capacity(rows.len());
        for row in rows {
            buckets.push(SpeedHistoryRow {
                timestamp: row.try_get("bucket").map_err(&failed)?,
                total_down: row.try_get("total_down").map_err(&failed)?,
                total_up: row.try_get("total_up").map_err(&failed)?,
                peak_down: row.try_get("peak_down").map_err(&failed)?,
                peak_up: row.try_get("peak_up").map_err(&failed)?,
            });
        }
        Ok(buckets)
    }

    /// Delete buckets strictly older than `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns an error when the write fails.
    pub async fn delete_speed_history_before(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM speed_history WHERE timestamp < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(DataError::query("delete_speed_history_before"))?;
        Ok(result.rows_affected())
    }

    /// Delete all history buckets.
    ///
    /// # Errors
    ///
    /// Returns an error when the write fails.
    pub async fn delete_speed_history_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM speed_history")
            .execute(&self.pool)
            .await
            .map_err(DataError::query("delete_speed_history_all"))?;
        Ok(result.rows_affected())
    }

}

fn log_missing_row(operation: &'static str, info_hash: &str, rows_affected: u64) {
    if rows_affected == 0 {
        debug!(info_hash, operation, "update touched no torrent row");
    }
}
