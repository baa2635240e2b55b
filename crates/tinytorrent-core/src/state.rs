use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tinytorrent_session::SessionTotals;

/// Cumulative transfer statistics, persisted across restarts.
///
/// Counters only ever grow; `session_count` is bumped once per daemon
/// start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatistics {
    /// All-time uploaded bytes.
    pub uploaded_bytes: u64,
    /// All-time downloaded bytes.
    pub downloaded_bytes: u64,
    /// All-time active seconds.
    pub seconds_active: u64,
    /// Number of daemon starts.
    pub session_count: u64,
}

/// Flush dirty statistics after this much time.
const STATS_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Tracks session totals between ticks and maintains the cumulative and
/// current-window statistics.
#[derive(Debug)]
pub struct StateService {
    stats: SessionStatistics,
    dirty: bool,
    session_start: Instant,
    last_update: Instant,
    last_flush: Instant,
    session_start_uploaded: u64,
    session_start_downloaded: u64,
    last_uploaded: u64,
    last_downloaded: u64,
}

impl StateService {
    /// Start tracking from the persisted statistics and the session's
    /// counters at startup.
    #[must_use]
    pub fn new(stats: SessionStatistics, totals: SessionTotals, now: Instant) -> Self {
        Self {
            stats,
            dirty: false,
            session_start: now,
            last_update: now,
            last_flush: now,
            session_start_uploaded: totals.uploaded,
            session_start_downloaded: totals.downloaded,
            last_uploaded: totals.uploaded,
            last_downloaded: totals.downloaded,
        }
    }

    /// Fold the current session totals in and return the
    /// `(downloaded, uploaded)` deltas since the previous tick.
    ///
    /// A counter that moved backwards (backend reset) contributes its raw
    /// value instead of a negative delta.
    pub fn record(&mut self, totals: SessionTotals, now: Instant) -> (u64, u64) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs();
        if elapsed > 0 {
            self.stats.seconds_active += elapsed;
            self.dirty = true;
        }

        let uploaded_delta = if totals.uploaded >= self.last_uploaded {
            totals.uploaded - self.last_uploaded
        } else {
            totals.uploaded
        };
        let downloaded_delta = if totals.downloaded >= self.last_downloaded {
            totals.downloaded - self.last_downloaded
        } else {
            totals.downloaded
        };
        if uploaded_delta > 0 {
            self.stats.uploaded_bytes += uploaded_delta;
            self.dirty = true;
        }
        if downloaded_delta > 0 {
            self.stats.downloaded_bytes += downloaded_delta;
            self.dirty = true;
        }

        self.last_uploaded = totals.uploaded;
        self.last_downloaded = totals.downloaded;
        self.last_update = now;
        (downloaded_delta, uploaded_delta)
    }

    /// The cumulative statistics.
    #[must_use]
    pub const fn cumulative(&self) -> SessionStatistics {
        self.stats
    }

    /// Statistics for the current daemon run, derived from the totals
    /// cached at startup.
    #[must_use]
    pub fn current(&self, totals: SessionTotals, now: Instant) -> SessionStatistics {
        SessionStatistics {
            uploaded_bytes: totals.uploaded.saturating_sub(self.session_start_uploaded),
            downloaded_bytes: totals
                .downloaded
                .saturating_sub(self.session_start_downloaded),
            seconds_active: now.saturating_duration_since(self.session_start).as_secs(),
            session_count: 1,
        }
    }

    /// Dirty statistics ready to persist, honouring the 5-second soft
    /// cadence unless `force` is set.
    pub fn take_flush(&mut self, now: Instant, force: bool) -> Option<SessionStatistics> {
        if !self.dirty {
            return None;
        }
        if !force && now.saturating_duration_since(self.last_flush) < STATS_FLUSH_INTERVAL {
            return None;
        }
        self.dirty = false;
        self.last_flush = now;
        Some(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn totals(uploaded: u64, downloaded: u64) -> SessionTotals {
        SessionTotals {
            uploaded,
            downloaded,
        }
    }

    #[test]
    fn deltas_accumulate_into_cumulative_stats() {
        let start = Instant::now();
        let mut service = StateService::new(SessionStatistics::default(), totals(0, 0), start);

        let (down, up) = service.record(totals(10, 100), start + Duration::from_secs(2));
        assert_eq!((down, up), (100, 10));
        let stats = service.cumulative();
        assert_eq!(stats.uploaded_bytes, 10);
        assert_eq!(stats.downloaded_bytes, 100);
        assert_eq!(stats.seconds_active, 2);
    }

    #[test]
    fn backend_counter_reset_clamps_to_raw_totals() {
        let start = Instant::now();
        let mut service = StateService::new(SessionStatistics::default(), totals(500, 500), start);
        let (down, up) = service.record(totals(20, 30), start + Duration::from_secs(1));
        assert_eq!((down, up), (30, 20));
    }

    #[test]
    fn current_window_derives_from_start_totals() {
        let start = Instant::now();
        let service = StateService::new(
            SessionStatistics {
                uploaded_bytes: 999,
                downloaded_bytes: 999,
                seconds_active: 999,
                session_count: 7,
            },
            totals(100, 200),
            start,
        );
        let current = service.current(totals(150, 260), start + Duration::from_secs(9));
        assert_eq!(current.uploaded_bytes, 50);
        assert_eq!(current.downloaded_bytes, 60);
        assert_eq!(current.seconds_active, 9);
        assert_eq!(current.session_count, 1);
    }

    #[test]
    fn flush_honours_cadence_and_force() {
        let start = Instant::now();
        let mut service = StateService::new(SessionStatistics::default(), totals(0, 0), start);
        let _ = service.record(totals(1, 1), start + Duration::from_secs(1));

        // Within the cadence window nothing is flushed unless forced.
        assert!(service.take_flush(start + Duration::from_secs(2), false).is_none());
        assert!(service.take_flush(start + Duration::from_secs(2), true).is_some());

        let _ = service.record(totals(2, 2), start + Duration::from_secs(3));
        assert!(service.take_flush(start + Duration::from_secs(20), false).is_some());
        // Nothing dirty afterwards.
        assert!(service.take_flush(start + Duration::from_secs(40), true).is_none());
    }
}
