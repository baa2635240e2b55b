use std::time::Instant;

use tinytorrent_session::TorrentStatus;

use crate::settings::CoreSettings;

/// Per-torrent seed-limit overrides and enforcement latches.
#[derive(Debug, Clone)]
pub struct TorrentLimitState {
    /// Per-torrent ratio limit; `None` falls back to the global limit.
    pub ratio_limit: Option<f64>,
    /// Whether the per-torrent ratio limit is enforced.
    pub ratio_enabled: bool,
    /// Per-torrent idle limit in minutes; `None` falls back to the global.
    pub idle_limit_minutes: Option<i64>,
    /// Whether the per-torrent idle limit is enforced.
    pub idle_enabled: bool,
    /// Last instant any payload moved.
    pub last_activity: Instant,
    /// The ratio limit already paused this torrent once.
    pub ratio_triggered: bool,
    /// The idle limit already paused this torrent once.
    pub idle_triggered: bool,
}

impl TorrentLimitState {
    /// Fresh state with activity marked at `now`.
    #[must_use]
    pub const fn new(now: Instant) -> Self {
        Self {
            ratio_limit: None,
            ratio_enabled: false,
            idle_limit_minutes: None,
            idle_enabled: false,
            last_activity: now,
            ratio_triggered: false,
            idle_triggered: false,
        }
    }
}

/// Optional-per-field update for a torrent's seed limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeedLimitUpdate {
    /// New ratio limit.
    pub ratio_limit: Option<f64>,
    /// Toggle ratio enforcement.
    pub ratio_enabled: Option<bool>,
    /// New idle limit in minutes.
    pub idle_limit_minutes: Option<i64>,
    /// Toggle idle enforcement.
    pub idle_enabled: Option<bool>,
}

impl TorrentLimitState {
    /// Fold in an update; disabling a limit clears its latch, and any
    /// update resets the activity clock so the idle timer restarts.
    pub fn apply(&mut self, update: SeedLimitUpdate, now: Instant) {
        if let Some(limit) = update.ratio_limit {
            self.ratio_limit = Some(limit);
        }
        if let Some(enabled) = update.ratio_enabled {
            self.ratio_enabled = enabled;
            if !enabled {
                self.ratio_triggered = false;
            }
        }
        if let Some(limit) = update.idle_limit_minutes {
            self.idle_limit_minutes = Some(limit);
        }
        if let Some(enabled) = update.idle_enabled {
            self.idle_enabled = enabled;
            if !enabled {
                self.idle_triggered = false;
            }
        }
        self.last_activity = now;
    }
}

/// What the enforcement pass decided for one torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    /// Nothing to do.
    None,
    /// Pause the torrent; the latch that fired is already set.
    Pause,
}

/// Evaluate seed limits for one torrent.
///
/// Per-torrent overrides win over the globals in `settings`. Non-zero
/// payload rates refresh the activity clock and clear the idle latch.
/// Paused torrents are left alone.
pub fn enforce_seed_limits(
    state: &mut TorrentLimitState,
    settings: &CoreSettings,
    status: &TorrentStatus,
    now: Instant,
) -> PolicyAction {
    if status.paused {
        return PolicyAction::None;
    }

    if status.download_payload_rate > 0 || status.upload_payload_rate > 0 {
        state.last_activity = now;
        state.idle_triggered = false;
    }

    let seeding_or_finished = status.is_seeding || status.is_finished;

    let mut idle_enabled = state.idle_enabled;
    let mut idle_limit_seconds = state.idle_limit_minutes.unwrap_or(0) * 60;
    if !idle_enabled && settings.seed_idle_enabled && settings.seed_idle_limit_minutes > 0 {
        idle_enabled = true;
        idle_limit_seconds = settings.seed_idle_limit_minutes * 60;
    }
    if seeding_or_finished && idle_enabled && idle_limit_seconds > 0 && !state.idle_triggered {
        let idle_for = now.saturating_duration_since(state.last_activity);
        if i64::try_from(idle_for.as_secs()).unwrap_or(i64::MAX) >= idle_limit_seconds {
            state.idle_triggered = true;
            return PolicyAction::Pause;
        }
    }

    let (ratio_enabled, ratio_limit) = if state.ratio_enabled {
        (true, state.ratio_limit.unwrap_or(0.0))
    } else if settings.seed_ratio_enabled {
        (true, settings.seed_ratio_limit)
    } else {
        (false, 0.0)
    };
    if status.is_seeding
        && ratio_enabled
        && ratio_limit > 0.0
        && !state.ratio_triggered
        && status.total_download > 0
    {
        let ratio = status.total_upload as f64 / status.total_download as f64;
        if ratio >= ratio_limit {
            state.ratio_triggered = true;
            return PolicyAction::Pause;
        }
    }

    PolicyAction::None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tinytorrent_session::InfoHash;

    fn seeding_status(uploaded: i64, downloaded: i64) -> TorrentStatus {
        let mut status = TorrentStatus::new(InfoHash::from_bytes([9; 20]));
        status.is_seeding = true;
        status.is_finished = true;
        status.total_upload = uploaded;
        status.total_download = downloaded;
        status
    }

    #[test]
    fn ratio_limit_pauses_once() {
        let now = Instant::now();
        let mut state = TorrentLimitState::new(now);
        state.apply(
            SeedLimitUpdate {
                ratio_limit: Some(1.0),
                ratio_enabled: Some(true),
                ..SeedLimitUpdate::default()
            },
            now,
        );
        let settings = CoreSettings::default();
        let status = seeding_status(10, 10);
        assert_eq!(
            enforce_seed_limits(&mut state, &settings, &status, now),
            PolicyAction::Pause
        );
        // The latch prevents a second pause.
        assert_eq!(
            enforce_seed_limits(&mut state, &settings, &status, now),
            PolicyAction::None
        );
    }

    #[test]
    fn clearing_the_toggle_resets_the_latch() {
        let now = Instant::now();
        let mut state = TorrentLimitState::new(now);
        state.ratio_enabled = true;
        state.ratio_limit = Some(1.0);
        state.ratio_triggered = true;
        state.apply(
            SeedLimitUpdate {
                ratio_enabled: Some(false),
                ..SeedLimitUpdate::default()
            },
            now,
        );
        assert!(!state.ratio_triggered);
    }

    #[test]
    fn global_ratio_applies_when_no_override() {
        let now = Instant::now();
        let mut state = TorrentLimitState::new(now);
        let settings = CoreSettings {
            seed_ratio_enabled: true,
            seed_ratio_limit: 0.5,
            ..CoreSettings::default()
        };
        let status = seeding_status(5, 10);
        assert_eq!(
            enforce_seed_limits(&mut state, &settings, &status, now),
            PolicyAction::Pause
        );
    }

    #[test]
    fn activity_refreshes_idle_clock() {
        let start = Instant::now();
        let mut state = TorrentLimitState::new(start);
        state.idle_enabled = true;
        state.idle_limit_minutes = Some(1);
        let settings = CoreSettings::default();

        let mut status = seeding_status(0, 1);
        status.upload_payload_rate = 1_000;
        let later = start + Duration::from_secs(120);
        // Active torrent never idles out.
        assert_eq!(
            enforce_seed_limits(&mut state, &settings, &status, later),
            PolicyAction::None
        );
        assert_eq!(state.last_activity, later);

        status.upload_payload_rate = 0;
        let much_later = later + Duration::from_secs(61);
        assert_eq!(
            enforce_seed_limits(&mut state, &settings, &status, much_later),
            PolicyAction::Pause
        );
        assert!(state.idle_triggered);
    }

    #[test]
    fn paused_torrents_are_ignored() {
        let now = Instant::now();
        let mut state = TorrentLimitState::new(now);
        state.ratio_enabled = true;
        state.ratio_limit = Some(0.1);
        let mut status = seeding_status(100, 10);
        status.paused = true;
        assert_eq!(
            enforce_seed_limits(&mut state, &CoreSettings::default(), &status, now),
            PolicyAction::None
        );
    }
}
