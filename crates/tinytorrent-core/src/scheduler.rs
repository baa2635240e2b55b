use chrono::{Datelike, Local, Timelike};
use tinytorrent_session::SettingsPack;

use crate::settings::CoreSettings;

/// All-days mask used when the configured bitmask is zero.
const EVERY_DAY: i64 = 0x7F;

/// kbps to bytes/sec the way the backend expects; `0` stays `0` (unlimited).
#[must_use]
pub const fn kbps_to_bytes(limit_kbps: i64, enabled: bool) -> i64 {
    if !enabled || limit_kbps <= 0 {
        return 0;
    }
    limit_kbps * 1024 / 8
}

/// Whether the day bit for `day_index` (Sunday = 0) is set.
fn day_matches(mask: i64, day_index: u32) -> bool {
    let mask = if mask == 0 { EVERY_DAY } else { mask };
    (mask & (1_i64 << day_index)) != 0
}

/// Whether the weekly schedule matches the given local day and minute.
///
/// An equal begin/end covers the whole day; `begin > end` wraps past
/// midnight.
#[must_use]
pub fn schedule_matches_at(settings: &CoreSettings, day_index: u32, minute_of_day: i64) -> bool {
    if !settings.alt_speed_time_enabled {
        return false;
    }
    if !day_matches(settings.alt_speed_time_day, day_index) {
        return false;
    }
    let begin = settings.alt_speed_time_begin.clamp(0, 24 * 60 - 1);
    let end = settings.alt_speed_time_end.clamp(0, 24 * 60 - 1);
    if begin == end {
        return true;
    }
    if begin < end {
        minute_of_day >= begin && minute_of_day < end
    } else {
        minute_of_day >= begin || minute_of_day < end
    }
}

/// Whether the alternative limit set should be in force right now.
#[must_use]
pub fn should_use_alt_speed(settings: &CoreSettings) -> bool {
    if settings.alt_speed_enabled {
        return true;
    }
    if settings.alt_speed_time_enabled {
        let now = Local::now();
        let minute = i64::from(now.hour()) * 60 + i64::from(now.minute());
        return schedule_matches_at(settings, now.weekday().num_days_from_sunday(), minute);
    }
    false
}

/// The rate-limit pack for the normal or alternative limit set.
#[must_use]
pub fn rate_limit_pack(settings: &CoreSettings, alt: bool) -> SettingsPack {
    let mut pack = SettingsPack::default();
    if alt {
        pack.download_rate_limit = Some(kbps_to_bytes(settings.alt_download_rate_limit_kbps, true));
        pack.upload_rate_limit = Some(kbps_to_bytes(settings.alt_upload_rate_limit_kbps, true));
    } else {
        pack.download_rate_limit = Some(kbps_to_bytes(
            settings.download_rate_limit_kbps,
            settings.download_rate_limit_enabled,
        ));
        pack.upload_rate_limit = Some(kbps_to_bytes(
            settings.upload_rate_limit_kbps,
            settings.upload_rate_limit_enabled,
        ));
    }
    pack
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduled(begin: i64, end: i64, day_mask: i64) -> CoreSettings {
        CoreSettings {
            alt_speed_enabled: false,
            alt_speed_time_enabled: true,
            alt_speed_time_begin: begin,
            alt_speed_time_end: end,
            alt_speed_time_day: day_mask,
            ..CoreSettings::default()
        }
    }

    #[test]
    fn weekday_window_matches_spec_scenario() {
        // 09:00 -> 17:00, Monday through Friday (mask 0x3E).
        let settings = scheduled(540, 1_020, 0x3E);
        // Monday 10:00.
        assert!(schedule_matches_at(&settings, 1, 600));
        // Sunday 10:00.
        assert!(!schedule_matches_at(&settings, 0, 600));
        // Monday 17:00 is outside the half-open window.
        assert!(!schedule_matches_at(&settings, 1, 1_020));
    }

    #[test]
    fn zero_day_mask_means_every_day() {
        let settings = scheduled(0, 60, 0);
        for day in 0..7 {
            assert!(schedule_matches_at(&settings, day, 30));
        }
    }

    #[test]
    fn window_wraps_past_midnight() {
        let settings = scheduled(1_380, 120, 0);
        assert!(schedule_matches_at(&settings, 3, 1_400));
        assert!(schedule_matches_at(&settings, 3, 60));
        assert!(!schedule_matches_at(&settings, 3, 600));
    }

    #[test]
    fn equal_begin_and_end_covers_the_day() {
        let settings = scheduled(600, 600, 0);
        assert!(schedule_matches_at(&settings, 2, 0));
        assert!(schedule_matches_at(&settings, 2, 1_439));
    }

    #[test]
    fn disabled_schedule_never_matches() {
        let mut settings = scheduled(0, 1_439, 0);
        settings.alt_speed_time_enabled = false;
        assert!(!schedule_matches_at(&settings, 1, 600));
    }

    #[test]
    fn forced_toggle_wins_over_schedule() {
        let mut settings = scheduled(0, 1, 0);
        settings.alt_speed_enabled = true;
        assert!(should_use_alt_speed(&settings));
    }

    #[test]
    fn kbps_conversion_and_disabled_limits() {
        assert_eq!(kbps_to_bytes(0, true), 0);
        assert_eq!(kbps_to_bytes(100, false), 0);
        assert_eq!(kbps_to_bytes(8, true), 1_024);
    }

    #[test]
    fn rate_packs_pick_the_right_limit_set() {
        let settings = CoreSettings {
            download_rate_limit_kbps: 800,
            download_rate_limit_enabled: true,
            upload_rate_limit_kbps: 400,
            upload_rate_limit_enabled: false,
            alt_download_rate_limit_kbps: 50,
            alt_upload_rate_limit_kbps: 25,
            ..CoreSettings::default()
        };
        let normal = rate_limit_pack(&settings, false);
        assert_eq!(normal.download_rate_limit, Some(800 * 128));
        assert_eq!(normal.upload_rate_limit, Some(0), "disabled limit is 0");
        let alt = rate_limit_pack(&settings, true);
        assert_eq!(alt.download_rate_limit, Some(50 * 128));
        assert_eq!(alt.upload_rate_limit, Some(25 * 128));
    }
}
