use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::error;

use crate::settings::{CoreSettings, SessionUpdate, SettingsDelta, normalize_listen_interface};

/// Settings persist this long after the last mutation (forced on
/// shutdown).
const SETTINGS_FLUSH_DEBOUNCE: Duration = Duration::from_millis(500);

/// Holder of the effective [`CoreSettings`].
///
/// Many readers, a single writer: RPC threads call [`get`](Self::get) for
/// a copy while every mutation goes through the engine. A dirty flag plus
/// first-dirty timestamp drive the debounced persistence flush.
#[derive(Debug)]
pub struct ConfigurationService {
    settings: RwLock<CoreSettings>,
    dirty: AtomicBool,
    dirty_since: Mutex<Option<Instant>>,
}

impl ConfigurationService {
    /// Service seeded with the effective startup settings.
    #[must_use]
    pub fn new(settings: CoreSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
            dirty: AtomicBool::new(false),
            dirty_since: Mutex::new(None),
        }
    }

    /// A copy of the current settings.
    #[must_use]
    pub fn get(&self) -> CoreSettings {
        match self.settings.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => {
                error!("settings lock poisoned; reading recovered value");
                poisoned.into_inner().clone()
            }
        }
    }

    /// Fold a diff in, marking the service dirty when anything changed.
    pub fn update(&self, update: &SessionUpdate) -> SettingsDelta {
        let delta = {
            let mut guard = self.write_lock();
            guard.apply(update)
        };
        if delta.any() {
            self.mark_dirty();
        }
        delta
    }

    /// Normalise and store a listen interface.
    ///
    /// Returns the normalised value when it differs from the current one.
    pub fn set_listen_interface(&self, value: &str) -> Option<String> {
        let normalised = normalize_listen_interface(value);
        {
            let mut guard = self.write_lock();
            if guard.listen_interface == normalised {
                return None;
            }
            guard.listen_interface = normalised.clone();
        }
        self.mark_dirty();
        Some(normalised)
    }

    /// Replace the download path. The caller has already validated it.
    pub fn set_download_path(&self, path: std::path::PathBuf) {
        {
            let mut guard = self.write_lock();
            guard.download_path = path;
        }
        self.mark_dirty();
    }

    /// Mark the settings as needing a flush.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
        let mut since = self.lock_dirty_since();
        if since.is_none() {
            *since = Some(Instant::now());
        }
    }

    /// Settings ready to persist, honouring the 500 ms debounce unless
    /// `force` is set. Clears the dirty state when it returns `Some`.
    pub fn take_flush(&self, now: Instant, force: bool) -> Option<CoreSettings> {
        if !self.dirty.load(Ordering::Acquire) {
            return None;
        }
        if !force {
            let since = self.lock_dirty_since();
            match *since {
                Some(first) if now.saturating_duration_since(first) >= SETTINGS_FLUSH_DEBOUNCE => {}
                _ => return None,
            }
        }
        self.dirty.store(false, Ordering::Release);
        *self.lock_dirty_since() = None;
        Some(self.get())
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, CoreSettings> {
        match self.settings.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("settings lock poisoned; writing recovered value");
                poisoned.into_inner()
            }
        }
    }

    fn lock_dirty_since(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        match self.dirty_since.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn updates_are_visible_to_readers() {
        let service = ConfigurationService::new(CoreSettings::default());
        let delta = service.update(&SessionUpdate {
            download_path: Some(PathBuf::from("/library")),
            ..SessionUpdate::default()
        });
        assert!(delta.paths);
        assert_eq!(service.get().download_path, PathBuf::from("/library"));
    }

    #[test]
    fn listen_interface_normalises_and_dedupes() {
        let service = ConfigurationService::new(CoreSettings::default());
        assert_eq!(
            service.set_listen_interface("::1").as_deref(),
            Some("[::1]:6881")
        );
        assert_eq!(service.set_listen_interface("[::1]:6881"), None);
    }

    #[test]
    fn flush_respects_debounce_and_force() {
        let service = ConfigurationService::new(CoreSettings::default());
        let _ = service.update(&SessionUpdate {
            dht_enabled: Some(false),
            ..SessionUpdate::default()
        });

        let now = Instant::now();
        assert!(service.take_flush(now, false).is_none(), "inside debounce");
        assert!(service.take_flush(now, true).is_some(), "forced");
        assert!(service.take_flush(now, true).is_none(), "nothing dirty");

        let _ = service.update(&SessionUpdate {
            dht_enabled: Some(true),
            ..SessionUpdate::default()
        });
        assert!(
            service
                .take_flush(now + Duration::from_secs(1), false)
                .is_some(),
            "past the debounce window"
        );
    }

    #[test]
    fn unchanged_update_stays_clean() {
        let service = ConfigurationService::new(CoreSettings::default());
        let delta = service.update(&SessionUpdate::default());
        assert!(!delta.any());
        assert!(service.take_flush(Instant::now(), true).is_none());
    }
}
