use std::collections::HashSet;
use std::time::{Duration, Instant};

use tinytorrent_session::InfoHash;

/// How long without any resume alert before the shutdown gives up waiting.
const RESUME_QUIET_DEADLINE: Duration = Duration::from_secs(5);

/// Tracks the resume-data long tail during shutdown.
///
/// Each receipt (success or failure) removes its hash from the pending set
/// and extends a quiet deadline; the engine exits when the set drains, the
/// deadline lapses, or the hard shutdown timeout fires.
#[derive(Debug, Default)]
pub struct ResumeDataService {
    pending: HashSet<InfoHash>,
    deadline: Option<Instant>,
}

impl ResumeDataService {
    /// An idle service with nothing pending.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the set of hashes a save-all request covered.
    ///
    /// Returns whether anything is actually pending.
    pub fn begin(&mut self, hashes: impl IntoIterator<Item = InfoHash>, now: Instant) -> bool {
        self.pending = hashes.into_iter().collect();
        if self.pending.is_empty() {
            self.deadline = None;
            false
        } else {
            self.deadline = Some(now + RESUME_QUIET_DEADLINE);
            true
        }
    }

    /// Mark one hash complete (data received or generation failed).
    pub fn mark_completed(&mut self, hash: &InfoHash, now: Instant) {
        self.pending.remove(hash);
        if self.pending.is_empty() {
            self.deadline = None;
        } else {
            self.deadline = Some(now + RESUME_QUIET_DEADLINE);
        }
    }

    /// Push the quiet deadline out without completing anything.
    pub fn extend_deadline(&mut self, now: Instant) {
        if !self.pending.is_empty() {
            self.deadline = Some(now + RESUME_QUIET_DEADLINE);
        }
    }

    /// Whether the engine should keep waiting for resume alerts.
    #[must_use]
    pub fn in_progress(&self, now: Instant) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        match self.deadline {
            Some(deadline) => now < deadline,
            None => false,
        }
    }

    /// Hashes still outstanding.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> InfoHash {
        InfoHash::from_bytes([byte; 20])
    }

    #[test]
    fn empty_begin_reports_nothing_pending() {
        let mut service = ResumeDataService::new();
        assert!(!service.begin([], Instant::now()));
        assert!(!service.in_progress(Instant::now()));
    }

    #[test]
    fn completions_drain_the_pending_set() {
        let now = Instant::now();
        let mut service = ResumeDataService::new();
        assert!(service.begin([hash(1), hash(2)], now));
        assert!(service.in_progress(now));

        service.mark_completed(&hash(1), now);
        assert_eq!(service.pending_len(), 1);
        assert!(service.in_progress(now));

        service.mark_completed(&hash(2), now);
        assert!(!service.in_progress(now));
    }

    #[test]
    fn quiet_deadline_expires() {
        let now = Instant::now();
        let mut service = ResumeDataService::new();
        assert!(service.begin([hash(1)], now));
        assert!(service.in_progress(now + Duration::from_secs(4)));
        assert!(!service.in_progress(now + Duration::from_secs(6)));
    }

    #[test]
    fn receipts_extend_the_deadline() {
        let now = Instant::now();
        let mut service = ResumeDataService::new();
        assert!(service.begin([hash(1), hash(2)], now));
        let later = now + Duration::from_secs(4);
        service.mark_completed(&hash(1), later);
        assert!(service.in_progress(later + Duration::from_secs(4)));
    }
}
