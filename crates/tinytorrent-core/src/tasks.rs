use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tracing::debug;

/// Dispatcher for filesystem-heavy work.
///
/// Directory scans, metainfo reads and blocklist parsing all run here so
/// the engine loop never touches the filesystem. After `stop`, submissions
/// are dropped silently; in-flight jobs run to completion.
#[derive(Debug, Clone)]
pub struct IoTaskService {
    stopped: Arc<AtomicBool>,
}

impl IoTaskService {
    /// A running service.
    #[must_use]
    pub fn new() -> Self {
        Self {
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run `job` on the blocking pool, unless the service was stopped.
    pub fn submit<T, F>(&self, job: F) -> Option<JoinHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.stopped.load(Ordering::Acquire) {
            debug!("io task dropped after stop");
            return None;
        }
        Some(tokio::task::spawn_blocking(job))
    }

    /// Stop accepting new work.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Whether the service still accepts work.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
    }
}

impl Default for IoTaskService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submitted_jobs_run() {
        let service = IoTaskService::new();
        let handle = service.submit(|| 41 + 1).expect("service running");
        assert_eq!(handle.await.expect("join"), 42);
    }

    #[tokio::test]
    async fn submissions_after_stop_are_dropped() {
        let service = IoTaskService::new();
        service.stop();
        assert!(!service.is_running());
        assert!(service.submit(|| ()).is_none());
    }
}
