use std::{sync::Arc, time::Duration};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
};
use tracing::{debug, instrument, warn};

use super::PersistenceService;

/// Shared view of persistence health, read by the fault monitor.
///
/// Failures are tracked per record key. A key stays failed until that key
/// is written successfully; saving some other record does not clear it.
#[derive(Debug, Clone, Default)]
pub struct StorageHealth {
    inner: Arc<RwLock<HealthInner>>,
}

#[derive(Debug, Default)]
struct HealthInner {
    failing: IndexMap<String, String>,
    consecutive_failures: u32,
    writes: u64,
}

impl StorageHealth {
    /// Records a failed load or save of `key`.
    pub fn record_failure(&self, key: &str, reason: impl Into<String>) {
        let mut inner = self.inner.write();
        inner.failing.insert(key.to_string(), reason.into());
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
    }

    /// Records a successful save of `key`, clearing that key's failure.
    pub fn record_success(&self, key: &str) {
        let mut inner = self.inner.write();
        inner.failing.shift_remove(key);
        if inner.failing.is_empty() {
            inner.consecutive_failures = 0;
        }
        inner.writes = inner.writes.saturating_add(1);
    }

    /// Reason of the oldest unrecovered failure.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner.read().failing.values().next().cloned()
    }

    /// Whether any record is still failing.
    #[must_use]
    pub fn is_faulted(&self) -> bool {
        !self.inner.read().failing.is_empty()
    }

    /// Keys whose last load or save failed.
    #[must_use]
    pub fn failing_keys(&self) -> Vec<String> {
        self.inner.read().failing.keys().cloned().collect()
    }

    /// Failures since storage was last fully healthy.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.read().consecutive_failures
    }

    /// Successful saves since start-up.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.inner.read().writes
    }
}

/// Non-blocking staging side used by the control loop.
#[derive(Debug, Clone, Default)]
pub struct PersistenceHandle {
    staged: Arc<Mutex<IndexMap<String, Vec<u8>>>>,
    notify: Arc<Notify>,
}

impl PersistenceHandle {
    /// Stages `bytes` under `key`, replacing anything staged before.
    pub fn stage(&self, key: impl Into<String>, bytes: Vec<u8>) {
        self.staged.lock().insert(key.into(), bytes);
        self.notify.notify_one();
    }

    /// Wakes the writer when keys are still staged after a failure.
    pub fn nudge(&self) {
        if self.pending() > 0 {
            self.notify.notify_one();
        }
    }

    /// Number of keys waiting to be written.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.staged.lock().len()
    }

    fn drain(&self) -> IndexMap<String, Vec<u8>> {
        std::mem::take(&mut *self.staged.lock())
    }

    fn restage_unless_superseded(&self, key: String, bytes: Vec<u8>) {
        self.staged.lock().entry(key).or_insert(bytes);
    }
}

/// Outcome of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Keys saved.
    pub written: Vec<String>,
    /// Keys that failed, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Batches staged records and writes them after a debounce window.
#[derive(Clone)]
pub struct PersistenceWriter {
    service: Arc<dyn PersistenceService>,
    handle: PersistenceHandle,
    health: StorageHealth,
    debounce: Duration,
}

impl std::fmt::Debug for PersistenceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceWriter")
            .field("pending", &self.handle.pending())
            .field("debounce", &self.debounce)
            .finish_non_exhaustive()
    }
}

impl PersistenceWriter {
    /// Creates a writer over `service`.
    #[must_use]
    pub fn new(service: Arc<dyn PersistenceService>, debounce: Duration) -> Self {
        Self {
            service,
            handle: PersistenceHandle::default(),
            health: StorageHealth::default(),
            debounce,
        }
    }

    /// Staging handle for the control loop.
    #[must_use]
    pub fn handle(&self) -> PersistenceHandle {
        self.handle.clone()
    }

    /// Health shared with the fault monitor.
    #[must_use]
    pub fn health(&self) -> StorageHealth {
        self.health.clone()
    }

    /// Writes everything staged now.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> FlushReport {
        let mut report = FlushReport::default();
        for (key, bytes) in self.handle.drain() {
            match self.service.save(&key, &bytes).await {
                Ok(()) => {
                    self.health.record_success(&key);
                    report.written.push(key);
                }
                Err(err) => {
                    let reason = format!("{key}: {err}");
                    warn!(key = %key, error = %err, "persistence save failed");
                    self.health.record_failure(&key, reason.clone());
                    self.handle.restage_unless_superseded(key.clone(), bytes);
                    report.failed.push((key, reason));
                }
            }
        }
        report
    }

    /// Runs the writer as a background task until shut down.
    #[must_use]
    pub fn spawn(self) -> WriterTask {
        let (shutdown, mut stop) = watch::channel(false);
        let notify = Arc::clone(&self.handle.notify);
        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = notify.notified() => {}
                    _ = stop.changed() => break,
                }
                tokio::select! {
                    () = tokio::time::sleep(self.debounce) => {}
                    _ = stop.changed() => break,
                }
                let report = self.flush().await;
                debug!(
                    written = report.written.len(),
                    failed = report.failed.len(),
                    "persistence batch flushed"
                );
            }
            let _ = self.flush().await;
        });
        WriterTask { shutdown, join }
    }
}

/// Running writer task.
#[derive(Debug)]
pub struct WriterTask {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WriterTask {
    /// Stops the task after a final flush.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            warn!(error = %err, "persistence writer task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{FileStore, MemoryStore};
    use tempfile::tempdir;

    #[tokio::test]
    async fn latest_staged_value_wins() {
        let store = Arc::new(MemoryStore::new());
        let writer = PersistenceWriter::new(store.clone(), Duration::from_millis(5));
        let handle = writer.handle();
        handle.stage("calibration", b"one".to_vec());
        handle.stage("calibration", b"two".to_vec());
        handle.stage("settings", b"s".to_vec());
        let report = writer.flush().await;
        assert_eq!(report.written, vec!["calibration", "settings"]);
        assert_eq!(store.get("calibration").unwrap(), b"two");
        assert_eq!(store.save_log().len(), 2);
        assert_eq!(handle.pending(), 0);
    }

    #[tokio::test]
    async fn failure_keeps_key_staged_and_flags_health() {
        let store = Arc::new(MemoryStore::new());
        let writer = PersistenceWriter::new(store.clone(), Duration::from_millis(5));
        let handle = writer.handle();
        store.set_failing(true);
        handle.stage("safety_params", b"old".to_vec());
        let report = writer.flush().await;
        assert_eq!(report.failed.len(), 1);
        assert!(writer.health().is_faulted());
        assert_eq!(handle.pending(), 1);

        handle.stage("safety_params", b"new".to_vec());
        store.set_failing(false);
        let report = writer.flush().await;
        assert_eq!(report.written, vec!["safety_params"]);
        assert_eq!(store.get("safety_params").unwrap(), b"new");
        assert!(!writer.health().is_faulted());
        assert_eq!(writer.health().writes(), 1);
    }

    #[tokio::test]
    async fn one_failing_key_keeps_storage_faulted() {
        let store = Arc::new(MemoryStore::new());
        let writer = PersistenceWriter::new(store.clone(), Duration::from_millis(5));
        let handle = writer.handle();
        store.fail_key("calibration");
        handle.stage("calibration", b"c".to_vec());
        handle.stage("settings", b"s".to_vec());

        let report = writer.flush().await;
        assert_eq!(report.written, vec!["settings"]);
        assert_eq!(report.failed.len(), 1);
        assert!(writer.health().is_faulted());
        assert_eq!(writer.health().failing_keys(), vec!["calibration"]);
        assert_eq!(handle.pending(), 1);

        handle.stage("settings", b"s2".to_vec());
        writer.flush().await;
        assert!(writer.health().is_faulted());

        store.clear_failures();
        let report = writer.flush().await;
        assert_eq!(report.written, vec!["calibration"]);
        assert!(!writer.health().is_faulted());
        assert_eq!(writer.health().consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn background_task_writes_after_debounce_and_on_shutdown() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path()).unwrap());
        let writer = PersistenceWriter::new(store.clone(), Duration::from_millis(20));
        let handle = writer.handle();
        let task = writer.spawn();

        handle.stage("calibration", b"{}".to_vec());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(dir.path().join("calibration.json").exists());

        handle.stage("settings", b"{}".to_vec());
        task.shutdown().await;
        assert!(dir.path().join("settings.json").exists());
    }
}
