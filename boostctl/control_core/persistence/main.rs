use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::{
    config::{ControllerConfig, SafetyLimits},
    error::{ControlResult, StorageError},
    store::{CalibrationStore, SafetyLearnedParams},
};

/// Debounced background writer and storage health.
pub mod writer;

pub use writer::{FlushReport, PersistenceHandle, PersistenceWriter, StorageHealth, WriterTask};

/// Record key for the calibration store.
pub const CALIBRATION_KEY: &str = "calibration";
/// Record key for learned safety parameters.
pub const SAFETY_PARAMS_KEY: &str = "safety_params";
/// Record key for user settings.
pub const SETTINGS_KEY: &str = "settings";

/// Key-value record storage with atomic replace.
#[async_trait]
pub trait PersistenceService: Send + Sync {
    /// Loads the record stored under `key`.
    async fn load(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    /// Atomically replaces the record stored under `key`.
    async fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;
}

/// One JSON file per key, replaced by temp-write plus rename.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Creates a store rooted at `dir`, creating it if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl PersistenceService for FileStore {
    async fn load(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key);
        let tmp = self.dir.join(format!("{key}.json.tmp"));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// In-memory records with switchable load and save failures.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Vec<u8>>>,
    failing: AtomicBool,
    failing_keys: Mutex<HashSet<String>>,
    unreadable: Mutex<HashSet<String>>,
    saves: Mutex<Vec<String>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent save fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Makes saves of `key` fail until [`MemoryStore::clear_failures`].
    pub fn fail_key(&self, key: &str) {
        self.failing_keys.lock().insert(key.to_string());
    }

    /// Makes loads of `key` fail with an I/O error.
    pub fn fail_load(&self, key: &str) {
        self.unreadable.lock().insert(key.to_string());
    }

    /// Drops every injected failure.
    pub fn clear_failures(&self) {
        self.set_failing(false);
        self.failing_keys.lock().clear();
        self.unreadable.lock().clear();
    }

    /// Stored record, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.records.lock().get(key).cloned()
    }

    /// Keys in the order successful saves happened.
    #[must_use]
    pub fn save_log(&self) -> Vec<String> {
        self.saves.lock().clone()
    }
}

#[async_trait]
impl PersistenceService for MemoryStore {
    async fn load(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        if self.unreadable.lock().contains(key) {
            return Err(std::io::Error::other(format!("{key}: injected read failure")).into());
        }
        self.get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) || self.failing_keys.lock().contains(key) {
            return Err(StorageError::Rejected(format!("{key}: injected failure")));
        }
        self.records.lock().insert(key.to_string(), bytes.to_vec());
        self.saves.lock().push(key.to_string());
        Ok(())
    }
}

/// Persisted user settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PersistedSettings {
    /// Aggression setting.
    pub aggression: f32,
    /// Safety limits.
    pub limits: SafetyLimits,
}

impl PersistedSettings {
    /// Encodes the `settings` record.
    pub fn to_bytes(&self) -> ControlResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Learned data and settings recovered at start-up.
#[derive(Debug, Clone)]
pub struct RestoredState {
    /// Calibration store (seeded when nothing usable was stored).
    pub store: CalibrationStore,
    /// Learned safety parameters.
    pub safety: SafetyLearnedParams,
    /// User settings.
    pub settings: PersistedSettings,
    /// Records the service failed to read, with the reason. The controller
    /// latches these as storage faults.
    pub load_failures: Vec<(String, String)>,
}

/// Loads every record, falling back to defaults for missing or unreadable
/// ones. Corrupt records are logged and reseeded; read failures are also
/// returned in [`RestoredState::load_failures`].
#[instrument(skip_all)]
pub async fn restore(
    service: &dyn PersistenceService,
    config: &ControllerConfig,
) -> ControlResult<RestoredState> {
    let mut load_failures = Vec::new();
    let settings = match load_record(service, SETTINGS_KEY, &mut load_failures).await {
        Some(bytes) => serde_json::from_slice::<PersistedSettings>(&bytes)
            .ok()
            .filter(|settings| {
                settings.limits.check().is_ok()
                    && crate::config::check_aggression(settings.aggression).is_ok()
            }),
        None => None,
    }
    .unwrap_or(PersistedSettings {
        aggression: config.aggression,
        limits: config.limits,
    });

    let store = match load_record(service, CALIBRATION_KEY, &mut load_failures).await {
        Some(bytes) => match CalibrationStore::from_bytes(&bytes) {
            Ok(store) => Some(store),
            Err(err) => {
                warn!(error = %err, "stored calibration unreadable; reseeding");
                None
            }
        },
        None => None,
    };
    let store = match store {
        Some(store) => store,
        None => CalibrationStore::new(&config.grid, settings.limits.spring_pressure)?,
    };

    let safety = load_record(service, SAFETY_PARAMS_KEY, &mut load_failures)
        .await
        .and_then(|bytes| SafetyLearnedParams::from_bytes(&bytes).ok())
        .unwrap_or_default();

    Ok(RestoredState {
        store,
        safety,
        settings,
        load_failures,
    })
}

async fn load_record(
    service: &dyn PersistenceService,
    key: &str,
    failures: &mut Vec<(String, String)>,
) -> Option<Vec<u8>> {
    match service.load(key).await {
        Ok(bytes) => Some(bytes),
        Err(StorageError::NotFound(_)) => None,
        Err(err) => {
            warn!(key, error = %err, "persistence load failed");
            failures.push((key.to_string(), err.to_string()));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn file_store_round_trips_and_reports_missing() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.load("calibration").await,
            Err(StorageError::NotFound(_))
        ));
        store.save("calibration", b"{\"a\":1}").await.unwrap();
        store.save("calibration", b"{\"a\":2}").await.unwrap();
        assert_eq!(store.load("calibration").await.unwrap(), b"{\"a\":2}");
        assert!(!dir.path().join("calibration.json.tmp").exists());
    }

    #[tokio::test]
    async fn memory_store_injects_failures() {
        let store = MemoryStore::new();
        store.set_failing(true);
        assert!(matches!(
            store.save("settings", b"x").await,
            Err(StorageError::Rejected(_))
        ));
        store.set_failing(false);
        store.save("settings", b"x").await.unwrap();
        assert_eq!(store.get("settings").unwrap(), b"x");
    }

    #[tokio::test]
    async fn restore_falls_back_to_defaults() {
        let service = MemoryStore::new();
        service.save(CALIBRATION_KEY, b"not json").await.unwrap();
        let config = ControllerConfig::default();
        let restored = restore(&service, &config).await.unwrap();
        assert_eq!(restored.settings.limits, config.limits);
        assert_eq!(restored.safety, SafetyLearnedParams::default());
        assert_eq!(
            restored.store,
            CalibrationStore::new(&config.grid, config.limits.spring_pressure).unwrap()
        );
        assert!(restored.load_failures.is_empty());
    }

    #[tokio::test]
    async fn restore_reports_read_failures() {
        let service = MemoryStore::new();
        let config = ControllerConfig::default();
        let store = CalibrationStore::new(&config.grid, 5.0).unwrap();
        service
            .save(CALIBRATION_KEY, &store.to_bytes().unwrap())
            .await
            .unwrap();
        service.fail_load(CALIBRATION_KEY);
        assert!(matches!(
            service.load(CALIBRATION_KEY).await,
            Err(StorageError::Io(_))
        ));

        let restored = restore(&service, &config).await.unwrap();
        assert_eq!(restored.load_failures.len(), 1);
        assert_eq!(restored.load_failures[0].0, CALIBRATION_KEY);
        assert_eq!(restored.store, store);
    }

    #[tokio::test]
    async fn restore_reads_saved_records() {
        let service = MemoryStore::new();
        let config = ControllerConfig::default();
        let settings = PersistedSettings {
            aggression: 0.7,
            limits: SafetyLimits {
                max_boost_psi: 8.0,
                ..SafetyLimits::default()
            },
        };
        service
            .save(SETTINGS_KEY, &settings.to_bytes().unwrap())
            .await
            .unwrap();
        let mut store = CalibrationStore::new(&config.grid, 5.0).unwrap();
        store.learn(3000.0, 8.0, 7.0, &config.learning, 1);
        service
            .save(CALIBRATION_KEY, &store.to_bytes().unwrap())
            .await
            .unwrap();
        let restored = restore(&service, &config).await.unwrap();
        assert_eq!(restored.settings, settings);
        assert_eq!(restored.store, store);
    }
}
