use thiserror::Error;

/// Crate-wide control error.
#[derive(Debug, Error)]
pub enum ControlError {
    /// A pressure reading is implausible or stale.
    #[error("sensor invalid: {0}")]
    SensorInvalid(String),
    /// Bus telemetry is absent, stale or malformed.
    #[error("bus fault: {0}")]
    BusFault(String),
    /// Persistence collaborator failure.
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    /// A safety event interrupted calibration.
    #[error("calibration unsafe: {0}")]
    CalibrationUnsafe(String),
    /// Persisted record could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors returned at the command boundary. A rejected command is never
/// partially applied.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CommandError {
    /// A value lies outside its permitted range.
    #[error("{field}={value} out of range: {reason}")]
    InvalidRange {
        /// Offending field.
        field: &'static str,
        /// Rejected value.
        value: f32,
        /// Why the value was rejected.
        reason: String,
    },
    /// The command conflicts with an active calibration session.
    #[error("calibration in progress")]
    CalibrationInProgress,
    /// The command needs storage and storage is faulted.
    #[error("storage unavailable")]
    StorageUnavailable,
    /// The governor is not armed.
    #[error("safety cut active")]
    SafetyCutActive,
    /// Abort requested without a calibration session.
    #[error("no calibration session")]
    NoCalibrationSession,
    /// The control loop is gone.
    #[error("controller closed")]
    Closed,
}

/// Errors reported by the persistence collaborator.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No record stored under the key.
    #[error("record not found: {0}")]
    NotFound(String),
    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The backend refused the write.
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Convenience alias for control results.
pub type ControlResult<T> = Result<T, ControlError>;

impl CommandError {
    /// Builds an [`CommandError::InvalidRange`].
    #[must_use]
    pub fn invalid(field: &'static str, value: f32, reason: impl Into<String>) -> Self {
        Self::InvalidRange {
            field,
            value,
            reason: reason.into(),
        }
    }
}
