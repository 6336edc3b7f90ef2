use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    autocal::{CalibrationReport, CalibrationStatus},
    fault::FaultState,
    fusion::SensorAgreement,
    governor::GovernorState,
    target::ControlMode,
};

/// What displays and consoles see after each cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Control cycles run.
    pub cycle: u64,
    /// Engine speed.
    pub rpm: f32,
    /// Fused manifold pressure, psi; `None` when sensors are invalid.
    pub measured_boost: Option<f32>,
    /// Target boost, psi.
    pub target_boost: f32,
    /// Final duty, percent.
    pub duty: f32,
    /// Persisted aggression.
    pub aggression: f32,
    /// Scramble override active.
    pub scramble: bool,
    /// Fault state, including a latched one still recovering.
    pub fault_state: FaultState,
    /// Human-readable fault reason.
    pub fault_reason: String,
    /// Safety governor state.
    pub governor_state: GovernorState,
    /// Controller mode label.
    pub mode: ControlMode,
    /// Sensor agreement diagnostic.
    pub agreement: SensorAgreement,
    /// Active calibration session.
    pub calibration: Option<CalibrationStatus>,
    /// Last finished calibration session.
    pub last_calibration: Option<CalibrationReport>,
    /// Safety cuts since power-on.
    pub safety_cuts: u64,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            cycle: 0,
            rpm: 0.0,
            measured_boost: None,
            target_boost: 0.0,
            duty: 0.0,
            aggression: 0.0,
            scramble: false,
            fault_state: FaultState::Nominal,
            fault_reason: String::new(),
            governor_state: GovernorState::Armed,
            mode: ControlMode::NaturallyAspirated,
            agreement: SensorAgreement::Unavailable,
            calibration: None,
            last_calibration: None,
            safety_cuts: 0,
        }
    }
}

/// Latest status shared with readers outside the loop.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<StatusSnapshot>>,
}

impl StatusBoard {
    /// Creates a board holding the default snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the snapshot.
    pub fn publish(&self, snapshot: StatusSnapshot) {
        *self.inner.write() = snapshot;
    }

    /// Copy of the latest snapshot.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.read().clone()
    }
}
