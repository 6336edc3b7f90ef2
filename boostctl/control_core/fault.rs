use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sample::BusTelemetry;

/// System fault state consumed by the safety governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultState {
    /// No fault.
    Nominal,
    /// Pressure reading invalid or stale.
    SensorFault,
    /// Bus telemetry absent, stale or malformed.
    BusFault,
    /// Persistence failing.
    StorageFault,
    /// Measured boost at or above the active limit.
    Overboost,
}

impl FaultState {
    /// Whether this state forces the governor to cut.
    #[must_use]
    pub const fn is_fault(self) -> bool {
        !matches!(self, Self::Nominal)
    }
}

impl fmt::Display for FaultState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Nominal => "nominal",
            Self::SensorFault => "sensor fault",
            Self::BusFault => "bus fault",
            Self::StorageFault => "storage fault",
            Self::Overboost => "overboost",
        };
        f.write_str(label)
    }
}

/// Fault state with its reason and onset time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultReport {
    /// Current state.
    pub state: FaultState,
    /// Human-readable reason, empty when nominal.
    pub reason: String,
    /// Loop time the current state began.
    pub since_ms: u64,
}

impl FaultReport {
    /// Nominal report starting at `now_ms`.
    #[must_use]
    pub const fn nominal(now_ms: u64) -> Self {
        Self {
            state: FaultState::Nominal,
            reason: String::new(),
            since_ms: now_ms,
        }
    }
}

/// Health signals gathered before the monitor runs.
#[derive(Debug, Clone, Copy)]
pub struct FaultInputs<'a> {
    /// Sensor fusion failure, if fusion rejected this cycle's frame.
    pub sensor_error: Option<&'a str>,
    /// Latest bus frame.
    pub bus: Option<&'a BusTelemetry>,
    /// Fused manifold pressure, when valid.
    pub measured_psi: Option<f32>,
    /// Overboost limit in force this cycle.
    pub overboost_limit: f32,
    /// Last persistence failure, if storage is unhealthy.
    pub storage_error: Option<&'a str>,
    /// Cycle time.
    pub now_ms: u64,
}

/// Aggregates sensor, bus, pressure and storage health.
///
/// Priority when several conditions hold: sensor, bus, overboost, storage.
/// The monitor is the only writer of [`FaultState`].
#[derive(Debug, Clone)]
pub struct FaultMonitor {
    bus_timeout_ms: u64,
    current: FaultReport,
}

impl FaultMonitor {
    /// Creates a monitor.
    #[must_use]
    pub const fn new(bus_timeout_ms: u64) -> Self {
        Self {
            bus_timeout_ms,
            current: FaultReport::nominal(0),
        }
    }

    /// Evaluates this cycle's health and returns the resulting report.
    pub fn evaluate(&mut self, inputs: &FaultInputs<'_>) -> &FaultReport {
        let (state, reason) = self.classify(inputs);
        if state == self.current.state {
            self.current.reason = reason;
        } else {
            self.current = FaultReport {
                state,
                reason,
                since_ms: inputs.now_ms,
            };
        }
        &self.current
    }

    /// Last evaluated report.
    #[must_use]
    pub const fn current(&self) -> &FaultReport {
        &self.current
    }

    fn classify(&self, inputs: &FaultInputs<'_>) -> (FaultState, String) {
        if let Some(reason) = inputs.sensor_error {
            return (FaultState::SensorFault, reason.to_string());
        }
        if let Some(reason) = self.bus_problem(inputs.bus, inputs.now_ms) {
            return (FaultState::BusFault, reason);
        }
        if let Some(measured) = inputs.measured_psi {
            if measured >= inputs.overboost_limit {
                return (
                    FaultState::Overboost,
                    format!(
                        "boost {measured:.2} psi at or above limit {:.2} psi",
                        inputs.overboost_limit
                    ),
                );
            }
        }
        if let Some(reason) = inputs.storage_error {
            return (FaultState::StorageFault, reason.to_string());
        }
        (FaultState::Nominal, String::new())
    }

    fn bus_problem(&self, bus: Option<&BusTelemetry>, now_ms: u64) -> Option<String> {
        let Some(bus) = bus else {
            return Some("no bus telemetry received".into());
        };
        let age = now_ms.saturating_sub(bus.timestamp_ms);
        if age > self.bus_timeout_ms {
            return Some(format!(
                "bus telemetry {age} ms old (timeout {} ms)",
                self.bus_timeout_ms
            ));
        }
        if bus.stale {
            return Some("bus decoder reports stale signal".into());
        }
        if !(bus.rpm.is_finite() && bus.desired_torque.is_finite() && bus.actual_torque.is_finite())
            || bus.rpm < 0.0
        {
            return Some("malformed bus signal".into());
        }
        None
    }
}
