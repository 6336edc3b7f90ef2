use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Values decoded from the vehicle bus.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BusTelemetry {
    /// Engine speed.
    pub rpm: f32,
    /// Torque requested by the engine controller, Nm.
    pub desired_torque: f32,
    /// Torque delivered, Nm.
    pub actual_torque: f32,
    /// Manifold absolute pressure, kPa, when the bus provides it.
    pub map_kpa: Option<f32>,
    /// Intake air temperature, °C.
    pub intake_air_temp_c: Option<f32>,
    /// Barometric pressure, kPa.
    pub baro_kpa: Option<f32>,
    /// Time the frame was decoded, loop milliseconds.
    pub timestamp_ms: u64,
    /// Set by the decoder when the source signal stopped updating.
    pub stale: bool,
}

/// Calibrated transducer voltages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawSensorFrame {
    /// Manifold pressure transducer.
    pub manifold_mv: f32,
    /// Dome supply (input) pressure transducer.
    pub dome_input_mv: f32,
    /// Upper dome pressure transducer.
    pub dome_upper_mv: f32,
    /// Time the frame was sampled, loop milliseconds.
    pub timestamp_ms: u64,
}

/// Everything the producers know at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorInputs {
    /// Latest bus frame, if any has arrived.
    pub bus: Option<BusTelemetry>,
    /// Latest transducer frame, if any has arrived.
    pub sensors: Option<RawSensorFrame>,
}

/// Immutable per-cycle snapshot consumed by every component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OperatingSample {
    /// Engine speed.
    pub rpm: f32,
    /// Torque requested by the engine controller.
    pub desired_torque: f32,
    /// Torque delivered.
    pub actual_torque: f32,
    /// Fused manifold pressure, gauge psi.
    pub manifold_pressure: f32,
    /// Dome supply pressure, psi.
    pub dome_input_pressure: f32,
    /// Upper dome pressure, psi.
    pub dome_upper_pressure: f32,
    /// Intake air temperature, °C.
    pub intake_air_temp_c: Option<f32>,
    /// Barometric pressure, kPa.
    pub baro_kpa: Option<f32>,
    /// Cycle time, loop milliseconds.
    pub timestamp_ms: u64,
}

impl OperatingSample {
    /// Desired minus actual torque.
    #[must_use]
    pub fn torque_error(&self) -> f32 {
        self.desired_torque - self.actual_torque
    }
}

/// Latest-value handoff between producers and the control loop.
///
/// Producers replace the whole [`SensorInputs`] behind one `Arc`; the loop
/// clones the pointer, so it never observes a half-updated frame.
#[derive(Debug, Clone, Default)]
pub struct SampleExchange {
    slot: Arc<RwLock<Arc<SensorInputs>>>,
}

impl SampleExchange {
    /// Creates an empty exchange.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the published inputs.
    pub fn publish(&self, inputs: SensorInputs) {
        *self.slot.write() = Arc::new(inputs);
    }

    /// Publishes a new bus frame, keeping the latest sensor frame.
    pub fn publish_bus(&self, bus: BusTelemetry) {
        let mut slot = self.slot.write();
        let next = SensorInputs {
            bus: Some(bus),
            ..**slot
        };
        *slot = Arc::new(next);
    }

    /// Publishes a new sensor frame, keeping the latest bus frame.
    pub fn publish_sensors(&self, sensors: RawSensorFrame) {
        let mut slot = self.slot.write();
        let next = SensorInputs {
            sensors: Some(sensors),
            ..**slot
        };
        *slot = Arc::new(next);
    }

    /// Consistent snapshot of the latest inputs.
    #[must_use]
    pub fn snapshot(&self) -> Arc<SensorInputs> {
        Arc::clone(&self.slot.read())
    }
}
