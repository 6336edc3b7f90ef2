#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! Torque-following boost control core: sensor fusion, target resolution,
//! learned duty synthesis, a hard safety governor and progressive
//! auto-calibration, driven by a fixed-rate control loop.

/// Error taxonomy shared by every control component.
#[path = "../error.rs"]
pub mod error;

/// Controller configuration and user-owned safety limits.
#[path = "../config.rs"]
pub mod config;

/// Per-cycle input snapshots and the producer/loop handoff.
#[path = "../sample.rs"]
pub mod sample;

/// Pressure sensor fusion across vacuum and boost ranges.
#[path = "../fusion.rs"]
pub mod fusion;

/// Fault aggregation feeding the safety governor.
#[path = "../fault.rs"]
pub mod fault;

/// Level 1: torque gap to target boost.
#[path = "../target.rs"]
pub mod target;

/// Learned calibration data and its update rules.
#[path = "../store/main.rs"]
pub mod store;

/// Level 2: baseline lookup plus PID correction.
#[path = "../synth/main.rs"]
pub mod synth;

/// Level 3: overboost enforcement and final duty ownership.
#[path = "../governor/main.rs"]
pub mod governor;

/// Progressive auto-calibration state machine.
#[path = "../autocal/main.rs"]
pub mod autocal;

/// Key-value persistence and the debounced background writer.
#[path = "../persistence/main.rs"]
pub mod persistence;

/// PWM driver seam and phase-aligned update scheduling.
#[path = "../pwm.rs"]
pub mod pwm;

/// Telemetry builder/hook for control components.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Cycle orchestration, commands and status.
#[path = "../controller/main.rs"]
pub mod controller;

/// Fixed-rate async control loop.
#[path = "../main.rs"]
pub mod runtime;

pub use autocal::{
    AutoCalibrationEngine, CalibrationPhase, CalibrationReport, CalibrationRequest,
    CalibrationStatus,
};
pub use config::{ControllerConfig, SafetyLimits};
pub use controller::{
    BoostController, BoostControllerBuilder, Command, CommandOutcome, ControlMode, CycleReport,
    StatusBoard, StatusSnapshot,
};
pub use error::{CommandError, ControlError, StorageError};
pub use fault::{FaultMonitor, FaultReport, FaultState};
pub use governor::{GovernorState, SafetyGovernor};
pub use persistence::{
    restore, FileStore, MemoryStore, PersistenceService, PersistenceWriter, RestoredState,
};
pub use pwm::{PwmDriver, RecordingPwm};
pub use runtime::{ControlRuntime, ControllerHandle, LoopClock};
pub use sample::{BusTelemetry, OperatingSample, RawSensorFrame, SampleExchange, SensorInputs};
pub use store::{CalibrationPoint, CalibrationStore, ResetScope};
pub use telemetry::{ControlTelemetry, ControlTelemetryBuilder};
