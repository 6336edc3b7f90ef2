use serde::Serialize;
use serde_json::json;
use shared_logging::LogLevel;
use tracing::warn;

/// User commands and their application.
pub mod command;
/// Status snapshot shared with displays and consoles.
pub mod status;

pub use crate::target::ControlMode;
pub use command::{Command, CommandOutcome};
pub use status::{StatusBoard, StatusSnapshot};

use crate::{
    autocal::{AutoCalibrationEngine, CalibrationEvent, CalibrationTick},
    config::{ControllerConfig, SafetyLimits},
    error::{ControlError, ControlResult},
    fault::{FaultInputs, FaultMonitor, FaultReport, FaultState},
    fusion::{FusionReading, SensorAgreement, SensorFusion},
    governor::{GovernorInput, GovernorState, SafetyGovernor},
    persistence::{
        PersistedSettings, PersistenceHandle, RestoredState, StorageHealth, CALIBRATION_KEY,
        SAFETY_PARAMS_KEY, SETTINGS_KEY,
    },
    pwm::{PwmDriver, PwmPhaseScheduler, RecordingPwm},
    sample::{OperatingSample, SensorInputs},
    store::{CalibrationStore, EnvironmentReadings, LearningOutcome, SafetyLearnedParams},
    synth::{DutyCandidate, DutySynthesizer},
    target::{BoostTargetResolver, TargetDecision, TargetSource},
    telemetry::ControlTelemetry,
};

/// Everything that happened in one control cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    /// Cycle number, starting at 1.
    pub cycle: u64,
    /// Cycle time.
    pub now_ms: u64,
    /// Snapshot the cycle ran on; `None` when bus or sensors were unusable.
    pub sample: Option<OperatingSample>,
    /// Fusion output, when the sensors were valid.
    pub fusion: Option<FusionReading>,
    /// Fault monitor output.
    pub fault: FaultReport,
    /// Target boost, psi.
    pub target_psi: f32,
    /// Mode label.
    pub mode: ControlMode,
    /// Synthesizer output before the governor.
    pub candidate: DutyCandidate,
    /// Final duty, percent.
    pub duty_percent: f32,
    /// Value written to the PWM driver this cycle, if any.
    pub pwm_write: Option<f32>,
    /// Governor state after this cycle.
    pub governor: GovernorState,
    /// Calibration transitions.
    pub calibration_events: Vec<CalibrationEvent>,
    /// Set when a safety event aborted calibration this cycle.
    pub calibration_unsafe: Option<String>,
    /// Trim update applied this cycle.
    pub learning: Option<LearningOutcome>,
}

/// Builder for [`BoostController`].
pub struct BoostControllerBuilder {
    config: ControllerConfig,
    restored: Option<RestoredState>,
    pwm: Option<Box<dyn PwmDriver>>,
    persistence: Option<(PersistenceHandle, StorageHealth)>,
    telemetry: Option<ControlTelemetry>,
}

impl BoostControllerBuilder {
    /// Starts from a configuration.
    #[must_use]
    pub const fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            restored: None,
            pwm: None,
            persistence: None,
            telemetry: None,
        }
    }

    /// Uses learned data and settings loaded at start-up.
    #[must_use]
    pub fn restored(mut self, state: RestoredState) -> Self {
        self.restored = Some(state);
        self
    }

    /// Sets the PWM driver.
    #[must_use]
    pub fn pwm(mut self, driver: impl PwmDriver + 'static) -> Self {
        self.pwm = Some(Box::new(driver));
        self
    }

    /// Connects the persistence writer.
    #[must_use]
    pub fn persistence(mut self, handle: PersistenceHandle, health: StorageHealth) -> Self {
        self.persistence = Some((handle, health));
        self
    }

    /// Attaches telemetry sinks.
    #[must_use]
    pub fn telemetry(mut self, telemetry: ControlTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Validates the configuration and builds the controller.
    ///
    /// Records that could not be read at start-up are latched as storage
    /// faults and restaged from the values now in force; the first
    /// successful write of each clears its fault.
    pub fn build(self) -> ControlResult<BoostController> {
        let config = self.config;
        config.validate()?;
        let mut load_failures = Vec::new();
        let (store, safety, settings) = match self.restored {
            Some(state) => {
                load_failures = state.load_failures;
                (state.store, state.safety, state.settings)
            }
            None => (
                CalibrationStore::new(&config.grid, config.limits.spring_pressure)?,
                SafetyLearnedParams::default(),
                PersistedSettings {
                    aggression: config.aggression,
                    limits: config.limits,
                },
            ),
        };
        let (persistence, health) = self.persistence.unzip();
        if let Some(health) = &health {
            for (key, reason) in &load_failures {
                health.record_failure(key, format!("{key}: load failed: {reason}"));
            }
        }
        let mut controller = BoostController {
            fusion: SensorFusion::new(config.fusion, config.timing.sensor_timeout_ms),
            monitor: FaultMonitor::new(config.timing.bus_timeout_ms),
            resolver: BoostTargetResolver::new(config.resolver),
            synth: DutySynthesizer::new(config.pid),
            governor: SafetyGovernor::new(
                config.timing.max_duty_slew_per_s,
                config.timing.recovery_hold_ms,
            ),
            autocal: AutoCalibrationEngine::new(config.calibration),
            scheduler: PwmPhaseScheduler::new(&config.timing),
            pwm: self.pwm.unwrap_or_else(|| Box::new(RecordingPwm::new())),
            store,
            safety,
            limits: settings.limits,
            aggression: settings.aggression,
            scramble: false,
            persistence,
            health,
            telemetry: self.telemetry,
            cycle: 0,
            last_cycle_ms: None,
            last_stage_ms: 0,
            store_dirty: false,
            storage_reported: false,
            previous: None,
            view: CycleView::default(),
            config,
        };
        for (key, _) in &load_failures {
            controller.stage_key(key);
        }
        Ok(controller)
    }
}

/// Target and operating point of a steady cycle, learned from on the next.
#[derive(Debug, Clone, Copy)]
struct PreviousCycle {
    rpm: f32,
    target_psi: f32,
}

#[derive(Debug, Clone)]
struct CycleView {
    rpm: f32,
    measured: Option<f32>,
    target: f32,
    mode: ControlMode,
    agreement: SensorAgreement,
    fault: FaultReport,
}

impl Default for CycleView {
    fn default() -> Self {
        Self {
            rpm: 0.0,
            measured: None,
            target: 0.0,
            mode: ControlMode::NaturallyAspirated,
            agreement: SensorAgreement::Unavailable,
            fault: FaultReport::nominal(0),
        }
    }
}

/// Runs the ordered control cycle: fusion, fault monitor, target (or
/// calibration), synthesis, governor, PWM, learning.
///
/// All state lives here and is touched only from [`BoostController::run_cycle`]
/// and [`BoostController::apply`], so nothing mutates mid-cycle.
pub struct BoostController {
    config: ControllerConfig,
    fusion: SensorFusion,
    monitor: FaultMonitor,
    resolver: BoostTargetResolver,
    synth: DutySynthesizer,
    governor: SafetyGovernor,
    autocal: AutoCalibrationEngine,
    scheduler: PwmPhaseScheduler,
    pwm: Box<dyn PwmDriver>,
    store: CalibrationStore,
    safety: SafetyLearnedParams,
    limits: SafetyLimits,
    aggression: f32,
    scramble: bool,
    persistence: Option<PersistenceHandle>,
    health: Option<StorageHealth>,
    telemetry: Option<ControlTelemetry>,
    cycle: u64,
    last_cycle_ms: Option<u64>,
    last_stage_ms: u64,
    store_dirty: bool,
    storage_reported: bool,
    previous: Option<PreviousCycle>,
    view: CycleView,
}

impl std::fmt::Debug for BoostController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoostController")
            .field("cycle", &self.cycle)
            .field("limits", &self.limits)
            .field("aggression", &self.aggression)
            .field("governor", &self.governor.state())
            .finish_non_exhaustive()
    }
}

impl BoostController {
    /// Creates a builder.
    #[must_use]
    pub const fn builder(config: ControllerConfig) -> BoostControllerBuilder {
        BoostControllerBuilder::new(config)
    }

    /// Runs one control cycle on a consistent input snapshot.
    pub fn run_cycle(&mut self, inputs: &SensorInputs, now_ms: u64) -> CycleReport {
        self.cycle += 1;
        let cycle = self.cycle;
        let dt_s = self.cycle_dt(now_ms);
        let limits = self.effective_limits();
        let hysteresis = self.safety.effective_hysteresis(&limits);

        // Sensor fusion.
        let fused = inputs.sensors.map_or_else(
            || Err(ControlError::SensorInvalid("no sensor frame received".into())),
            |frame| {
                self.fusion.fuse(
                    &frame,
                    inputs.bus.and_then(|bus| bus.map_kpa),
                    self.store.fusion_offset().offset_psi,
                    now_ms,
                )
            },
        );
        let (reading, sensor_error) = match fused {
            Ok(reading) => (Some(reading), None),
            Err(err) => (None, Some(err.to_string())),
        };
        let measured = reading.map(|reading| reading.manifold_psi);

        // Fault monitor.
        let storage_error = self.health.as_ref().and_then(StorageHealth::last_error);
        self.report_storage(storage_error.as_deref(), cycle);
        let fault = self
            .monitor
            .evaluate(&FaultInputs {
                sensor_error: sensor_error.as_deref(),
                bus: inputs.bus.as_ref(),
                measured_psi: measured,
                overboost_limit: limits.overboost_limit,
                storage_error: storage_error.as_deref(),
                now_ms,
            })
            .clone();

        let sample = match (inputs.bus, reading) {
            (Some(bus), Some(reading)) => Some(OperatingSample {
                rpm: bus.rpm,
                desired_torque: bus.desired_torque,
                actual_torque: bus.actual_torque,
                manifold_pressure: reading.manifold_psi,
                dome_input_pressure: reading.dome_input_psi,
                dome_upper_pressure: reading.dome_upper_psi,
                intake_air_temp_c: bus.intake_air_temp_c,
                baro_kpa: bus.baro_kpa,
                timestamp_ms: now_ms,
            }),
            _ => None,
        };
        let rpm = sample.map_or(0.0, |sample| sample.rpm);

        // Target: calibration owns it while a session runs.
        let calibrating = self.autocal.is_active();
        let mut calibration_events = Vec::new();
        let source = if calibrating {
            let tick = CalibrationTick {
                rpm: sample.map_or(f32::NAN, |sample| sample.rpm),
                measured_psi: measured,
                applied_duty: self.governor.last_duty_percent() / 100.0,
                now_ms,
            };
            let step = self.autocal.tick(&tick, &self.limits, &mut self.store);
            let target_psi = step.map_or(0.0, |step| {
                calibration_events = step.events;
                step.target_psi
            });
            TargetSource::Calibration { target_psi }
        } else {
            TargetSource::TorqueFollowing
        };
        let aggression = self.active_aggression();
        let TargetDecision {
            target_psi,
            mode: resolved_mode,
        } = self
            .resolver
            .select(source, sample.as_ref(), aggression, &self.limits, dt_s);

        // Synthesis; the PID only integrates while it can act.
        let armed = self.governor.state() == GovernorState::Armed;
        let synth_target = if armed && !fault.state.is_fault() {
            target_psi
        } else {
            0.0
        };
        let candidate = self.synth.synthesize(
            synth_target,
            measured.unwrap_or(0.0),
            rpm,
            &self.store,
            dt_s,
        );

        // Governor.
        let decision = self.governor.govern(&GovernorInput {
            candidate_duty: candidate.duty,
            measured_psi: measured,
            fault: &fault,
            limits: &limits,
            hysteresis_psi: hysteresis,
            now_ms,
            dt_s,
        });
        let mut calibration_unsafe = None;
        if let Some(latched) = &decision.newly_latched {
            self.log_cycle(
                cycle,
                LogLevel::Warn,
                "fault latched",
                json!({ "kind": latched.kind, "reason": latched.reason, "measured_psi": measured }),
            );
            self.event(
                cycle,
                "control.fault.latched",
                json!({ "kind": latched.kind, "reason": latched.reason, "at_ms": latched.at_ms }),
            );
            if let Some(report) = self
                .autocal
                .abort_on_safety(&latched.reason, &self.limits, now_ms)
            {
                let err = ControlError::CalibrationUnsafe(report.reason.clone());
                warn!(error = %err, ceiling_psi = report.ceiling_psi, "calibration aborted");
                calibration_unsafe = Some(err.to_string());
                calibration_events.push(CalibrationEvent::Finished(report));
            }
        }
        if let Some(event) = &decision.recovered {
            if event.kind == FaultState::Overboost {
                let overshoot = event.overshoot_psi().unwrap_or(0.0);
                let response = event.cleared_after_ms.unwrap_or_default();
                self.safety.record_event(
                    overshoot,
                    Self::millis_f32(response),
                    self.config.learning.safety_rate,
                );
                self.stage_safety();
            }
            self.event(
                cycle,
                "control.fault.cleared",
                json!({ "kind": event.kind, "recovered_after_ms": event.recovered_after_ms }),
            );
        }

        // PWM.
        let pwm_write = self.scheduler.schedule(decision.duty_percent, now_ms);
        if let Some(duty) = pwm_write {
            self.pwm.set_duty(duty);
        }
        if let Some(applied) = self.scheduler.applied() {
            self.governor.settle_applied(applied);
        }

        // Learning, from the previous steady cycle's target and this cycle's
        // measurement.
        let steady = decision.state == GovernorState::Armed
            && !fault.state.is_fault()
            && !calibrating
            && !self.autocal.is_active();
        let mut learning = None;
        if steady {
            if let (Some(previous), Some(psi)) = (self.previous, measured) {
                learning = self.store.learn(
                    previous.rpm,
                    previous.target_psi,
                    psi,
                    &self.config.learning,
                    now_ms,
                );
            }
            if let (Some(sample), Some(reading)) = (&sample, &reading) {
                self.store.update_environment(
                    &EnvironmentReadings {
                        intake_air_temp_c: sample.intake_air_temp_c,
                        baro_kpa: sample.baro_kpa,
                        supply_psi: Some(reading.dome_input_psi),
                    },
                    &self.config.learning,
                );
                if let Some(offset) = reading.offset_sample {
                    self.store.update_fusion_offset(offset, &self.config.learning);
                }
            }
            self.store_dirty = true;
        }
        self.previous = sample
            .filter(|_| {
                steady
                    && resolved_mode == ControlMode::Holding
                    && target_psi >= self.limits.spring_pressure
            })
            .map(|sample| PreviousCycle {
                rpm: sample.rpm,
                target_psi,
            });

        let calibration_changed = calibration_events.iter().any(|event| {
            matches!(
                event,
                CalibrationEvent::Committed { .. } | CalibrationEvent::Finished(_)
            )
        });
        if calibration_changed {
            self.store_dirty = true;
            self.resolver.reset();
        }
        self.publish_calibration_events(cycle, &calibration_events);
        self.maybe_stage(now_ms);

        let mode = if decision.state == GovernorState::Armed {
            resolved_mode
        } else {
            ControlMode::SafetyCut
        };
        self.view = CycleView {
            rpm,
            measured,
            target: target_psi,
            mode,
            agreement: reading.map_or(SensorAgreement::Unavailable, |reading| reading.agreement),
            fault: fault.clone(),
        };
        self.log_cycle(
            cycle,
            LogLevel::Trace,
            "cycle",
            json!({
                "target_psi": target_psi,
                "measured_psi": measured,
                "duty": decision.duty_percent,
                "governor": decision.state,
            }),
        );

        CycleReport {
            cycle,
            now_ms,
            sample,
            fusion: reading,
            fault,
            target_psi,
            mode,
            candidate,
            duty_percent: decision.duty_percent,
            pwm_write,
            governor: decision.state,
            calibration_events,
            calibration_unsafe,
            learning,
        }
    }

    /// Status for displays.
    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        let (fault_state, fault_reason) = self.governor.latched().map_or_else(
            || (self.view.fault.state, self.view.fault.reason.clone()),
            |latched| (latched.kind, latched.reason.clone()),
        );
        StatusSnapshot {
            cycle: self.cycle,
            rpm: self.view.rpm,
            measured_boost: self.view.measured,
            target_boost: self.view.target,
            duty: self.governor.last_duty_percent(),
            aggression: self.aggression,
            scramble: self.scramble,
            fault_state,
            fault_reason,
            governor_state: self.governor.state(),
            mode: self.view.mode,
            agreement: self.view.agreement,
            calibration: self.autocal.status(&self.limits),
            last_calibration: self.autocal.last_report().cloned(),
            safety_cuts: self.governor.history().total(),
        }
    }

    /// Persisted aggression.
    #[must_use]
    pub const fn aggression(&self) -> f32 {
        self.aggression
    }

    /// Aggression used this cycle: 1.0 under scramble.
    #[must_use]
    pub const fn active_aggression(&self) -> f32 {
        if self.scramble {
            1.0
        } else {
            self.aggression
        }
    }

    /// Scramble override state.
    #[must_use]
    pub const fn scramble(&self) -> bool {
        self.scramble
    }

    /// User limits.
    #[must_use]
    pub const fn limits(&self) -> SafetyLimits {
        self.limits
    }

    /// Limits in force this cycle: the calibration ceiling, while a session
    /// runs, lowers the overboost limit.
    #[must_use]
    pub fn effective_limits(&self) -> SafetyLimits {
        let mut limits = self.limits;
        if let Some(ceiling) = self.autocal.ceiling_psi() {
            limits.overboost_limit = limits.overboost_limit.min(ceiling);
        }
        limits
    }

    /// In-memory calibration store.
    #[must_use]
    pub const fn store(&self) -> &CalibrationStore {
        &self.store
    }

    /// Learned safety parameters.
    #[must_use]
    pub const fn safety_params(&self) -> &SafetyLearnedParams {
        &self.safety
    }

    /// Safety governor.
    #[must_use]
    pub const fn governor(&self) -> &SafetyGovernor {
        &self.governor
    }

    /// Auto-calibration engine.
    #[must_use]
    pub const fn autocal(&self) -> &AutoCalibrationEngine {
        &self.autocal
    }

    /// Stages every record, e.g. before shutdown.
    pub fn stage_all(&mut self) {
        self.stage_store();
        self.stage_safety();
        self.stage_settings();
    }

    fn cycle_dt(&mut self, now_ms: u64) -> f32 {
        let period = self.config.timing.period_s();
        let dt = self.last_cycle_ms.map_or(period, |last| {
            Self::millis_f32(now_ms.saturating_sub(last)) / 1000.0
        });
        self.last_cycle_ms = Some(now_ms);
        dt.clamp(0.0, period * 5.0)
    }

    #[allow(clippy::cast_precision_loss)]
    fn millis_f32(ms: u64) -> f32 {
        ms as f32
    }

    fn storage_faulted(&self) -> bool {
        self.health.as_ref().is_some_and(StorageHealth::is_faulted)
    }

    fn report_storage(&mut self, error: Option<&str>, cycle: u64) {
        match (error, self.storage_reported) {
            (Some(reason), false) => {
                self.storage_reported = true;
                self.event(
                    cycle,
                    "control.storage.failed",
                    json!({ "reason": reason }),
                );
            }
            (None, true) => self.storage_reported = false,
            _ => {}
        }
    }

    fn maybe_stage(&mut self, now_ms: u64) {
        if now_ms.saturating_sub(self.last_stage_ms) < self.config.persistence.stage_interval_ms {
            return;
        }
        self.last_stage_ms = now_ms;
        if self.store_dirty {
            self.stage_store();
        } else if self.storage_faulted() {
            if let Some(handle) = &self.persistence {
                handle.nudge();
            }
        }
    }

    fn stage_key(&mut self, key: &str) {
        match key {
            CALIBRATION_KEY => self.stage_store(),
            SAFETY_PARAMS_KEY => self.stage_safety(),
            SETTINGS_KEY => self.stage_settings(),
            _ => {}
        }
    }

    fn stage_store(&mut self) {
        self.store_dirty = false;
        if let Some(handle) = &self.persistence {
            match self.store.to_bytes() {
                Ok(bytes) => handle.stage(CALIBRATION_KEY, bytes),
                Err(err) => warn!(error = %err, "calibration store not staged"),
            }
        }
    }

    fn stage_safety(&self) {
        if let Some(handle) = &self.persistence {
            match self.safety.to_bytes() {
                Ok(bytes) => handle.stage(SAFETY_PARAMS_KEY, bytes),
                Err(err) => warn!(error = %err, "safety parameters not staged"),
            }
        }
    }

    fn stage_settings(&self) {
        if let Some(handle) = &self.persistence {
            let settings = PersistedSettings {
                aggression: self.aggression,
                limits: self.limits,
            };
            match settings.to_bytes() {
                Ok(bytes) => handle.stage(SETTINGS_KEY, bytes),
                Err(err) => warn!(error = %err, "settings not staged"),
            }
        }
    }

    fn publish_calibration_events(&self, cycle: u64, events: &[CalibrationEvent]) {
        for event in events {
            match event {
                CalibrationEvent::PhaseChanged { from, to } => self.event(
                    cycle,
                    "control.calibration.phase",
                    json!({ "from": from, "to": to }),
                ),
                CalibrationEvent::Finished(report) => {
                    self.event(cycle, "control.calibration.finished", json!(report));
                }
                CalibrationEvent::Committed {
                    key,
                    duty,
                    confidence,
                } => self.log_cycle(
                    cycle,
                    LogLevel::Info,
                    "calibration committed",
                    json!({ "key": key, "duty": duty, "confidence": confidence }),
                ),
                CalibrationEvent::CeilingRaised { ceiling_psi } => self.log_cycle(
                    cycle,
                    LogLevel::Info,
                    "calibration ceiling raised",
                    json!({ "ceiling_psi": ceiling_psi }),
                ),
            }
        }
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }

    fn log_cycle(&self, cycle: u64, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log_cycle(cycle, level, message, metadata);
        }
    }

    fn event(&self, cycle: u64, event_type: &str, payload: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.event_cycle(cycle, event_type, payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fusion::psi_to_millivolts,
        persistence::{restore, MemoryStore, PersistenceService, PersistenceWriter},
        sample::{BusTelemetry, RawSensorFrame},
    };
    use std::{sync::Arc, time::Duration};

    fn inputs(now_ms: u64, psi: f32, desired: f32, actual: f32) -> SensorInputs {
        SensorInputs {
            bus: Some(BusTelemetry {
                rpm: 3500.0,
                desired_torque: desired,
                actual_torque: actual,
                map_kpa: None,
                intake_air_temp_c: None,
                baro_kpa: None,
                timestamp_ms: now_ms,
                stale: false,
            }),
            sensors: Some(RawSensorFrame {
                manifold_mv: psi_to_millivolts(psi),
                dome_input_mv: psi_to_millivolts(15.0),
                dome_upper_mv: psi_to_millivolts(0.0),
                timestamp_ms: now_ms,
            }),
        }
    }

    fn controller(pwm: RecordingPwm) -> BoostController {
        BoostController::builder(ControllerConfig::default())
            .pwm(pwm)
            .build()
            .unwrap()
    }

    #[test]
    fn overboost_cuts_duty_in_the_same_cycle() {
        let pwm = RecordingPwm::new();
        let mut ctl = controller(pwm.clone());
        let mut now = 0;
        for _ in 0..200 {
            now += 10;
            let report = ctl.run_cycle(&inputs(now, 1.0, 400.0, 150.0), now);
            assert_eq!(report.governor, GovernorState::Armed);
        }
        assert!(ctl.governor().last_duty_percent() > 0.0);

        now += 10;
        let report = ctl.run_cycle(&inputs(now, 10.2, 400.0, 150.0), now);
        assert_eq!(report.governor, GovernorState::Cutting);
        assert_eq!(report.fault.state, FaultState::Overboost);
        assert!(report.duty_percent.abs() < f32::EPSILON);
        assert_eq!(report.pwm_write, Some(0.0));
        assert_eq!(pwm.last(), Some(0.0));
        assert_eq!(report.mode, ControlMode::SafetyCut);

        // Still above limit minus hysteresis: stays cut.
        now += 10;
        let report = ctl.run_cycle(&inputs(now, 9.6, 400.0, 150.0), now);
        assert_eq!(report.governor, GovernorState::Cutting);
        now += 10;
        let report = ctl.run_cycle(&inputs(now, 9.4, 400.0, 150.0), now);
        assert_eq!(report.governor, GovernorState::Recovering);
        assert_eq!(ctl.status().fault_state, FaultState::Overboost);
    }

    #[test]
    fn missing_bus_faults_and_zeroes_duty() {
        let mut ctl = controller(RecordingPwm::new());
        let mut now = 0;
        for _ in 0..100 {
            now += 10;
            ctl.run_cycle(&inputs(now, 6.0, 400.0, 150.0), now);
        }
        let frozen = inputs(now, 6.0, 400.0, 150.0);
        let mut last = None;
        for _ in 0..60 {
            now += 10;
            let mut stale = frozen;
            if let Some(sensors) = stale.sensors.as_mut() {
                sensors.timestamp_ms = now;
            }
            last = Some(ctl.run_cycle(&stale, now));
        }
        let report = last.unwrap();
        assert_eq!(report.fault.state, FaultState::BusFault);
        assert!(report.duty_percent.abs() < f32::EPSILON);
        assert_eq!(ctl.status().fault_state, FaultState::BusFault);
    }

    #[test]
    fn deferred_pwm_writes_stay_within_one_slew_step() {
        let pwm = RecordingPwm::new();
        let mut ctl = controller(pwm.clone());
        let step = ControllerConfig::default().timing.max_duty_slew_per_s * 0.01;
        let mut now = 0;
        for _ in 0..300 {
            now += 10;
            ctl.run_cycle(&inputs(now, 1.0, 400.0, 150.0), now);
        }
        let writes = pwm.writes();
        assert!(writes.iter().any(|duty| *duty > 5.0));
        for pair in writes.windows(2) {
            assert!(
                (pair[1] - pair[0]).abs() <= step + 1e-3,
                "write jumped from {} to {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn zero_aggression_never_targets_boost() {
        let mut ctl = controller(RecordingPwm::new());
        ctl.apply(Command::SetAggression { value: 0.0 }, 0).unwrap();
        let mut now = 0;
        for _ in 0..300 {
            now += 10;
            let report = ctl.run_cycle(&inputs(now, 2.0, 600.0, 100.0), now);
            assert!(report.target_psi.abs() < f32::EPSILON);
            assert_eq!(report.mode, ControlMode::NaturallyAspirated);
        }
    }

    #[test]
    fn duty_stays_in_range() {
        let mut ctl = controller(RecordingPwm::new());
        let mut now = 0;
        for step in 0..500u64 {
            now += 10;
            #[allow(clippy::cast_precision_loss)]
            let psi = (step % 97) as f32 / 10.0;
            let report = ctl.run_cycle(&inputs(now, psi, 500.0, 100.0), now);
            assert!((0.0..=100.0).contains(&report.duty_percent));
            if report.fault.state.is_fault() {
                assert!(report.duty_percent.abs() < f32::EPSILON);
            }
        }
    }

    #[tokio::test]
    async fn storage_failure_is_a_fault_and_blocks_persisted_commands() {
        let service = Arc::new(MemoryStore::new());
        service.set_failing(true);
        let writer = PersistenceWriter::new(service.clone(), Duration::from_millis(1));
        let mut ctl = BoostController::builder(ControllerConfig::default())
            .persistence(writer.handle(), writer.health())
            .build()
            .unwrap();
        ctl.stage_all();
        let report = writer.flush().await;
        assert_eq!(report.failed.len(), 3);

        let report = ctl.run_cycle(&inputs(10, 0.0, 0.0, 0.0), 10);
        assert_eq!(report.fault.state, FaultState::StorageFault);
        assert!(report.duty_percent.abs() < f32::EPSILON);
        assert_eq!(
            ctl.apply(Command::SetAggression { value: 0.5 }, 10),
            Err(crate::error::CommandError::StorageUnavailable)
        );

        service.set_failing(false);
        writer.flush().await;
        let report = ctl.run_cycle(&inputs(20, 0.0, 0.0, 0.0), 20);
        assert_eq!(report.fault.state, FaultState::Nominal);
        assert!(ctl.apply(Command::SetAggression { value: 0.5 }, 20).is_ok());
    }

    #[tokio::test]
    async fn unreadable_record_at_start_up_is_a_storage_fault() {
        let config = ControllerConfig::default();
        let service = Arc::new(MemoryStore::new());
        let seeded = CalibrationStore::new(&config.grid, 5.0).unwrap();
        service
            .save(CALIBRATION_KEY, &seeded.to_bytes().unwrap())
            .await
            .unwrap();
        service.fail_load(CALIBRATION_KEY);
        service.fail_key(CALIBRATION_KEY);
        let restored = restore(service.as_ref(), &config).await.unwrap();

        let writer = PersistenceWriter::new(service.clone(), Duration::from_millis(1));
        let mut ctl = BoostController::builder(config)
            .restored(restored)
            .persistence(writer.handle(), writer.health())
            .build()
            .unwrap();
        assert_eq!(writer.handle().pending(), 1);

        let report = ctl.run_cycle(&inputs(10, 0.0, 0.0, 0.0), 10);
        assert_eq!(report.fault.state, FaultState::StorageFault);
        assert!(report.duty_percent.abs() < f32::EPSILON);

        // A write that still fails keeps the fault.
        writer.flush().await;
        let report = ctl.run_cycle(&inputs(20, 0.0, 0.0, 0.0), 20);
        assert_eq!(report.fault.state, FaultState::StorageFault);

        service.clear_failures();
        writer.flush().await;
        assert!(!writer.health().is_faulted());
        let report = ctl.run_cycle(&inputs(30, 0.0, 0.0, 0.0), 30);
        assert_eq!(report.fault.state, FaultState::Nominal);
    }
}
