use anyhow::{anyhow, Result};
use boostctl_core::{
    fusion::psi_to_millivolts,
    store::{LONG_TRIM_BOUND, SHORT_TRIM_BOUND},
    BoostController, BusTelemetry, CalibrationRequest, Command, ControlMode, ControlTelemetry,
    ControllerConfig, CycleReport, FaultState, GovernorState, RawSensorFrame, RecordingPwm,
    SensorInputs, StatusSnapshot,
};
use clap::ValueEnum;
use serde::Serialize;

use crate::plant::{Plant, PlantConfig};

const STEP_MS: u64 = 10;
const FLOAT_SLACK: f32 = 1e-4;

/// Built-in closed-loop scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioKind {
    /// Large torque gap at full aggression; boost climbs to the ceiling.
    TorqueGap,
    /// Wastegate creep drives boost through the overboost limit.
    Overboost,
    /// Bus telemetry freezes for two seconds.
    BusLoss,
    /// Creep during a calibration run trips the session ceiling.
    CalibrationAbort,
    /// Moderate demand that the controller settles on and learns from.
    Cruise,
}

impl ScenarioKind {
    /// Every scenario, in run order.
    pub const ALL: [Self; 5] = [
        Self::TorqueGap,
        Self::Overboost,
        Self::BusLoss,
        Self::CalibrationAbort,
        Self::Cruise,
    ];

    const fn default_cycles(self) -> u64 {
        match self {
            Self::TorqueGap => 600,
            Self::Overboost | Self::BusLoss => 800,
            Self::CalibrationAbort => 1_000,
            Self::Cruise => 2_500,
        }
    }
}

/// Knobs shared by every scenario.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Overrides the scenario's cycle count.
    pub cycles: Option<u64>,
    /// Overrides the scenario's aggression.
    pub aggression: Option<f32>,
    /// Sensor noise seed.
    pub seed: u64,
    /// Telemetry attached to the controller.
    pub telemetry: Option<ControlTelemetry>,
}

/// One pass/fail assertion.
#[derive(Debug, Clone, Serialize)]
pub struct Check {
    /// What was checked.
    pub name: String,
    /// Whether it held.
    pub passed: bool,
    /// Observed values.
    pub detail: String,
}

/// Result of a scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioOutcome {
    /// Scenario that ran.
    pub scenario: ScenarioKind,
    /// Cycles executed.
    pub cycles: u64,
    /// True when every check passed.
    pub passed: bool,
    /// Highest fused boost seen, psi.
    pub peak_psi: f32,
    /// Governor cuts during the run.
    pub safety_cuts: u64,
    /// Controller status after the last cycle.
    pub final_status: StatusSnapshot,
    /// Individual checks.
    pub checks: Vec<Check>,
}

/// Controller wired to the plant through a recording PWM driver.
struct Simulation {
    controller: BoostController,
    plant: Plant,
    pwm: RecordingPwm,
    rpm: f32,
    desired_torque: f32,
    frozen_bus: Option<BusTelemetry>,
    last_bus: Option<BusTelemetry>,
    now_ms: u64,
    peak_psi: f32,
}

impl Simulation {
    fn new(options: &RunOptions, rpm: f32, desired_torque: f32) -> Result<Self> {
        let pwm = RecordingPwm::new();
        let mut builder = BoostController::builder(ControllerConfig::default()).pwm(pwm.clone());
        if let Some(telemetry) = options.telemetry.clone() {
            builder = builder.telemetry(telemetry);
        }
        Ok(Self {
            controller: builder.build()?,
            plant: Plant::new(PlantConfig::default(), options.seed),
            pwm,
            rpm,
            desired_torque,
            frozen_bus: None,
            last_bus: None,
            now_ms: 0,
            peak_psi: f32::MIN,
        })
    }

    fn apply(&mut self, command: Command) -> Result<()> {
        self.controller
            .apply(command, self.now_ms)
            .map(|_| ())
            .map_err(|err| anyhow!("{} rejected: {err}", command.name()))
    }

    fn freeze_bus(&mut self) {
        self.frozen_bus = self.last_bus;
    }

    fn restore_bus(&mut self) {
        self.frozen_bus = None;
    }

    fn step(&mut self) -> CycleReport {
        self.now_ms += STEP_MS;
        let duty = self.pwm.last().unwrap_or(0.0);
        #[allow(clippy::cast_precision_loss)]
        let dt_s = STEP_MS as f32 / 1000.0;
        let psi = self.plant.step(duty, self.rpm, true, dt_s);
        let live = BusTelemetry {
            rpm: self.rpm,
            desired_torque: self.desired_torque,
            actual_torque: self.plant.torque_nm(),
            map_kpa: Some((psi + 14.7) * 6.895),
            intake_air_temp_c: Some(30.0),
            baro_kpa: Some(101.3),
            timestamp_ms: self.now_ms,
            stale: false,
        };
        let bus = self.frozen_bus.unwrap_or(live);
        self.last_bus = Some(bus);
        let inputs = SensorInputs {
            bus: Some(bus),
            sensors: Some(RawSensorFrame {
                manifold_mv: psi_to_millivolts(psi),
                dome_input_mv: psi_to_millivolts(15.0),
                dome_upper_mv: psi_to_millivolts(duty / 100.0 * 15.0),
                timestamp_ms: self.now_ms,
            }),
        };
        let report = self.controller.run_cycle(&inputs, self.now_ms);
        if let Some(reading) = report.fusion {
            self.peak_psi = self.peak_psi.max(reading.manifold_psi);
        }
        report
    }

    fn finish(self, scenario: ScenarioKind, cycles: u64, checks: Vec<Check>) -> ScenarioOutcome {
        let status = self.controller.status();
        ScenarioOutcome {
            scenario,
            cycles,
            passed: checks.iter().all(|check| check.passed),
            peak_psi: self.peak_psi,
            safety_cuts: status.safety_cuts,
            final_status: status,
            checks,
        }
    }
}

fn check(name: &str, passed: bool, detail: impl Into<String>) -> Check {
    Check {
        name: name.to_string(),
        passed,
        detail: detail.into(),
    }
}

fn fused(report: &CycleReport) -> Option<f32> {
    report.fusion.map(|reading| reading.manifold_psi)
}

/// Runs one scenario to completion.
pub fn run(kind: ScenarioKind, options: &RunOptions) -> Result<ScenarioOutcome> {
    let cycles = options.cycles.unwrap_or_else(|| kind.default_cycles());
    match kind {
        ScenarioKind::TorqueGap => torque_gap(options, cycles),
        ScenarioKind::Overboost => overboost(options, cycles),
        ScenarioKind::BusLoss => bus_loss(options, cycles),
        ScenarioKind::CalibrationAbort => calibration_abort(options, cycles),
        ScenarioKind::Cruise => cruise(options, cycles),
    }
}

fn torque_gap(options: &RunOptions, cycles: u64) -> Result<ScenarioOutcome> {
    let aggression = options.aggression.unwrap_or(1.0);
    let mut sim = Simulation::new(options, 3500.0, 400.0)?;
    sim.apply(Command::SetAggression { value: aggression })?;
    let config = ControllerConfig::default();
    let limits = sim.controller.limits();
    let ceiling =
        aggression * (limits.max_boost_psi - config.resolver.ceiling_margin_psi).max(0.0);
    let max_step = config.resolver.max_ramp_psi_per_s * config.timing.period_s();

    let mut last_target = 0.0_f32;
    let mut max_target = 0.0_f32;
    let mut max_step_seen = 0.0_f32;
    let mut faults = 0_u64;
    let mut last = None;
    for _ in 0..cycles {
        let report = sim.step();
        max_target = max_target.max(report.target_psi);
        max_step_seen = max_step_seen.max(report.target_psi - last_target);
        last_target = report.target_psi;
        if report.fault.state.is_fault() {
            faults += 1;
        }
        last = Some(report);
    }
    let last = last.ok_or_else(|| anyhow!("scenario ran zero cycles"))?;
    let tracking = fused(&last).map_or(f32::INFINITY, |psi| (psi - last.target_psi).abs());
    let checks = vec![
        check(
            "peak stays below the overboost limit",
            sim.peak_psi < limits.overboost_limit,
            format!("peak {:.2} psi, limit {:.2} psi", sim.peak_psi, limits.overboost_limit),
        ),
        check(
            "target stays within the aggression ceiling",
            max_target <= ceiling + FLOAT_SLACK && max_target < limits.max_boost_psi,
            format!("max target {max_target:.3} psi, ceiling {ceiling:.3} psi"),
        ),
        check(
            "target rise respects the ramp limit",
            max_step_seen <= max_step + FLOAT_SLACK,
            format!("largest step {max_step_seen:.4} psi, allowed {max_step:.4} psi"),
        ),
        check("no faults", faults == 0, format!("{faults} fault cycles")),
        check(
            "boost tracks the target",
            tracking < 1.0,
            format!("final error {tracking:.3} psi"),
        ),
    ];
    Ok(sim.finish(ScenarioKind::TorqueGap, cycles, checks))
}

fn overboost(options: &RunOptions, cycles: u64) -> Result<ScenarioOutcome> {
    let aggression = options.aggression.unwrap_or(1.0);
    let mut sim = Simulation::new(options, 3500.0, 400.0)?;
    sim.apply(Command::SetAggression { value: aggression })?;
    let limits = sim.controller.limits();

    let mut first_over: Option<CycleReport> = None;
    let mut first_recovering: Option<CycleReport> = None;
    let mut rearmed_after_cut = false;
    let mut nonzero_while_cut = 0_u64;
    for cycle in 1..=cycles {
        match cycle {
            200 => sim.plant.set_creep(6.0),
            400 => sim.plant.set_creep(0.0),
            _ => {}
        }
        let report = sim.step();
        if first_over.is_none() && fused(&report).is_some_and(|psi| psi >= limits.overboost_limit)
        {
            first_over = Some(report.clone());
        }
        if first_recovering.is_none() && report.governor == GovernorState::Recovering {
            first_recovering = Some(report.clone());
        }
        if report.governor != GovernorState::Armed && report.duty_percent > 0.0 {
            nonzero_while_cut += 1;
        }
        if first_recovering.is_some() && report.governor == GovernorState::Armed {
            rearmed_after_cut = true;
        }
    }

    let cut_check = first_over.as_ref().map_or_else(
        || check("limit crossing cuts duty in the same cycle", false, "boost never reached the limit"),
        |report| {
            check(
                "limit crossing cuts duty in the same cycle",
                report.governor == GovernorState::Cutting
                    && report.duty_percent <= 0.0
                    && report.fault.state == FaultState::Overboost,
                format!(
                    "cycle {}: {:?}, duty {:.1}%",
                    report.cycle, report.governor, report.duty_percent
                ),
            )
        },
    );
    let release = limits.overboost_limit - limits.overboost_hysteresis;
    let recovery_check = first_recovering.as_ref().map_or_else(
        || check("recovery starts below the hysteresis band", false, "never recovered"),
        |report| {
            let psi = fused(report).unwrap_or(f32::INFINITY);
            check(
                "recovery starts below the hysteresis band",
                psi <= release,
                format!("cycle {}: {psi:.2} psi, release at {release:.2} psi", report.cycle),
            )
        },
    );
    let checks = vec![
        cut_check,
        recovery_check,
        check(
            "duty held at zero until re-armed",
            nonzero_while_cut == 0,
            format!("{nonzero_while_cut} cycles with duty while cut"),
        ),
        check("governor re-arms", rearmed_after_cut, format!("final {:?}", sim.controller.governor().state())),
    ];
    Ok(sim.finish(ScenarioKind::Overboost, cycles, checks))
}

fn bus_loss(options: &RunOptions, cycles: u64) -> Result<ScenarioOutcome> {
    let aggression = options.aggression.unwrap_or(0.8);
    let mut sim = Simulation::new(options, 3500.0, 400.0)?;
    sim.apply(Command::SetAggression { value: aggression })?;
    let config = ControllerConfig::default();
    let timeout_cycles = config.timing.bus_timeout_ms / STEP_MS;
    let (freeze_at, restore_at) = (300_u64, 500_u64);

    let mut first_fault = None;
    let mut early_fault = false;
    let mut duty_during_fault = 0_u64;
    let mut last = None;
    for cycle in 1..=cycles {
        if cycle == freeze_at {
            sim.freeze_bus();
        } else if cycle == restore_at {
            sim.restore_bus();
        }
        let report = sim.step();
        if report.fault.state == FaultState::BusFault {
            if cycle < freeze_at {
                early_fault = true;
            }
            first_fault.get_or_insert(cycle);
            if report.duty_percent > 0.0 {
                duty_during_fault += 1;
            }
        }
        last = Some(report);
    }
    let last = last.ok_or_else(|| anyhow!("scenario ran zero cycles"))?;
    let detection = first_fault.map(|cycle| cycle.saturating_sub(freeze_at));
    let checks = vec![
        check(
            "bus loss detected within the timeout",
            !early_fault && detection.is_some_and(|after| after <= timeout_cycles + 1),
            format!("detected {detection:?} cycles after the freeze, timeout {timeout_cycles} cycles"),
        ),
        check(
            "duty is zero on every bus-fault cycle",
            duty_during_fault == 0,
            format!("{duty_during_fault} cycles with duty"),
        ),
        check(
            "control resumes after the bus returns",
            last.governor == GovernorState::Armed && last.fault.state == FaultState::Nominal,
            format!("final {:?}, {:?}", last.governor, last.fault.state),
        ),
    ];
    Ok(sim.finish(ScenarioKind::BusLoss, cycles, checks))
}

fn calibration_abort(options: &RunOptions, cycles: u64) -> Result<ScenarioOutcome> {
    let mut sim = Simulation::new(options, 3500.0, 150.0)?;
    let request = CalibrationRequest {
        target_rpm: 3500.0,
        target_boost: 7.0,
    };
    let spring = sim.controller.limits().spring_pressure;
    let initial_ceiling = spring + ControllerConfig::default().calibration.initial_ceiling_above_spring;
    let key = sim.controller.store().nearest(request.target_rpm, spring + 1.0);
    let point_before = sim.controller.store().point(key).copied();

    let start_at = 50_u64;
    let mut started = false;
    let mut creep_on = false;
    let mut abort: Option<CycleReport> = None;
    let mut point_at_abort = None;
    let mut rearmed = false;
    for cycle in 1..=cycles {
        if cycle == start_at {
            sim.apply(Command::StartCalibration { request })?;
            started = true;
        }
        let report = sim.step();
        if !creep_on
            && abort.is_none()
            && report.mode == ControlMode::Calibrating
            && report.target_psi > 0.0
        {
            sim.plant.set_creep(1.5);
            creep_on = true;
        }
        if abort.is_none() && report.calibration_unsafe.is_some() {
            point_at_abort = Some(sim.controller.store().point(key).copied());
            sim.plant.set_creep(0.0);
            abort = Some(report.clone());
        }
        if abort.is_some() && report.governor == GovernorState::Armed {
            rearmed = true;
        }
    }

    let remembered = sim.controller.autocal().remembered_ceiling(key);
    let abort_check = abort.as_ref().map_or_else(
        || check("safety cut aborts the session", false, "session never aborted"),
        |report| {
            check(
                "safety cut aborts the session",
                report.governor == GovernorState::Cutting
                    && report.duty_percent <= 0.0
                    && !sim.controller.autocal().is_active(),
                format!(
                    "cycle {}: {}",
                    report.cycle,
                    report.calibration_unsafe.as_deref().unwrap_or_default()
                ),
            )
        },
    );
    let checks = vec![
        check("session started", started, format!("start at cycle {start_at}")),
        abort_check,
        check(
            "ceiling remembered lower",
            remembered.is_some_and(|ceiling| ceiling < initial_ceiling),
            format!("remembered {remembered:?}, initial {initial_ceiling:.2} psi"),
        ),
        check(
            "aborted bucket left untouched",
            point_at_abort == Some(point_before),
            format!("before {point_before:?}, at abort {point_at_abort:?}"),
        ),
        check("governor re-arms", rearmed, format!("final {:?}", sim.controller.governor().state())),
    ];
    Ok(sim.finish(ScenarioKind::CalibrationAbort, cycles, checks))
}

fn cruise(options: &RunOptions, cycles: u64) -> Result<ScenarioOutcome> {
    let aggression = options.aggression.unwrap_or(0.9);
    let mut sim = Simulation::new(options, 3500.0, 290.0)?;
    sim.apply(Command::SetAggression { value: aggression })?;

    let mut faults = 0_u64;
    let mut cuts = 0_u64;
    let mut updates = 0_u64;
    let mut worst_short = 0.0_f32;
    let mut worst_long = 0.0_f32;
    let mut last = None;
    for _ in 0..cycles {
        let report = sim.step();
        if report.fault.state.is_fault() {
            faults += 1;
        }
        if report.governor != GovernorState::Armed {
            cuts += 1;
        }
        if let Some(outcome) = report.learning {
            updates += 1;
            worst_short = worst_short.max(outcome.short_term_trim.abs());
            worst_long = worst_long.max(outcome.long_term_trim.abs());
        }
        last = Some(report);
    }
    let last = last.ok_or_else(|| anyhow!("scenario ran zero cycles"))?;
    let tracking = fused(&last).map_or(f32::INFINITY, |psi| (psi - last.target_psi).abs());
    let checks = vec![
        check("no faults", faults == 0 && cuts == 0, format!("{faults} fault cycles, {cuts} cut cycles")),
        check("trims learned", updates > 0, format!("{updates} updates")),
        check(
            "trims stay bounded",
            worst_short <= SHORT_TRIM_BOUND + FLOAT_SLACK && worst_long <= LONG_TRIM_BOUND + FLOAT_SLACK,
            format!("short {worst_short:.4}, long {worst_long:.4}"),
        ),
        check(
            "boost settles on the target",
            tracking < 0.5,
            format!("final error {tracking:.3} psi at {:.2} psi", last.target_psi),
        ),
    ];
    Ok(sim.finish(ScenarioKind::Cruise, cycles, checks))
}
