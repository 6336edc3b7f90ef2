use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::{CommandError, ControlError};

/// User-owned pressure limits, in gauge psi.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Wastegate spring pressure; boost reached with zero duty.
    pub spring_pressure: f32,
    /// Highest boost the controller may target.
    pub max_boost_psi: f32,
    /// Hard limit; reaching it cuts duty.
    pub overboost_limit: f32,
    /// Drop below the limit required before recovery starts.
    pub overboost_hysteresis: f32,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            spring_pressure: 5.0,
            max_boost_psi: 9.0,
            overboost_limit: 10.0,
            overboost_hysteresis: 0.5,
        }
    }
}

impl SafetyLimits {
    /// Checks every bound; the first violation is returned.
    pub fn check(&self) -> Result<(), CommandError> {
        let Self {
            spring_pressure,
            max_boost_psi,
            overboost_limit,
            overboost_hysteresis,
        } = *self;
        for (field, value) in [
            ("spring_pressure", spring_pressure),
            ("max_boost_psi", max_boost_psi),
            ("overboost_limit", overboost_limit),
            ("overboost_hysteresis", overboost_hysteresis),
        ] {
            if !value.is_finite() {
                return Err(CommandError::invalid(field, value, "not a number"));
            }
        }
        if !(1.0..=20.0).contains(&spring_pressure) {
            return Err(CommandError::invalid(
                "spring_pressure",
                spring_pressure,
                "must be within 1..=20 psi",
            ));
        }
        if max_boost_psi < spring_pressure || max_boost_psi > 25.0 {
            return Err(CommandError::invalid(
                "max_boost_psi",
                max_boost_psi,
                format!("must be within {spring_pressure}..=25 psi"),
            ));
        }
        if overboost_limit <= max_boost_psi || overboost_limit > 30.0 {
            return Err(CommandError::invalid(
                "overboost_limit",
                overboost_limit,
                format!("must be above {max_boost_psi} and at most 30 psi"),
            ));
        }
        if overboost_hysteresis < 0.2 || overboost_hysteresis >= overboost_limit - spring_pressure
        {
            return Err(CommandError::invalid(
                "overboost_hysteresis",
                overboost_hysteresis,
                "must be at least 0.2 psi and below the limit-to-spring span",
            ));
        }
        Ok(())
    }
}

/// Checks an aggression value.
pub fn check_aggression(value: f32) -> Result<(), CommandError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(CommandError::invalid("aggression", value, "must be within 0..=1"))
    }
}

/// PID gains in duty-fraction units per psi of boost error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidConfig {
    /// Proportional gain.
    pub kp: f32,
    /// Integral gain (per psi-second).
    pub ki: f32,
    /// Derivative gain (per psi/second).
    pub kd: f32,
    /// Bound on the integral contribution.
    pub integral_limit: f32,
    /// Bound on the total correction.
    pub output_limit: f32,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: 0.04,
            ki: 0.03,
            kd: 0.002,
            integral_limit: 0.2,
            output_limit: 0.2,
        }
    }
}

/// Loop, bus and actuator timing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Control loop rate.
    pub loop_hz: u32,
    /// Solenoid PWM frequency.
    pub pwm_hz: u32,
    /// Bus telemetry age that raises a bus fault.
    pub bus_timeout_ms: u64,
    /// Sensor frame age that raises a sensor fault.
    pub sensor_timeout_ms: u64,
    /// Stable time required in Recovering before re-arming.
    pub recovery_hold_ms: u64,
    /// Maximum duty change, in percent per second.
    pub max_duty_slew_per_s: f32,
    /// Half-width of the preferred update window around a PWM edge.
    pub pwm_window_ms: f32,
    /// Longest a duty update may wait for the window.
    pub pwm_max_defer_ms: f32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            loop_hz: 100,
            pwm_hz: 30,
            bus_timeout_ms: 500,
            sensor_timeout_ms: 100,
            recovery_hold_ms: 500,
            max_duty_slew_per_s: 150.0,
            pwm_window_ms: 3.0,
            pwm_max_defer_ms: 10.0,
        }
    }
}

impl TimingConfig {
    /// Nominal cycle period in seconds.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn period_s(&self) -> f32 {
        1.0 / self.loop_hz.max(1) as f32
    }
}

/// Sensor fusion tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Lowest plausible transducer output.
    pub min_millivolts: f32,
    /// Highest plausible transducer output.
    pub max_millivolts: f32,
    /// Below this boost the low-range source is blended in.
    pub overlap_threshold_psi: f32,
    /// Both sources must sit within this band to learn the offset.
    pub learning_band_psi: f32,
    /// Offset learning pauses above this rate of change.
    pub max_rate_psi_per_s: f32,
    /// Atmospheric baseline for converting MAP to gauge.
    pub atmospheric_psi: f32,
    /// Disagreement still classified as good.
    pub agreement_tolerance_psi: f32,
    /// Disagreement classified as major.
    pub major_disagreement_psi: f32,
    /// Agreement is only judged below this boost.
    pub agreement_window_psi: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            min_millivolts: 250.0,
            max_millivolts: 4750.0,
            overlap_threshold_psi: 1.0,
            learning_band_psi: 2.0,
            max_rate_psi_per_s: 2.0,
            atmospheric_psi: 14.7,
            agreement_tolerance_psi: 0.5,
            major_disagreement_psi: 2.0,
            agreement_window_psi: 5.0,
        }
    }
}

/// Target resolver tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Torque gaps inside this band are ignored.
    pub torque_deadband_nm: f32,
    /// Target rise rate per Nm of gap at full aggression.
    pub psi_per_nm_s: f32,
    /// Cap on the target rise rate.
    pub max_ramp_psi_per_s: f32,
    /// Target fall rate when the ECU cuts torque.
    pub backoff_psi_per_s: f32,
    /// Gap kept between the target ceiling and `max_boost_psi`.
    pub ceiling_margin_psi: f32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            torque_deadband_nm: 10.0,
            psi_per_nm_s: 0.02,
            max_ramp_psi_per_s: 4.0,
            backoff_psi_per_s: 20.0,
            ceiling_margin_psi: 0.5,
        }
    }
}

/// Learning rates and confidence tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Short-term trim rate per cycle.
    pub fast_rate: f32,
    /// Long-term trim rate per cycle.
    pub slow_rate: f32,
    /// Environmental factor EMA rate.
    pub environmental_rate: f32,
    /// Sensor fusion offset EMA rate.
    pub fusion_rate: f32,
    /// Safety parameter rate per safety event.
    pub safety_rate: f32,
    /// Confidence needed before long-term trims move.
    pub confidence_threshold: f32,
    /// Confidence gained per consistent sample.
    pub confidence_gain: f32,
    /// Confidence multiplier on an inconsistent sample.
    pub confidence_decay: f32,
    /// Boost error that still counts as consistent.
    pub consistency_tolerance_psi: f32,
    /// Boost error mapped to a full-scale normalized error.
    pub error_window_psi: f32,
    /// Intake air temperature with a neutral factor.
    pub reference_iat_c: f32,
    /// Temperature factor change per degree.
    pub iat_coefficient: f32,
    /// Barometric pressure with a neutral factor.
    pub reference_baro_kpa: f32,
    /// Dome supply pressure with a neutral factor.
    pub reference_supply_psi: f32,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            fast_rate: 0.05,
            slow_rate: 0.001,
            environmental_rate: 0.01,
            fusion_rate: 0.01,
            safety_rate: 0.02,
            confidence_threshold: 0.8,
            confidence_gain: 0.01,
            confidence_decay: 0.9,
            consistency_tolerance_psi: 0.3,
            error_window_psi: 2.0,
            reference_iat_c: 25.0,
            iat_coefficient: 0.004,
            reference_baro_kpa: 101.3,
            reference_supply_psi: 15.0,
        }
    }
}

/// Calibration grid layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// RPM bucket centres, ascending.
    pub rpm_buckets: Vec<f32>,
    /// Boost target bucket centres, ascending.
    pub boost_buckets: Vec<f32>,
    /// Seed duty per psi above spring for unlearned buckets.
    pub seed_duty_per_psi: f32,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            rpm_buckets: (2..=14_u16).map(|step| f32::from(step) * 500.0).collect(),
            boost_buckets: (0..=25_u8).map(f32::from).collect(),
            seed_duty_per_psi: 0.03,
        }
    }
}

/// Auto-calibration tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// RPM window around the requested RPM in which runs count.
    pub rpm_tolerance: f32,
    /// Boost window around the run target that counts as reached.
    pub boost_tolerance_psi: f32,
    /// Time the boost must stay in tolerance for a run to succeed.
    pub hold_ms: u64,
    /// Run length after which an unreached target fails.
    pub max_run_ms: u64,
    /// Zero-target rest between runs.
    pub rest_ms: u64,
    /// Consecutive successes needed to accept a run-set.
    pub required_runs: u32,
    /// Initial ceiling above spring pressure.
    pub initial_ceiling_above_spring: f32,
    /// Ceiling increase per accepted run-set.
    pub ceiling_step_psi: f32,
    /// Space kept between a run target and the ceiling.
    pub ceiling_headroom_psi: f32,
    /// Ceiling decrease after a safety abort.
    pub ceiling_reduction_psi: f32,
    /// Lowest remembered ceiling above spring pressure.
    pub min_ceiling_above_spring: f32,
    /// Confidence given to a freshly committed bucket.
    pub commit_confidence: f32,
    /// Confidence added per consistent validation set.
    pub validation_step: f32,
    /// Duty spread that still counts as consistent during validation.
    pub validation_duty_tolerance: f32,
    /// Confidence at which the requested point is accepted.
    pub acceptance_confidence: f32,
    /// Validation sets attempted before giving up.
    pub max_validation_sets: u32,
    /// Failed runs tolerated before giving up.
    pub max_failures: u32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            rpm_tolerance: 200.0,
            boost_tolerance_psi: 0.5,
            hold_ms: 500,
            max_run_ms: 10_000,
            rest_ms: 1_500,
            required_runs: 3,
            initial_ceiling_above_spring: 1.0,
            ceiling_step_psi: 1.0,
            ceiling_headroom_psi: 0.75,
            ceiling_reduction_psi: 0.5,
            min_ceiling_above_spring: 0.25,
            commit_confidence: 0.5,
            validation_step: 0.1,
            validation_duty_tolerance: 0.05,
            acceptance_confidence: 0.8,
            max_validation_sets: 6,
            max_failures: 5,
        }
    }
}

/// Background persistence tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Directory used by the file store.
    pub directory: String,
    /// Quiet period before a staged batch is written.
    pub debounce_ms: u64,
    /// Minimum spacing between calibration snapshots staged by the loop.
    pub stage_interval_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            directory: "data/boostctl".into(),
            debounce_ms: 5_000,
            stage_interval_ms: 5_000,
        }
    }
}

/// Complete controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Initial safety limits (persisted settings override these).
    pub limits: SafetyLimits,
    /// Initial aggression (persisted settings override this).
    pub aggression: f32,
    /// PID gains.
    pub pid: PidConfig,
    /// Loop and actuator timing.
    pub timing: TimingConfig,
    /// Sensor fusion tuning.
    pub fusion: FusionConfig,
    /// Target resolver tuning.
    pub resolver: ResolverConfig,
    /// Learning rates.
    pub learning: LearningConfig,
    /// Calibration grid.
    pub grid: GridConfig,
    /// Auto-calibration tuning.
    pub calibration: CalibrationConfig,
    /// Background persistence.
    pub persistence: PersistenceConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            limits: SafetyLimits::default(),
            aggression: 0.3,
            pid: PidConfig::default(),
            timing: TimingConfig::default(),
            fusion: FusionConfig::default(),
            resolver: ResolverConfig::default(),
            learning: LearningConfig::default(),
            grid: GridConfig::default(),
            calibration: CalibrationConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Loads and validates configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading controller config {}", path.display()))?;
        let config: Self =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("validating {}", path.display()))?;
        Ok(config)
    }

    /// Checks cross-field consistency.
    pub fn validate(&self) -> Result<(), ControlError> {
        self.limits
            .check()
            .map_err(|err| ControlError::ConfigInvalid(err.to_string()))?;
        check_aggression(self.aggression)
            .map_err(|err| ControlError::ConfigInvalid(err.to_string()))?;
        if self.timing.loop_hz == 0 || self.timing.pwm_hz == 0 {
            return Err(ControlError::ConfigInvalid(
                "loop_hz and pwm_hz must be positive".into(),
            ));
        }
        if self.timing.max_duty_slew_per_s <= 0.0 {
            return Err(ControlError::ConfigInvalid(
                "max_duty_slew_per_s must be positive".into(),
            ));
        }
        if self.fusion.min_millivolts >= self.fusion.max_millivolts {
            return Err(ControlError::ConfigInvalid(
                "fusion millivolt range is empty".into(),
            ));
        }
        if self.fusion.overlap_threshold_psi <= 0.0 {
            return Err(ControlError::ConfigInvalid(
                "overlap_threshold_psi must be positive".into(),
            ));
        }
        for (name, buckets) in [
            ("rpm_buckets", &self.grid.rpm_buckets),
            ("boost_buckets", &self.grid.boost_buckets),
        ] {
            if buckets.len() < 2 || buckets.windows(2).any(|pair| pair[0] >= pair[1]) {
                return Err(ControlError::ConfigInvalid(format!(
                    "{name} must hold at least two strictly ascending values"
                )));
            }
        }
        if self.calibration.required_runs == 0 {
            return Err(ControlError::ConfigInvalid(
                "required_runs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
