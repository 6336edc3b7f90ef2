use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use super::BoostController;
use crate::{
    autocal::{AutoCalibrationEngine, CalibrationReport, CalibrationRequest, CalibrationStatus},
    config::{check_aggression, SafetyLimits},
    error::CommandError,
    governor::GovernorState,
    store::{ResetScope, SafetyLearnedParams},
};

/// User command applied at a cycle boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Sets the persisted aggression.
    SetAggression {
        /// New value in `[0, 1]`.
        value: f32,
    },
    /// Turns the transient full-aggression override on or off.
    SetScramble {
        /// Override state.
        active: bool,
    },
    /// Replaces the safety limits.
    SetSafetyLimits {
        /// New limits.
        limits: SafetyLimits,
    },
    /// Starts an auto-calibration session.
    StartCalibration {
        /// Point to calibrate.
        request: CalibrationRequest,
    },
    /// Aborts the active session.
    AbortCalibration,
    /// Clears learned data.
    ResetLearnedData {
        /// What to clear.
        scope: ResetScope,
    },
    /// Zeroes every trim.
    ResetTrims,
}

impl Command {
    /// Range checks that need no controller state.
    pub fn validate(&self) -> Result<(), CommandError> {
        match self {
            Self::SetAggression { value } => check_aggression(*value),
            Self::SetSafetyLimits { limits } => limits.check(),
            Self::StartCalibration { request } => {
                if request.target_rpm.is_finite() && request.target_boost.is_finite() {
                    Ok(())
                } else {
                    Err(CommandError::invalid(
                        "target_boost",
                        request.target_boost,
                        "calibration request must be finite",
                    ))
                }
            }
            Self::SetScramble { .. }
            | Self::AbortCalibration
            | Self::ResetLearnedData { .. }
            | Self::ResetTrims => Ok(()),
        }
    }

    /// Short name used in logs and events.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SetAggression { .. } => "set_aggression",
            Self::SetScramble { .. } => "set_scramble",
            Self::SetSafetyLimits { .. } => "set_safety_limits",
            Self::StartCalibration { .. } => "start_calibration",
            Self::AbortCalibration => "abort_calibration",
            Self::ResetLearnedData { .. } => "reset_learned_data",
            Self::ResetTrims => "reset_trims",
        }
    }

    const fn needs_storage(&self) -> bool {
        !matches!(self, Self::SetScramble { .. } | Self::AbortCalibration)
    }
}

/// Result of an applied command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandOutcome {
    /// Applied with nothing further to report.
    Applied,
    /// New limits in force; `invalidated` calibration points lost confidence.
    LimitsChanged {
        /// Points whose confidence was dropped.
        invalidated: usize,
    },
    /// Session started.
    CalibrationStarted(CalibrationStatus),
    /// Session aborted.
    CalibrationAborted(CalibrationReport),
}

impl BoostController {
    /// Applies a command atomically or rejects it untouched.
    pub fn apply(
        &mut self,
        command: Command,
        now_ms: u64,
    ) -> Result<CommandOutcome, CommandError> {
        let result = self.apply_inner(command, now_ms);
        match &result {
            Ok(outcome) => {
                self.log(
                    LogLevel::Info,
                    "command applied",
                    json!({ "command": command.name(), "outcome": outcome }),
                );
                self.event(
                    self.cycle,
                    "control.command.applied",
                    json!({ "command": command, "outcome": outcome }),
                );
            }
            Err(err) => self.log(
                LogLevel::Warn,
                "command rejected",
                json!({ "command": command.name(), "error": err.to_string() }),
            ),
        }
        result
    }

    fn apply_inner(
        &mut self,
        command: Command,
        now_ms: u64,
    ) -> Result<CommandOutcome, CommandError> {
        command.validate()?;
        if command.needs_storage() && self.storage_faulted() {
            return Err(CommandError::StorageUnavailable);
        }
        match command {
            Command::SetAggression { value } => {
                self.aggression = value;
                self.stage_settings();
                Ok(CommandOutcome::Applied)
            }
            Command::SetScramble { active } => {
                self.scramble = active;
                Ok(CommandOutcome::Applied)
            }
            Command::SetSafetyLimits { limits } => {
                self.ensure_no_calibration()?;
                let old = std::mem::replace(&mut self.limits, limits);
                let invalidated = self.store.invalidate_for_limits(&old, &limits);
                self.stage_settings();
                self.stage_store();
                Ok(CommandOutcome::LimitsChanged { invalidated })
            }
            Command::StartCalibration { request } => {
                self.ensure_no_calibration()?;
                AutoCalibrationEngine::check_request(&request, &self.limits)?;
                if self.governor.state() != GovernorState::Armed {
                    return Err(CommandError::SafetyCutActive);
                }
                let status = self
                    .autocal
                    .start(request, &self.limits, &self.store, now_ms)?;
                self.resolver.reset();
                self.synth.reset();
                Ok(CommandOutcome::CalibrationStarted(status))
            }
            Command::AbortCalibration => {
                let report = self.autocal.abort(now_ms)?;
                self.resolver.reset();
                self.synth.reset();
                Ok(CommandOutcome::CalibrationAborted(report))
            }
            Command::ResetLearnedData { scope } => {
                self.ensure_no_calibration()?;
                self.store.reset(scope);
                if matches!(scope, ResetScope::Safety | ResetScope::All) {
                    self.safety = SafetyLearnedParams::default();
                    self.stage_safety();
                }
                if scope == ResetScope::All {
                    self.scramble = false;
                }
                self.stage_store();
                Ok(CommandOutcome::Applied)
            }
            Command::ResetTrims => {
                self.ensure_no_calibration()?;
                self.store.reset_trims();
                self.stage_store();
                Ok(CommandOutcome::Applied)
            }
        }
    }

    const fn ensure_no_calibration(&self) -> Result<(), CommandError> {
        if self.autocal.is_active() {
            Err(CommandError::CalibrationInProgress)
        } else {
            Ok(())
        }
    }
}
