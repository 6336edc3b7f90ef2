use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    config::{ResolverConfig, SafetyLimits},
    sample::OperatingSample,
};

/// Where this cycle's target boost comes from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TargetSource {
    /// Normal operation: follow the ECU torque gap.
    TorqueFollowing,
    /// Auto-calibration supplies the target directly.
    Calibration {
        /// Commanded target, psi.
        target_psi: f32,
    },
}

/// Human-readable label describing what the controller is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMode {
    /// Aggression is zero; no boost assistance.
    NaturallyAspirated,
    /// Raising boost to close a torque gap.
    HelpingEcu,
    /// ECU cut torque; target falling.
    BackingOff,
    /// Gap closed; target held.
    Holding,
    /// Auto-calibration owns the target.
    Calibrating,
    /// The safety governor is cutting or recovering.
    SafetyCut,
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NaturallyAspirated => "Naturally aspirated",
            Self::HelpingEcu => "Helping ECU",
            Self::BackingOff => "Backing off",
            Self::Holding => "Holding",
            Self::Calibrating => "Calibrating",
            Self::SafetyCut => "Safety cut",
        };
        f.write_str(label)
    }
}

/// Resolved target for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetDecision {
    /// Target boost, psi.
    pub target_psi: f32,
    /// Mode label.
    pub mode: ControlMode,
}

/// Level 1: converts the torque gap into a target boost.
///
/// The target integrates the gap: it rises while the ECU asks for more torque
/// than it gets, holds once the gap closes and falls fast when the ECU pulls
/// torque. Aggression scales both the rise rate and the ceiling.
#[derive(Debug, Clone)]
pub struct BoostTargetResolver {
    config: ResolverConfig,
    target_psi: f32,
}

impl BoostTargetResolver {
    /// Creates a resolver with a zero target.
    #[must_use]
    pub const fn new(config: ResolverConfig) -> Self {
        Self {
            config,
            target_psi: 0.0,
        }
    }

    /// Highest target allowed at an aggression.
    #[must_use]
    pub fn ceiling(&self, aggression: f32, limits: &SafetyLimits) -> f32 {
        (aggression.clamp(0.0, 1.0) * (limits.max_boost_psi - self.config.ceiling_margin_psi))
            .max(0.0)
    }

    /// Resolves the target for this cycle.
    pub fn resolve(
        &mut self,
        sample: &OperatingSample,
        aggression: f32,
        limits: &SafetyLimits,
        dt_s: f32,
    ) -> TargetDecision {
        if aggression <= 0.0 || !aggression.is_finite() {
            self.target_psi = 0.0;
            return TargetDecision {
                target_psi: 0.0,
                mode: ControlMode::NaturallyAspirated,
            };
        }
        let gap = sample.torque_error();
        let ceiling = self.ceiling(aggression, limits);
        let previous = self.target_psi;
        let (next, mode) = if !gap.is_finite() {
            (previous, ControlMode::Holding)
        } else if gap > self.config.torque_deadband_nm {
            let rate = (gap * self.config.psi_per_nm_s * aggression)
                .min(self.config.max_ramp_psi_per_s);
            (previous + rate * dt_s, ControlMode::HelpingEcu)
        } else if gap < -self.config.torque_deadband_nm {
            (
                previous - self.config.backoff_psi_per_s * dt_s,
                ControlMode::BackingOff,
            )
        } else if gap <= 0.0 {
            // Meeting or exceeding the ECU target: settle toward sustained
            // boost without ever rising.
            let sustained = sample.manifold_pressure.max(0.0);
            let settled = previous - (previous - sustained).max(0.0) * dt_s;
            (settled.min(previous), ControlMode::Holding)
        } else {
            (previous, ControlMode::Holding)
        };
        self.target_psi = next.clamp(0.0, ceiling);
        TargetDecision {
            target_psi: self.target_psi,
            mode,
        }
    }

    /// Picks this cycle's target from `source`.
    ///
    /// Calibration targets pass through untouched and keep the integrator at
    /// zero, so torque following restarts cleanly when the session ends.
    /// Torque following without a usable sample holds zero.
    pub fn select(
        &mut self,
        source: TargetSource,
        sample: Option<&OperatingSample>,
        aggression: f32,
        limits: &SafetyLimits,
        dt_s: f32,
    ) -> TargetDecision {
        match (source, sample) {
            (TargetSource::Calibration { target_psi }, _) => {
                self.reset();
                TargetDecision {
                    target_psi,
                    mode: ControlMode::Calibrating,
                }
            }
            (TargetSource::TorqueFollowing, Some(sample)) => {
                self.resolve(sample, aggression, limits, dt_s)
            }
            (TargetSource::TorqueFollowing, None) => {
                self.reset();
                TargetDecision {
                    target_psi: 0.0,
                    mode: ControlMode::Holding,
                }
            }
        }
    }

    /// Drops the integrated target to zero.
    pub fn reset(&mut self) {
        self.target_psi = 0.0;
    }

    /// Current integrated target.
    #[must_use]
    pub const fn target(&self) -> f32 {
        self.target_psi
    }
}
