use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    config::SafetyLimits,
    fault::{FaultReport, FaultState},
};

/// Bounded ring of safety events.
pub mod history;

pub use history::{SafetyEvent, SafetyHistory};

/// Governor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GovernorState {
    /// Normal operation; candidate duty passes through the slew limiter.
    Armed,
    /// Duty forced to zero.
    Cutting,
    /// Condition cleared; waiting out the stable-recovery hold at zero duty.
    Recovering,
}

impl fmt::Display for GovernorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Armed => "armed",
            Self::Cutting => "cutting",
            Self::Recovering => "recovering",
        };
        f.write_str(label)
    }
}

/// Fault latched by a transition into Cutting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatchedFault {
    /// What triggered the cut.
    pub kind: FaultState,
    /// Human-readable reason.
    pub reason: String,
    /// Loop time of the cut.
    pub at_ms: u64,
}

/// Everything the governor needs for one cycle.
#[derive(Debug, Clone, Copy)]
pub struct GovernorInput<'a> {
    /// Candidate duty fraction from the synthesizer.
    pub candidate_duty: f32,
    /// Fused boost; `None` when the sensors are invalid.
    pub measured_psi: Option<f32>,
    /// Fault monitor output.
    pub fault: &'a FaultReport,
    /// Limits in force this cycle.
    pub limits: &'a SafetyLimits,
    /// Recovery hysteresis in force this cycle.
    pub hysteresis_psi: f32,
    /// Cycle time.
    pub now_ms: u64,
    /// Time since the previous cycle.
    pub dt_s: f32,
}

/// Governor output for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorDecision {
    /// Final duty, percent in `[0, 100]`.
    pub duty_percent: f32,
    /// State after this cycle.
    pub state: GovernorState,
    /// Set on the cycle that entered Cutting from Armed or Recovering.
    pub newly_latched: Option<LatchedFault>,
    /// Set on the cycle that re-armed, with the completed event.
    pub recovered: Option<SafetyEvent>,
}

/// Level 3: sole owner of the final duty.
///
/// Armed is the power-on state. Any fault or boost at the limit cuts duty to
/// zero in the same cycle; recovery is hysteresis- and hold-gated. Outside a
/// cut, duty moves at most `max_slew_per_s` percent per second.
#[derive(Debug, Clone)]
pub struct SafetyGovernor {
    state: GovernorState,
    last_duty_percent: f32,
    recovering_since_ms: u64,
    latched: Option<LatchedFault>,
    history: SafetyHistory,
    max_slew_per_s: f32,
    recovery_hold_ms: u64,
}

impl SafetyGovernor {
    /// Creates an armed governor at zero duty.
    #[must_use]
    pub fn new(max_slew_per_s: f32, recovery_hold_ms: u64) -> Self {
        Self {
            state: GovernorState::Armed,
            last_duty_percent: 0.0,
            recovering_since_ms: 0,
            latched: None,
            history: SafetyHistory::new(32),
            max_slew_per_s,
            recovery_hold_ms,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> GovernorState {
        self.state
    }

    /// Latched fault, visible until the governor re-arms.
    #[must_use]
    pub const fn latched(&self) -> Option<&LatchedFault> {
        self.latched.as_ref()
    }

    /// Safety event history.
    #[must_use]
    pub const fn history(&self) -> &SafetyHistory {
        &self.history
    }

    /// Duty on the output, percent: the last commanded value, corrected by
    /// [`SafetyGovernor::settle_applied`] when a write was held back.
    #[must_use]
    pub const fn last_duty_percent(&self) -> f32 {
        self.last_duty_percent
    }

    /// Rebases the slew limiter on the duty the output actually carries.
    ///
    /// The PWM scheduler may hold a change back; slewing from the held-back
    /// value would let the eventual write jump by more than one step.
    pub fn settle_applied(&mut self, applied_percent: f32) {
        if applied_percent.is_finite() {
            self.last_duty_percent = applied_percent.clamp(0.0, 100.0);
        }
    }

    /// Runs one cycle of the state machine.
    pub fn govern(&mut self, input: &GovernorInput<'_>) -> GovernorDecision {
        let limit = input.limits.overboost_limit;
        let over_limit = input.measured_psi.map_or(true, |psi| psi >= limit);
        let triggered = input.fault.state.is_fault() || over_limit;
        let below_hysteresis = input
            .measured_psi
            .is_some_and(|psi| psi <= limit - input.hysteresis_psi);

        let mut newly_latched = None;
        let mut recovered = None;
        match self.state {
            GovernorState::Armed | GovernorState::Recovering if triggered => {
                newly_latched = Some(self.latch(input));
            }
            GovernorState::Armed => {}
            GovernorState::Cutting => {
                if let Some(psi) = input.measured_psi {
                    self.history.observe_peak(psi);
                }
                if !input.fault.state.is_fault() && below_hysteresis {
                    self.state = GovernorState::Recovering;
                    self.recovering_since_ms = input.now_ms;
                    self.history.mark_cleared(input.now_ms);
                }
            }
            GovernorState::Recovering => {
                if !below_hysteresis {
                    // Back above the hysteresis band without a new trigger:
                    // keep the existing latch and cut again.
                    self.state = GovernorState::Cutting;
                } else if input.now_ms.saturating_sub(self.recovering_since_ms)
                    >= self.recovery_hold_ms
                {
                    self.state = GovernorState::Armed;
                    self.latched = None;
                    recovered = self.history.complete_latest(input.now_ms);
                }
            }
        }

        let duty_percent = match self.state {
            GovernorState::Armed => self.slew(input.candidate_duty, input.dt_s),
            GovernorState::Cutting | GovernorState::Recovering => 0.0,
        };
        self.last_duty_percent = duty_percent;
        GovernorDecision {
            duty_percent,
            state: self.state,
            newly_latched,
            recovered,
        }
    }

    fn latch(&mut self, input: &GovernorInput<'_>) -> LatchedFault {
        let (kind, reason) = if input.fault.state.is_fault() {
            (input.fault.state, input.fault.reason.clone())
        } else {
            (
                FaultState::Overboost,
                format!(
                    "boost at or above limit {:.2} psi",
                    input.limits.overboost_limit
                ),
            )
        };
        warn!(
            fault = %kind,
            reason = %reason,
            measured_psi = ?input.measured_psi,
            "safety cut"
        );
        let fault = LatchedFault {
            kind,
            reason,
            at_ms: input.now_ms,
        };
        self.state = GovernorState::Cutting;
        self.history.push(SafetyEvent {
            kind,
            trigger_psi: input.measured_psi,
            limit_psi: input.limits.overboost_limit,
            peak_psi: input.measured_psi,
            at_ms: input.now_ms,
            cleared_after_ms: None,
            recovered_after_ms: None,
        });
        self.latched = Some(fault.clone());
        fault
    }

    fn slew(&self, candidate_duty: f32, dt_s: f32) -> f32 {
        let requested = if candidate_duty.is_finite() {
            (candidate_duty * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        let step = self.max_slew_per_s * dt_s.max(0.0);
        let delta = (requested - self.last_duty_percent).clamp(-step, step);
        (self.last_duty_percent + delta).clamp(0.0, 100.0)
    }
}
