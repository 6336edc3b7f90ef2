use serde::{Deserialize, Serialize};

use crate::{config::PidConfig, store::CalibrationStore};

/// PID correction stage.
pub mod pid;

pub use pid::PidController;

/// Breakdown of one synthesized duty.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DutyCandidate {
    /// Interpolated learned duty.
    pub baseline: f32,
    /// Baseline after environmental compensation.
    pub compensated: f32,
    /// PID correction.
    pub correction: f32,
    /// Candidate duty fraction in `[0, 1]`.
    pub duty: f32,
}

impl DutyCandidate {
    const IDLE: Self = Self {
        baseline: 0.0,
        compensated: 0.0,
        correction: 0.0,
        duty: 0.0,
    };
}

/// Level 2: learned baseline plus closed-loop correction.
///
/// Reads the store and never writes it.
#[derive(Debug, Clone)]
pub struct DutySynthesizer {
    pid: PidController,
}

impl DutySynthesizer {
    /// Creates a synthesizer.
    #[must_use]
    pub const fn new(gains: PidConfig) -> Self {
        Self {
            pid: PidController::new(gains),
        }
    }

    /// Produces a candidate duty for `target_psi`.
    pub fn synthesize(
        &mut self,
        target_psi: f32,
        measured_psi: f32,
        rpm: f32,
        store: &CalibrationStore,
        dt_s: f32,
    ) -> DutyCandidate {
        if target_psi <= 0.0 || !target_psi.is_finite() {
            self.pid.reset();
            return DutyCandidate::IDLE;
        }
        let baseline = store.lookup(rpm, target_psi);
        let compensated = (baseline * store.environment().combined()).clamp(0.0, 1.0);
        let correction = self.pid.update(target_psi - measured_psi, dt_s);
        DutyCandidate {
            baseline,
            compensated,
            correction,
            duty: (compensated + correction).clamp(0.0, 1.0),
        }
    }

    /// Clears PID state, e.g. while the governor is cutting.
    pub fn reset(&mut self) {
        self.pid.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::GridConfig, store::CalibrationStore};

    fn store() -> CalibrationStore {
        CalibrationStore::new(&GridConfig::default(), 5.0).unwrap()
    }

    #[test]
    fn zero_target_gives_zero_duty() {
        let mut synth = DutySynthesizer::new(PidConfig::default());
        let candidate = synth.synthesize(0.0, 3.0, 3000.0, &store(), 0.01);
        assert!(candidate.duty.abs() < f32::EPSILON);
    }

    #[test]
    fn duty_stays_in_unit_range() {
        let mut synth = DutySynthesizer::new(PidConfig::default());
        let store = store();
        for (target, measured) in [(25.0, -10.0), (9.0, 30.0), (1.0e6, 0.0)] {
            let candidate = synth.synthesize(target, measured, 3000.0, &store, 0.01);
            assert!((0.0..=1.0).contains(&candidate.duty));
        }
    }

    #[test]
    fn does_not_touch_store() {
        let mut synth = DutySynthesizer::new(PidConfig::default());
        let store = store();
        let before = store.clone();
        for _ in 0..100 {
            synth.synthesize(8.0, 6.0, 3000.0, &store, 0.01);
        }
        assert_eq!(before, store);
    }

    #[test]
    fn positive_error_adds_duty_over_baseline() {
        let mut synth = DutySynthesizer::new(PidConfig::default());
        let candidate = synth.synthesize(8.0, 6.0, 3000.0, &store(), 0.01);
        assert!(candidate.correction > 0.0);
        assert!(candidate.duty > candidate.compensated);
    }
}
