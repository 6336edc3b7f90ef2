use crate::config::PidConfig;

/// PID correction in duty-fraction units.
///
/// The integral is clamped so its contribution never exceeds
/// `integral_limit`, and the total output never exceeds `output_limit`.
#[derive(Debug, Clone)]
pub struct PidController {
    gains: PidConfig,
    integral: f32,
    last_error: Option<f32>,
}

impl PidController {
    /// Creates a controller with zeroed state.
    #[must_use]
    pub const fn new(gains: PidConfig) -> Self {
        Self {
            gains,
            integral: 0.0,
            last_error: None,
        }
    }

    /// Advances one step and returns the correction.
    pub fn update(&mut self, error: f32, dt_s: f32) -> f32 {
        if !error.is_finite() || !dt_s.is_finite() || dt_s <= 0.0 {
            return 0.0;
        }
        let PidConfig {
            kp,
            ki,
            kd,
            integral_limit,
            output_limit,
        } = self.gains;
        if ki > 0.0 {
            let bound = integral_limit / ki;
            self.integral = error.mul_add(dt_s, self.integral).clamp(-bound, bound);
        }
        let derivative = self
            .last_error
            .map_or(0.0, |last| (error - last) / dt_s);
        self.last_error = Some(error);
        let output = kd.mul_add(derivative, kp.mul_add(error, ki * self.integral));
        output.clamp(-output_limit, output_limit)
    }

    /// Clears integral and derivative history.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = None;
    }

    /// Current integral contribution.
    #[must_use]
    pub fn integral_term(&self) -> f32 {
        self.gains.ki * self.integral
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_is_clamped() {
        let gains = PidConfig::default();
        let mut pid = PidController::new(gains);
        for _ in 0..100_000 {
            pid.update(25.0, 0.01);
        }
        assert!(pid.integral_term() <= gains.integral_limit + 1e-6);
        // Windup is bounded, so a reversed error unwinds quickly.
        let mut cycles = 0;
        while pid.integral_term() > 0.0 {
            pid.update(-5.0, 0.01);
            cycles += 1;
        }
        assert!(cycles < 200);
    }

    #[test]
    fn output_is_bounded() {
        let gains = PidConfig::default();
        let mut pid = PidController::new(gains);
        let out = pid.update(1_000.0, 0.01);
        assert!((out - gains.output_limit).abs() < f32::EPSILON);
        assert!(pid.update(f32::NAN, 0.01).abs() < f32::EPSILON);
    }

    #[test]
    fn reset_clears_state() {
        let mut pid = PidController::new(PidConfig::default());
        pid.update(3.0, 0.01);
        pid.reset();
        assert!(pid.integral_term().abs() < f32::EPSILON);
    }
}
