use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::TimingConfig;

/// Solenoid PWM output.
pub trait PwmDriver: Send {
    /// Applies a duty cycle in percent (0 to 100).
    fn set_duty(&mut self, percent: f32);
}

/// Driver that records every write; the simulator and tests read it back.
#[derive(Debug, Clone, Default)]
pub struct RecordingPwm {
    writes: Arc<Mutex<Vec<f32>>>,
}

impl RecordingPwm {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last duty written.
    #[must_use]
    pub fn last(&self) -> Option<f32> {
        self.writes.lock().last().copied()
    }

    /// Every duty written, oldest first.
    #[must_use]
    pub fn writes(&self) -> Vec<f32> {
        self.writes.lock().clone()
    }
}

impl PwmDriver for RecordingPwm {
    fn set_duty(&mut self, percent: f32) {
        self.writes.lock().push(percent);
    }
}

/// Aligns duty updates with PWM period boundaries.
///
/// A change waits for the next boundary window unless it has already been
/// held back longer than the maximum deferral. Cuts to zero are never held.
#[derive(Debug, Clone)]
pub struct PwmPhaseScheduler {
    period_ms: f64,
    window_ms: f64,
    max_defer_ms: f64,
    applied: Option<f32>,
    pending_since: Option<u64>,
}

impl PwmPhaseScheduler {
    /// Builds a scheduler from the PWM timing configuration.
    #[must_use]
    pub fn new(timing: &TimingConfig) -> Self {
        let pwm_hz = f64::from(timing.pwm_hz.max(1));
        Self {
            period_ms: 1000.0 / pwm_hz,
            window_ms: f64::from(timing.pwm_window_ms),
            max_defer_ms: f64::from(timing.pwm_max_defer_ms),
            applied: None,
            pending_since: None,
        }
    }

    /// Duty currently on the output.
    #[must_use]
    pub const fn applied(&self) -> Option<f32> {
        self.applied
    }

    /// Returns the duty to write this cycle, or `None` to leave the output
    /// as it is.
    pub fn schedule(&mut self, duty: f32, now_ms: u64) -> Option<f32> {
        if self
            .applied
            .is_some_and(|applied| (applied - duty).abs() < f32::EPSILON)
        {
            self.pending_since = None;
            return None;
        }
        let cut = duty <= 0.0;
        let since = *self.pending_since.get_or_insert(now_ms);
        let overdue = Self::millis(now_ms.saturating_sub(since)) >= self.max_defer_ms;
        if cut || self.applied.is_none() || overdue || self.near_boundary(now_ms) {
            self.applied = Some(duty);
            self.pending_since = None;
            return Some(duty);
        }
        None
    }

    #[allow(clippy::cast_precision_loss)]
    fn millis(ms: u64) -> f64 {
        ms as f64
    }

    fn near_boundary(&self, now_ms: u64) -> bool {
        let phase = Self::millis(now_ms) % self.period_ms;
        phase <= self.window_ms || self.period_ms - phase <= self.window_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> PwmPhaseScheduler {
        PwmPhaseScheduler::new(&TimingConfig::default())
    }

    #[test]
    fn first_write_and_cuts_are_immediate() {
        let mut pwm = scheduler();
        assert_eq!(pwm.schedule(20.0, 15), Some(20.0));
        assert_eq!(pwm.schedule(0.0, 16), Some(0.0));
        assert_eq!(pwm.applied(), Some(0.0));
    }

    #[test]
    fn defers_to_boundary_then_bounded() {
        let mut pwm = scheduler();
        pwm.schedule(20.0, 0);
        // 30 Hz: boundaries near 0, 33.3, 66.7 ms; 15 ms is mid-period.
        assert_eq!(pwm.schedule(25.0, 15), None);
        assert_eq!(pwm.schedule(25.0, 20), None);
        assert_eq!(pwm.schedule(25.0, 25), Some(25.0));
        assert_eq!(pwm.schedule(30.0, 32), Some(30.0));
    }

    #[test]
    fn unchanged_duty_is_not_rewritten() {
        let mut pwm = scheduler();
        pwm.schedule(20.0, 0);
        assert_eq!(pwm.schedule(20.0, 33), None);
    }

    #[test]
    fn recording_driver_keeps_history() {
        let mut driver = RecordingPwm::new();
        let reader = driver.clone();
        driver.set_duty(10.0);
        driver.set_duty(0.0);
        assert_eq!(reader.writes(), vec![10.0, 0.0]);
        assert_eq!(reader.last(), Some(0.0));
    }
}
