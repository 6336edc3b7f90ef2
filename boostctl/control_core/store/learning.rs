use serde::{Deserialize, Serialize};

use super::{
    BucketKey, CalibrationStore, SafetyLearnedParams, ENV_FACTOR_RANGE, FUSION_OFFSET_RANGE,
    HYSTERESIS_RANGE, LONG_TRIM_BOUND, RESPONSE_RANGE_MS, SHORT_TRIM_BOUND,
};
use crate::config::LearningConfig;

/// Result of one trim update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearningOutcome {
    /// Bucket updated.
    pub key: BucketKey,
    /// New short-term trim.
    pub short_term_trim: f32,
    /// New long-term trim.
    pub long_term_trim: f32,
    /// New confidence.
    pub confidence: f32,
}

/// Optional environmental measurements for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentReadings {
    /// Intake air temperature, °C.
    pub intake_air_temp_c: Option<f32>,
    /// Barometric pressure, kPa.
    pub baro_kpa: Option<f32>,
    /// Dome supply pressure, psi.
    pub supply_psi: Option<f32>,
}

/// Adds `delta` and saturates at `±bound`. Non-finite deltas leave the value.
fn saturating_add(value: f32, delta: f32, bound: f32) -> f32 {
    if delta.is_finite() {
        (value + delta).clamp(-bound, bound)
    } else {
        value
    }
}

/// Moves `value` toward `target` by `rate`, saturating inside `range`.
fn ema(value: f32, target: f32, rate: f32, (lo, hi): (f32, f32)) -> f32 {
    if !target.is_finite() {
        return value;
    }
    (target.clamp(lo, hi) - value).mul_add(rate, value).clamp(lo, hi)
}

impl CalibrationStore {
    /// Updates the bucket nearest `(rpm, target_psi)` from the boost error
    /// observed after the previous duty was applied.
    ///
    /// Returns `None` when an input is not finite; nothing is touched then.
    pub fn learn(
        &mut self,
        rpm: f32,
        target_psi: f32,
        measured_psi: f32,
        config: &LearningConfig,
        now_ms: u64,
    ) -> Option<LearningOutcome> {
        if !(rpm.is_finite() && target_psi.is_finite() && measured_psi.is_finite()) {
            return None;
        }
        let key = self.nearest(rpm, target_psi);
        let error = target_psi - measured_psi;
        let normalized = (error / config.error_window_psi.max(f32::EPSILON)).clamp(-1.0, 1.0);
        let point = self.point_mut(key)?;
        point.short_term_trim = saturating_add(
            point.short_term_trim,
            normalized * config.fast_rate,
            SHORT_TRIM_BOUND,
        );
        if point.confidence >= config.confidence_threshold {
            point.long_term_trim = saturating_add(
                point.long_term_trim,
                point.short_term_trim * config.slow_rate,
                LONG_TRIM_BOUND,
            );
        }
        point.confidence = if error.abs() <= config.consistency_tolerance_psi {
            (point.confidence + config.confidence_gain).min(1.0)
        } else {
            (point.confidence * config.confidence_decay).max(0.0)
        };
        point.sample_count = point.sample_count.saturating_add(1);
        point.last_updated = now_ms;
        Some(LearningOutcome {
            key,
            short_term_trim: point.short_term_trim,
            long_term_trim: point.long_term_trim,
            confidence: point.confidence,
        })
    }

    /// Moves each environmental factor toward the value its reading implies.
    pub fn update_environment(&mut self, readings: &EnvironmentReadings, config: &LearningConfig) {
        let rate = config.environmental_rate;
        let env = &mut self.environment;
        if let Some(iat) = readings.intake_air_temp_c {
            // Warmer, thinner charge needs more duty for the same boost.
            let target = (iat - config.reference_iat_c).mul_add(config.iat_coefficient, 1.0);
            env.temperature = ema(env.temperature, target, rate, ENV_FACTOR_RANGE);
        }
        if let Some(baro) = readings.baro_kpa.filter(|baro| *baro > 0.0) {
            let target = config.reference_baro_kpa / baro;
            env.altitude = ema(env.altitude, target, rate, ENV_FACTOR_RANGE);
        }
        if let Some(supply) = readings.supply_psi.filter(|supply| *supply >= 1.0) {
            let target = config.reference_supply_psi / supply;
            env.supply = ema(env.supply, target, rate, ENV_FACTOR_RANGE);
        }
    }

    /// Folds one transducer-minus-MAP sample into the fusion offset.
    pub fn update_fusion_offset(&mut self, sample_psi: f32, config: &LearningConfig) {
        if !sample_psi.is_finite() || sample_psi.abs() > 3.0 {
            return;
        }
        let offset = &mut self.fusion_offset;
        offset.offset_psi = ema(
            offset.offset_psi,
            sample_psi,
            config.fusion_rate,
            FUSION_OFFSET_RANGE,
        );
        offset.confidence = (offset.confidence + config.confidence_gain).min(1.0);
        offset.sample_count = offset.sample_count.saturating_add(1);
    }

    /// Writes a calibration result into a bucket as one replacement.
    pub fn commit_calibration(
        &mut self,
        key: BucketKey,
        duty: f32,
        confidence: f32,
        samples: u32,
        now_ms: u64,
    ) -> bool {
        if !duty.is_finite() {
            return false;
        }
        let Some(point) = self.point_mut(key) else {
            return false;
        };
        point.baseline_duty = duty.clamp(0.0, 1.0);
        point.short_term_trim = 0.0;
        point.long_term_trim = 0.0;
        point.confidence = confidence.clamp(0.0, 1.0);
        point.sample_count = point.sample_count.saturating_add(samples);
        point.last_updated = now_ms;
        true
    }

    /// Scores a validation run-set against a bucket. A consistent duty raises
    /// confidence by `step`; an inconsistent one re-baselines the bucket and
    /// lowers confidence. Returns the new confidence.
    pub fn validate_point(
        &mut self,
        key: BucketKey,
        duty: f32,
        step: f32,
        tolerance: f32,
        now_ms: u64,
    ) -> Option<f32> {
        if !duty.is_finite() {
            return None;
        }
        let point = self.point_mut(key)?;
        if (duty - point.effective_duty()).abs() <= tolerance {
            point.confidence = (point.confidence + step).min(1.0);
        } else {
            point.baseline_duty = duty.clamp(0.0, 1.0);
            point.short_term_trim = 0.0;
            point.long_term_trim = 0.0;
            point.confidence = (point.confidence - step).max(0.0);
        }
        point.last_updated = now_ms;
        Some(point.confidence)
    }
}

impl SafetyLearnedParams {
    /// Learns from one overboost event. `overshoot_psi` is how far the peak
    /// went past the limit; `response_ms` how long boost took to clear.
    pub fn record_event(&mut self, overshoot_psi: f32, response_ms: f32, rate: f32) {
        if overshoot_psi.is_finite() {
            // Recover only once boost has fallen at least as far as it overshot.
            let target = overshoot_psi.max(0.0) + HYSTERESIS_RANGE.0;
            self.hysteresis_psi = ema(self.hysteresis_psi, target, rate, HYSTERESIS_RANGE);
        }
        if response_ms.is_finite() {
            self.response_ms = ema(self.response_ms, response_ms, rate, RESPONSE_RANGE_MS);
        }
        self.event_count = self.event_count.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridConfig;

    fn store() -> CalibrationStore {
        CalibrationStore::new(&GridConfig::default(), 5.0).unwrap()
    }

    #[test]
    fn trims_saturate_under_extreme_errors() {
        let mut store = store();
        let config = LearningConfig::default();
        for _ in 0..10_000 {
            store.learn(3000.0, 9.0, -1.0e9, &config, 1);
        }
        let key = store.nearest(3000.0, 9.0);
        let point = *store.point(key).unwrap();
        assert!((point.short_term_trim - SHORT_TRIM_BOUND).abs() < f32::EPSILON);
        assert!(point.long_term_trim <= LONG_TRIM_BOUND);
        for _ in 0..10_000 {
            store.learn(3000.0, 9.0, 1.0e9, &config, 2);
        }
        let point = *store.point(key).unwrap();
        assert!((point.short_term_trim + SHORT_TRIM_BOUND).abs() < f32::EPSILON);
        assert!(point.long_term_trim >= -LONG_TRIM_BOUND);
    }

    #[test]
    fn long_trim_waits_for_confidence() {
        let mut store = store();
        let config = LearningConfig::default();
        let key = store.nearest(3000.0, 8.0);
        // Consistent but non-zero error: confidence climbs, short trim moves.
        for _ in 0..50 {
            store.learn(3000.0, 8.0, 7.8, &config, 1);
        }
        let point = *store.point(key).unwrap();
        assert!(point.confidence < config.confidence_threshold);
        assert!(point.long_term_trim.abs() < f32::EPSILON);
        for _ in 0..200 {
            store.learn(3000.0, 8.0, 7.8, &config, 2);
        }
        let point = *store.point(key).unwrap();
        assert!(point.confidence >= config.confidence_threshold);
        assert!(point.long_term_trim > 0.0);
    }

    #[test]
    fn confidence_decays_on_inconsistency() {
        let mut store = store();
        let config = LearningConfig::default();
        for _ in 0..100 {
            store.learn(3000.0, 8.0, 8.0, &config, 1);
        }
        let key = store.nearest(3000.0, 8.0);
        let before = store.point(key).unwrap().confidence;
        store.learn(3000.0, 8.0, 5.0, &config, 2);
        let after = store.point(key).unwrap().confidence;
        assert!((after - before * 0.9).abs() < 1e-6);
    }

    #[test]
    fn non_finite_inputs_are_ignored() {
        let mut store = store();
        let before = store.clone();
        let config = LearningConfig::default();
        assert!(store.learn(f32::NAN, 8.0, 7.0, &config, 1).is_none());
        assert!(store.learn(3000.0, 8.0, f32::INFINITY, &config, 1).is_none());
        store.update_fusion_offset(f32::NAN, &config);
        store.update_environment(
            &EnvironmentReadings {
                intake_air_temp_c: Some(f32::NAN),
                ..EnvironmentReadings::default()
            },
            &config,
        );
        assert_eq!(before, store);
    }

    #[test]
    fn environment_factors_stay_bounded() {
        let mut store = store();
        let config = LearningConfig::default();
        let readings = EnvironmentReadings {
            intake_air_temp_c: Some(400.0),
            baro_kpa: Some(20.0),
            supply_psi: Some(1.0),
        };
        for _ in 0..5_000 {
            store.update_environment(&readings, &config);
        }
        let env = store.environment();
        assert!((env.temperature - ENV_FACTOR_RANGE.1).abs() < 1e-3);
        assert!(env.altitude <= ENV_FACTOR_RANGE.1);
        assert!(env.combined() <= ENV_FACTOR_RANGE.1);
    }

    #[test]
    fn environment_moves_about_one_percent_per_update() {
        let mut store = store();
        let config = LearningConfig::default();
        let readings = EnvironmentReadings {
            intake_air_temp_c: Some(75.0),
            ..EnvironmentReadings::default()
        };
        store.update_environment(&readings, &config);
        // Target 1.2, one step of 1% covers 0.002.
        assert!((store.environment().temperature - 1.002).abs() < 1e-5);
    }

    #[test]
    fn fusion_offset_learns_slowly() {
        let mut store = store();
        let config = LearningConfig::default();
        for _ in 0..100 {
            store.update_fusion_offset(0.4, &config);
        }
        let offset = store.fusion_offset();
        assert!(offset.offset_psi > 0.2 && offset.offset_psi < 0.4);
        assert_eq!(offset.sample_count, 100);
        store.update_fusion_offset(10.0, &config);
        assert_eq!(store.fusion_offset().sample_count, 100);
    }

    #[test]
    fn safety_params_respect_floor_and_ceiling() {
        let mut params = SafetyLearnedParams::default();
        for _ in 0..5_000 {
            params.record_event(50.0, 100_000.0, 0.02);
        }
        assert!((params.hysteresis_psi - HYSTERESIS_RANGE.1).abs() < 1e-3);
        assert!((params.response_ms - RESPONSE_RANGE_MS.1).abs() < 1e-2);
        for _ in 0..5_000 {
            params.record_event(-50.0, 0.0, 0.02);
        }
        assert!(params.hysteresis_psi >= HYSTERESIS_RANGE.0);
        assert!(params.response_ms >= RESPONSE_RANGE_MS.0);
    }

    #[test]
    fn validation_raises_or_rebaselines() {
        let mut store = store();
        let key = store.nearest(3000.0, 8.0);
        assert!(store.commit_calibration(key, 0.25, 0.5, 30, 1));
        let raised = store.validate_point(key, 0.26, 0.1, 0.05, 2).unwrap();
        assert!((raised - 0.6).abs() < 1e-6);
        let lowered = store.validate_point(key, 0.5, 0.1, 0.05, 3).unwrap();
        assert!((lowered - 0.5).abs() < 1e-6);
        assert!((store.point(key).unwrap().baseline_duty - 0.5).abs() < f32::EPSILON);
    }
}
