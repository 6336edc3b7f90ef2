//! Learned calibration data: duty map, environmental compensation, fusion
//! offset and learned safety parameters.
//!
//! Trims are keyed only by physical operating point (rpm, boost target);
//! aggression never enters stored calibration.

use serde::{Deserialize, Serialize};

use crate::{
    config::{GridConfig, SafetyLimits},
    error::{ControlError, ControlResult},
};

/// Bounded update rules.
pub mod learning;

pub use learning::{EnvironmentReadings, LearningOutcome};

/// Persisted schema version of [`CalibrationStore`].
pub const SCHEMA_VERSION: u32 = 1;
/// Bound on `short_term_trim`.
pub const SHORT_TRIM_BOUND: f32 = 0.1;
/// Bound on `long_term_trim`.
pub const LONG_TRIM_BOUND: f32 = 0.2;
/// Bounds on every environmental factor.
pub const ENV_FACTOR_RANGE: (f32, f32) = (0.7, 1.3);
/// Bounds on learned hysteresis, psi.
pub const HYSTERESIS_RANGE: (f32, f32) = (0.2, 3.0);
/// Bounds on learned response time, ms.
pub const RESPONSE_RANGE_MS: (f32, f32) = (10.0, 2_000.0);
/// Bounds on the learned transducer-minus-MAP offset, psi.
pub const FUSION_OFFSET_RANGE: (f32, f32) = (-3.0, 3.0);

/// Grid coordinates of a calibration point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    /// RPM bucket index.
    pub rpm: usize,
    /// Boost target bucket index.
    pub boost: usize,
}

/// Learned duty for one operating point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    /// Baseline duty fraction.
    pub baseline_duty: f32,
    /// Fast-moving correction.
    pub short_term_trim: f32,
    /// Slow-moving correction.
    pub long_term_trim: f32,
    /// Confidence in this point.
    pub confidence: f32,
    /// Learning samples seen.
    pub sample_count: u32,
    /// Loop time of the last update.
    pub last_updated: u64,
}

impl CalibrationPoint {
    fn seeded(baseline_duty: f32) -> Self {
        Self {
            baseline_duty: baseline_duty.clamp(0.0, 1.0),
            short_term_trim: 0.0,
            long_term_trim: 0.0,
            confidence: 0.0,
            sample_count: 0,
            last_updated: 0,
        }
    }

    /// Baseline plus trims, clamped to a valid duty fraction. This is the only
    /// value the synthesizer reads.
    #[must_use]
    pub fn effective_duty(&self) -> f32 {
        (self.baseline_duty + self.short_term_trim + self.long_term_trim).clamp(0.0, 1.0)
    }
}

/// Multiplicative corrections for air temperature, altitude and supply.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentalCompensation {
    /// Intake temperature factor.
    pub temperature: f32,
    /// Barometric factor.
    pub altitude: f32,
    /// Dome supply pressure factor.
    pub supply: f32,
}

impl Default for EnvironmentalCompensation {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            altitude: 1.0,
            supply: 1.0,
        }
    }
}

impl EnvironmentalCompensation {
    /// Combined factor, kept inside the per-factor range.
    #[must_use]
    pub fn combined(&self) -> f32 {
        (self.temperature * self.altitude * self.supply).clamp(ENV_FACTOR_RANGE.0, ENV_FACTOR_RANGE.1)
    }
}

/// Learned offset between the boost transducer and bus MAP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorFusionOffset {
    /// Transducer minus MAP, psi.
    pub offset_psi: f32,
    /// Confidence in the offset.
    pub confidence: f32,
    /// Samples learned.
    pub sample_count: u32,
}

/// Safety parameters learned from overboost events.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafetyLearnedParams {
    /// Learned recovery hysteresis, psi.
    pub hysteresis_psi: f32,
    /// Learned cut-to-clear pneumatic response, ms.
    pub response_ms: f32,
    /// Safety events learned from.
    pub event_count: u32,
}

impl Default for SafetyLearnedParams {
    fn default() -> Self {
        Self {
            hysteresis_psi: HYSTERESIS_RANGE.0,
            response_ms: 200.0,
            event_count: 0,
        }
    }
}

impl SafetyLearnedParams {
    /// Hysteresis the governor applies: never below the user's value.
    #[must_use]
    pub fn effective_hysteresis(&self, limits: &SafetyLimits) -> f32 {
        let cap = (limits.overboost_limit - limits.spring_pressure).max(HYSTERESIS_RANGE.0);
        limits
            .overboost_hysteresis
            .max(self.hysteresis_psi)
            .min(cap)
    }

    /// Encodes for the `safety_params` record.
    pub fn to_bytes(&self) -> ControlResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a `safety_params` record, clamping into the hard bounds.
    pub fn from_bytes(bytes: &[u8]) -> ControlResult<Self> {
        let mut params: Self = serde_json::from_slice(bytes)?;
        params.hysteresis_psi =
            sanitize(params.hysteresis_psi, HYSTERESIS_RANGE, HYSTERESIS_RANGE.0);
        params.response_ms = sanitize(params.response_ms, RESPONSE_RANGE_MS, RESPONSE_RANGE_MS.0);
        Ok(params)
    }
}

/// Clamps into `(lo, hi)`; non-finite values become `fallback`.
fn sanitize(value: f32, (lo, hi): (f32, f32), fallback: f32) -> f32 {
    if value.is_finite() {
        value.clamp(lo, hi)
    } else {
        fallback
    }
}

/// What `reset_learned_data` clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetScope {
    /// Everything learned.
    All,
    /// Short- and long-term trims only.
    Trims,
    /// Duty map back to its seed.
    Calibration,
    /// Environmental factors.
    Environment,
    /// Sensor fusion offset.
    SensorFusion,
    /// Learned safety parameters.
    Safety,
}

/// Dense calibration grid plus environmental and fusion learning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStore {
    version: u32,
    rpm_buckets: Vec<f32>,
    boost_buckets: Vec<f32>,
    seed_spring_psi: f32,
    seed_duty_per_psi: f32,
    points: Vec<CalibrationPoint>,
    environment: EnvironmentalCompensation,
    fusion_offset: SensorFusionOffset,
}

impl CalibrationStore {
    /// Builds a store seeded from the grid and spring pressure.
    pub fn new(grid: &GridConfig, spring_pressure: f32) -> ControlResult<Self> {
        check_buckets("rpm_buckets", &grid.rpm_buckets)?;
        check_buckets("boost_buckets", &grid.boost_buckets)?;
        let mut store = Self {
            version: SCHEMA_VERSION,
            rpm_buckets: grid.rpm_buckets.clone(),
            boost_buckets: grid.boost_buckets.clone(),
            seed_spring_psi: spring_pressure,
            seed_duty_per_psi: grid.seed_duty_per_psi,
            points: Vec::new(),
            environment: EnvironmentalCompensation::default(),
            fusion_offset: SensorFusionOffset::default(),
        };
        store.reseed();
        Ok(store)
    }

    fn reseed(&mut self) {
        let spring = self.seed_spring_psi;
        let per_psi = self.seed_duty_per_psi;
        self.points = self
            .rpm_buckets
            .iter()
            .flat_map(|_| {
                self.boost_buckets
                    .iter()
                    .map(move |boost| CalibrationPoint::seeded((boost - spring).max(0.0) * per_psi))
            })
            .collect();
    }

    /// RPM bucket centres.
    #[must_use]
    pub fn rpm_buckets(&self) -> &[f32] {
        &self.rpm_buckets
    }

    /// Boost bucket centres.
    #[must_use]
    pub fn boost_buckets(&self) -> &[f32] {
        &self.boost_buckets
    }

    /// Nearest bucket to an operating point.
    #[must_use]
    pub fn nearest(&self, rpm: f32, boost_psi: f32) -> BucketKey {
        BucketKey {
            rpm: nearest_index(&self.rpm_buckets, rpm),
            boost: nearest_index(&self.boost_buckets, boost_psi),
        }
    }

    /// Point at a bucket.
    #[must_use]
    pub fn point(&self, key: BucketKey) -> Option<&CalibrationPoint> {
        self.index(key).and_then(|idx| self.points.get(idx))
    }

    pub(crate) fn point_mut(&mut self, key: BucketKey) -> Option<&mut CalibrationPoint> {
        self.index(key).and_then(move |idx| self.points.get_mut(idx))
    }

    fn index(&self, key: BucketKey) -> Option<usize> {
        (key.rpm < self.rpm_buckets.len() && key.boost < self.boost_buckets.len())
            .then(|| key.rpm * self.boost_buckets.len() + key.boost)
    }

    /// Iterates every bucket with its point.
    pub fn points(&self) -> impl Iterator<Item = (BucketKey, &CalibrationPoint)> {
        let width = self.boost_buckets.len();
        self.points.iter().enumerate().map(move |(idx, point)| {
            (
                BucketKey {
                    rpm: idx / width,
                    boost: idx % width,
                },
                point,
            )
        })
    }

    /// Bilinear interpolation of effective duty over the four surrounding
    /// buckets; values beyond the grid clamp to its edge.
    #[must_use]
    pub fn lookup(&self, rpm: f32, boost_psi: f32) -> f32 {
        let (r0, r1, fr) = locate(&self.rpm_buckets, rpm);
        let (b0, b1, fb) = locate(&self.boost_buckets, boost_psi);
        let value = |rpm, boost| {
            self.point(BucketKey { rpm, boost })
                .map_or(0.0, CalibrationPoint::effective_duty)
        };
        let low = lerp(value(r0, b0), value(r0, b1), fb);
        let high = lerp(value(r1, b0), value(r1, b1), fb);
        lerp(low, high, fr).clamp(0.0, 1.0)
    }

    /// Environmental compensation.
    #[must_use]
    pub const fn environment(&self) -> &EnvironmentalCompensation {
        &self.environment
    }

    /// Sensor fusion offset.
    #[must_use]
    pub const fn fusion_offset(&self) -> &SensorFusionOffset {
        &self.fusion_offset
    }

    /// Zeroes every trim. Repeating the call changes nothing.
    pub fn reset_trims(&mut self) {
        for point in &mut self.points {
            point.short_term_trim = 0.0;
            point.long_term_trim = 0.0;
        }
    }

    /// Clears the learned data named by `scope`. [`ResetScope::Safety`] is
    /// held outside the store and is a no-op here.
    pub fn reset(&mut self, scope: ResetScope) {
        match scope {
            ResetScope::Trims => self.reset_trims(),
            ResetScope::Calibration => self.reseed(),
            ResetScope::Environment => self.environment = EnvironmentalCompensation::default(),
            ResetScope::SensorFusion => self.fusion_offset = SensorFusionOffset::default(),
            ResetScope::All => {
                self.reseed();
                self.environment = EnvironmentalCompensation::default();
                self.fusion_offset = SensorFusionOffset::default();
            }
            ResetScope::Safety => {}
        }
    }

    /// Drops confidence where new limits change what a bucket means.
    ///
    /// A spring change shifts every baseline; otherwise only buckets above
    /// the lower of the old and new maximum boost are affected. Returns the
    /// number of points touched.
    pub fn invalidate_for_limits(&mut self, old: &SafetyLimits, new: &SafetyLimits) -> usize {
        let spring_changed = (old.spring_pressure - new.spring_pressure).abs() > f32::EPSILON;
        let boundary = old.max_boost_psi.min(new.max_boost_psi);
        let width = self.boost_buckets.len();
        let mut touched = 0;
        for (idx, point) in self.points.iter_mut().enumerate() {
            let boost = self.boost_buckets.get(idx % width).copied().unwrap_or(0.0);
            if (spring_changed || boost > boundary) && point.confidence > 0.0 {
                point.confidence = 0.0;
                touched += 1;
            }
        }
        if spring_changed {
            self.seed_spring_psi = new.spring_pressure;
        }
        touched
    }

    /// Encodes the `calibration` record.
    pub fn to_bytes(&self) -> ControlResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a `calibration` record, checks its shape and pulls every
    /// learned value back inside its bound.
    ///
    /// Non-finite trims and confidences reset to zero, a non-finite baseline
    /// falls back to its seed and non-finite factors go neutral.
    pub fn from_bytes(bytes: &[u8]) -> ControlResult<Self> {
        let mut store: Self = serde_json::from_slice(bytes)?;
        if store.version != SCHEMA_VERSION {
            return Err(ControlError::ConfigInvalid(format!(
                "calibration schema {} unsupported (expected {SCHEMA_VERSION})",
                store.version
            )));
        }
        check_buckets("rpm_buckets", &store.rpm_buckets)?;
        check_buckets("boost_buckets", &store.boost_buckets)?;
        if store.points.len() != store.rpm_buckets.len() * store.boost_buckets.len() {
            return Err(ControlError::ConfigInvalid(
                "calibration grid size does not match its buckets".into(),
            ));
        }
        if !store.seed_spring_psi.is_finite() || !store.seed_duty_per_psi.is_finite() {
            return Err(ControlError::ConfigInvalid(
                "calibration seed parameters are not finite".into(),
            ));
        }
        store.clamp_learned();
        Ok(store)
    }

    fn clamp_learned(&mut self) {
        let spring = self.seed_spring_psi;
        let per_psi = self.seed_duty_per_psi;
        let width = self.boost_buckets.len();
        for (idx, point) in self.points.iter_mut().enumerate() {
            let seed = self
                .boost_buckets
                .get(idx % width)
                .map_or(0.0, |boost| ((boost - spring).max(0.0) * per_psi).clamp(0.0, 1.0));
            point.baseline_duty = sanitize(point.baseline_duty, (0.0, 1.0), seed);
            point.short_term_trim =
                sanitize(point.short_term_trim, (-SHORT_TRIM_BOUND, SHORT_TRIM_BOUND), 0.0);
            point.long_term_trim =
                sanitize(point.long_term_trim, (-LONG_TRIM_BOUND, LONG_TRIM_BOUND), 0.0);
            point.confidence = sanitize(point.confidence, (0.0, 1.0), 0.0);
        }
        let env = &mut self.environment;
        env.temperature = sanitize(env.temperature, ENV_FACTOR_RANGE, 1.0);
        env.altitude = sanitize(env.altitude, ENV_FACTOR_RANGE, 1.0);
        env.supply = sanitize(env.supply, ENV_FACTOR_RANGE, 1.0);
        let offset = &mut self.fusion_offset;
        offset.offset_psi = sanitize(offset.offset_psi, FUSION_OFFSET_RANGE, 0.0);
        offset.confidence = sanitize(offset.confidence, (0.0, 1.0), 0.0);
    }
}

fn check_buckets(name: &str, buckets: &[f32]) -> ControlResult<()> {
    if buckets.len() < 2
        || buckets.iter().any(|value| !value.is_finite())
        || buckets.windows(2).any(|pair| pair[0] >= pair[1])
    {
        return Err(ControlError::ConfigInvalid(format!(
            "{name} must hold at least two strictly ascending values"
        )));
    }
    Ok(())
}

fn nearest_index(buckets: &[f32], value: f32) -> usize {
    buckets
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| (*a - value).abs().total_cmp(&(*b - value).abs()))
        .map_or(0, |(idx, _)| idx)
}

fn locate(buckets: &[f32], value: f32) -> (usize, usize, f32) {
    let last = buckets.len().saturating_sub(1);
    let (Some(first), Some(end)) = (buckets.first(), buckets.last()) else {
        return (0, 0, 0.0);
    };
    if !value.is_finite() || value <= *first {
        return (0, 0, 0.0);
    }
    if value >= *end {
        return (last, last, 0.0);
    }
    let upper = buckets.partition_point(|bucket| *bucket <= value).clamp(1, last);
    let lower = upper - 1;
    let span = buckets[upper] - buckets[lower];
    (lower, upper, (value - buckets[lower]) / span)
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    (b - a).mul_add(t, a)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CalibrationStore {
        CalibrationStore::new(&GridConfig::default(), 5.0).unwrap()
    }

    #[test]
    fn seeds_baseline_above_spring_only() {
        let store = store();
        let at_spring = store.lookup(3000.0, 5.0);
        let above = store.lookup(3000.0, 9.0);
        assert!(at_spring.abs() < 1e-6);
        assert!((above - 0.12).abs() < 1e-5);
    }

    #[test]
    fn bilinear_between_buckets_and_clamped_outside() {
        let mut store = store();
        let a = store.nearest(3000.0, 8.0);
        let b = store.nearest(3000.0, 9.0);
        store.point_mut(a).unwrap().baseline_duty = 0.2;
        store.point_mut(b).unwrap().baseline_duty = 0.4;
        assert!((store.lookup(3000.0, 8.5) - 0.3).abs() < 1e-5);
        // Beyond the top of the grid the edge value holds.
        let top = store.lookup(20_000.0, 40.0);
        assert!((top - store.lookup(7000.0, 25.0)).abs() < 1e-6);
        assert!(store.lookup(f32::NAN, 8.0).is_finite());
    }

    #[test]
    fn reset_trims_is_idempotent() {
        let mut store = store();
        let key = store.nearest(3500.0, 8.0);
        {
            let point = store.point_mut(key).unwrap();
            point.short_term_trim = 0.07;
            point.long_term_trim = -0.15;
            point.confidence = 0.9;
        }
        store.reset_trims();
        let once = store.clone();
        store.reset_trims();
        assert_eq!(once, store);
        let point = store.point(key).unwrap();
        assert!(point.short_term_trim.abs() < f32::EPSILON);
        assert!((point.confidence - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn round_trip_is_bit_exact() {
        let mut store = store();
        let keys: Vec<BucketKey> = store.points().map(|(key, _)| key).collect();
        for (i, key) in keys.into_iter().enumerate() {
            let seed = i as f32;
            let point = store.point_mut(key).unwrap();
            point.baseline_duty = (seed * 0.013_7).sin().abs();
            point.short_term_trim = (seed * 0.071).cos() * 0.1;
            point.long_term_trim = (seed * 0.003_3).sin() * 0.2;
            point.confidence = (seed / 337.0).min(1.0);
            point.sample_count = i as u32 * 7;
            point.last_updated = i as u64 * 10;
        }
        let bytes = store.to_bytes().unwrap();
        let reloaded = CalibrationStore::from_bytes(&bytes).unwrap();
        for ((_, a), (_, b)) in store.points().zip(reloaded.points()) {
            assert_eq!(a.baseline_duty.to_bits(), b.baseline_duty.to_bits());
            assert_eq!(a.short_term_trim.to_bits(), b.short_term_trim.to_bits());
            assert_eq!(a.long_term_trim.to_bits(), b.long_term_trim.to_bits());
            assert_eq!(a.confidence.to_bits(), b.confidence.to_bits());
            assert_eq!(a.sample_count, b.sample_count);
        }
        assert_eq!(store, reloaded);
    }

    #[test]
    fn rejects_mismatched_record() {
        let store = store();
        let mut value: serde_json::Value = serde_json::from_slice(&store.to_bytes().unwrap()).unwrap();
        value["points"].as_array_mut().unwrap().pop();
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(CalibrationStore::from_bytes(&bytes).is_err());
    }

    #[test]
    fn loaded_values_are_pulled_inside_their_bounds() {
        let store = store();
        let key = store.nearest(3500.0, 9.0);
        let idx = key.rpm * store.boost_buckets().len() + key.boost;
        let mut value: serde_json::Value =
            serde_json::from_slice(&store.to_bytes().unwrap()).unwrap();
        value["points"][idx]["short_term_trim"] = 0.9_f64.into();
        value["points"][idx]["long_term_trim"] = (-5.0_f64).into();
        value["points"][idx]["confidence"] = 7.0_f64.into();
        value["points"][idx]["baseline_duty"] = 3.0_f64.into();
        value["environment"]["temperature"] = 9.0_f64.into();
        value["fusion_offset"]["offset_psi"] = (-40.0_f64).into();
        let bytes = serde_json::to_vec(&value).unwrap();

        let loaded = CalibrationStore::from_bytes(&bytes).unwrap();
        let point = loaded.point(key).unwrap();
        assert!((point.short_term_trim - SHORT_TRIM_BOUND).abs() < f32::EPSILON);
        assert!((point.long_term_trim + LONG_TRIM_BOUND).abs() < f32::EPSILON);
        assert!((point.confidence - 1.0).abs() < f32::EPSILON);
        assert!((point.baseline_duty - 1.0).abs() < f32::EPSILON);
        assert!((loaded.environment().temperature - ENV_FACTOR_RANGE.1).abs() < f32::EPSILON);
        assert!((loaded.fusion_offset().offset_psi - FUSION_OFFSET_RANGE.0).abs() < f32::EPSILON);
    }

    #[test]
    fn non_finite_loaded_values_fall_back() {
        let store = store();
        let key = store.nearest(3500.0, 9.0);
        let idx = key.rpm * store.boost_buckets().len() + key.boost;
        let mut value: serde_json::Value =
            serde_json::from_slice(&store.to_bytes().unwrap()).unwrap();
        // Too large for f32: these parse as infinities.
        value["points"][idx]["short_term_trim"] = 1e39_f64.into();
        value["points"][idx]["confidence"] = 1e39_f64.into();
        value["points"][idx]["baseline_duty"] = (-1e39_f64).into();
        value["environment"]["altitude"] = 1e39_f64.into();
        let bytes = serde_json::to_vec(&value).unwrap();

        let loaded = CalibrationStore::from_bytes(&bytes).unwrap();
        let point = loaded.point(key).unwrap();
        assert!(point.short_term_trim.abs() < f32::EPSILON);
        assert!(point.confidence.abs() < f32::EPSILON);
        assert!((point.baseline_duty - 0.12).abs() < 1e-5);
        assert!((loaded.environment().altitude - 1.0).abs() < f32::EPSILON);
        assert!(loaded
            .points()
            .all(|(_, point)| point.effective_duty().is_finite()));
    }

    #[test]
    fn limit_change_invalidates_upper_region() {
        let mut store = store();
        let keys: Vec<BucketKey> = store.points().map(|(key, _)| key).collect();
        for key in keys {
            store.point_mut(key).unwrap().confidence = 0.9;
        }
        let old = SafetyLimits::default();
        let new = SafetyLimits {
            max_boost_psi: 8.0,
            ..old
        };
        let touched = store.invalidate_for_limits(&old, &new);
        assert!(touched > 0);
        let low = store.nearest(3000.0, 6.0);
        let high = store.nearest(3000.0, 9.0);
        assert!((store.point(low).unwrap().confidence - 0.9).abs() < f32::EPSILON);
        assert!(store.point(high).unwrap().confidence.abs() < f32::EPSILON);
    }

    #[test]
    fn effective_hysteresis_respects_user_value() {
        let limits = SafetyLimits::default();
        let mut params = SafetyLearnedParams::default();
        assert!((params.effective_hysteresis(&limits) - 0.5).abs() < f32::EPSILON);
        params.hysteresis_psi = 1.2;
        assert!((params.effective_hysteresis(&limits) - 1.2).abs() < f32::EPSILON);
    }
}
