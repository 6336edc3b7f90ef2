use serde::{Deserialize, Serialize};

use crate::{
    config::FusionConfig,
    error::{ControlError, ControlResult},
    sample::RawSensorFrame,
};

const KPA_PER_PSI: f32 = 6.895;

/// Converts transducer millivolts to gauge psi (0.5 V = 0 psi, 4.5 V = 30 psi).
#[must_use]
pub fn millivolts_to_psi(millivolts: f32) -> f32 {
    (((millivolts / 1000.0 - 0.5) / 4.0) * 30.0).clamp(0.0, 30.0)
}

/// Converts an absolute pressure in kPa to gauge psi.
#[must_use]
pub fn kpa_to_gauge_psi(kpa: f32, atmospheric_psi: f32) -> f32 {
    kpa / KPA_PER_PSI - atmospheric_psi
}

/// Which source produced the fused manifold value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FusionSource {
    /// Boost transducer alone.
    Transducer,
    /// Weighted blend across the overlap band.
    Blended,
    /// Bus MAP alone (deep vacuum).
    Map,
}

/// Agreement between the two sources where both are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorAgreement {
    /// Within tolerance.
    Good,
    /// Noticeable but below the major threshold.
    Minor,
    /// Large disagreement; check plumbing or the offset.
    Major,
    /// Pressure outside the comparison window.
    OutOfRange,
    /// Only one source available.
    Unavailable,
}

/// Output of one fusion pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionReading {
    /// Continuous manifold pressure, gauge psi.
    pub manifold_psi: f32,
    /// Dome supply pressure, psi.
    pub dome_input_psi: f32,
    /// Upper dome pressure, psi.
    pub dome_upper_psi: f32,
    /// Source used for `manifold_psi`.
    pub source: FusionSource,
    /// Diagnostic agreement class.
    pub agreement: SensorAgreement,
    /// Transducer minus MAP when conditions allow offset learning.
    pub offset_sample: Option<f32>,
}

/// Normalizes raw pressure readings into one manifold signal.
#[derive(Debug, Clone)]
pub struct SensorFusion {
    config: FusionConfig,
    sensor_timeout_ms: u64,
    previous: Option<(f32, u64)>,
}

impl SensorFusion {
    /// Creates a fusion stage.
    #[must_use]
    pub const fn new(config: FusionConfig, sensor_timeout_ms: u64) -> Self {
        Self {
            config,
            sensor_timeout_ms,
            previous: None,
        }
    }

    /// Fuses one frame. `offset_psi` is the learned transducer-minus-MAP offset.
    pub fn fuse(
        &mut self,
        frame: &RawSensorFrame,
        map_kpa: Option<f32>,
        offset_psi: f32,
        now_ms: u64,
    ) -> ControlResult<FusionReading> {
        let age = now_ms.saturating_sub(frame.timestamp_ms);
        if age > self.sensor_timeout_ms {
            return Err(ControlError::SensorInvalid(format!(
                "sensor frame is {age} ms old"
            )));
        }
        for (name, millivolts) in [
            ("manifold", frame.manifold_mv),
            ("dome_input", frame.dome_input_mv),
            ("dome_upper", frame.dome_upper_mv),
        ] {
            if !millivolts.is_finite()
                || millivolts < self.config.min_millivolts
                || millivolts > self.config.max_millivolts
            {
                return Err(ControlError::SensorInvalid(format!(
                    "{name} reading {millivolts} mV outside {}..={} mV",
                    self.config.min_millivolts, self.config.max_millivolts
                )));
            }
        }

        let high = millivolts_to_psi(frame.manifold_mv);
        let low = map_kpa
            .filter(|kpa| kpa.is_finite() && *kpa > 0.0)
            .map(|kpa| kpa_to_gauge_psi(kpa, self.config.atmospheric_psi));

        let threshold = self.config.overlap_threshold_psi;
        let (manifold_psi, source) = match low {
            None => (high, FusionSource::Transducer),
            Some(_) if high >= threshold => (high, FusionSource::Transducer),
            Some(low) => {
                let corrected = low + offset_psi;
                let weight = (high / threshold).clamp(0.0, 1.0);
                if weight <= f32::EPSILON {
                    (corrected, FusionSource::Map)
                } else {
                    (
                        weight.mul_add(high, (1.0 - weight) * corrected),
                        FusionSource::Blended,
                    )
                }
            }
        };

        let rate = self.previous.map_or(0.0, |(last, at)| {
            #[allow(clippy::cast_precision_loss)]
            let dt = now_ms.saturating_sub(at) as f32 / 1000.0;
            if dt > 0.0 {
                (high - last).abs() / dt
            } else {
                0.0
            }
        });
        self.previous = Some((high, now_ms));

        let band = self.config.learning_band_psi;
        let offset_sample = low.filter(|low| {
            high <= band && low.abs() <= band && rate <= self.config.max_rate_psi_per_s
        });

        Ok(FusionReading {
            manifold_psi,
            dome_input_psi: millivolts_to_psi(frame.dome_input_mv),
            dome_upper_psi: millivolts_to_psi(frame.dome_upper_mv),
            source,
            agreement: self.classify(high, low.map(|low| low + offset_psi)),
            offset_sample: offset_sample.map(|low| high - low),
        })
    }

    fn classify(&self, high: f32, low: Option<f32>) -> SensorAgreement {
        let Some(low) = low else {
            return SensorAgreement::Unavailable;
        };
        let window = 0.0..=self.config.agreement_window_psi;
        if !window.contains(&high) || !window.contains(&low) {
            return SensorAgreement::OutOfRange;
        }
        let diff = (high - low).abs();
        if diff <= self.config.agreement_tolerance_psi {
            SensorAgreement::Good
        } else if diff < self.config.major_disagreement_psi {
            SensorAgreement::Minor
        } else {
            SensorAgreement::Major
        }
    }
}

/// Millivolts a transducer reports for a gauge pressure; inverse of
/// [`millivolts_to_psi`] inside its range.
#[must_use]
pub fn psi_to_millivolts(psi: f32) -> f32 {
    (psi.clamp(0.0, 30.0) / 30.0).mul_add(4.0, 0.5) * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(manifold_psi: f32, ts: u64) -> RawSensorFrame {
        RawSensorFrame {
            manifold_mv: psi_to_millivolts(manifold_psi).max(500.0),
            dome_input_mv: psi_to_millivolts(15.0),
            dome_upper_mv: psi_to_millivolts(2.0),
            timestamp_ms: ts,
        }
    }

    fn fusion() -> SensorFusion {
        SensorFusion::new(FusionConfig::default(), 100)
    }

    #[test]
    fn scaling_matches_transducer_curve() {
        assert!(millivolts_to_psi(500.0).abs() < 1e-4);
        assert!((millivolts_to_psi(4500.0) - 30.0).abs() < 1e-4);
        assert!((millivolts_to_psi(2500.0) - 15.0).abs() < 1e-4);
        assert!(millivolts_to_psi(100.0).abs() < 1e-4);
        assert!((millivolts_to_psi(5000.0) - 30.0).abs() < 1e-4);
    }

    #[test]
    fn boost_range_uses_transducer() {
        let mut fusion = fusion();
        let reading = fusion
            .fuse(&frame(8.0, 0), Some(156.0), 0.0, 5)
            .unwrap();
        assert_eq!(reading.source, FusionSource::Transducer);
        assert!((reading.manifold_psi - 8.0).abs() < 1e-3);
    }

    #[test]
    fn vacuum_uses_map_with_offset() {
        let mut fusion = fusion();
        // 60 kPa absolute is deep vacuum; the transducer bottoms out at 0 psi.
        let reading = fusion.fuse(&frame(0.0, 0), Some(60.0), 0.2, 5).unwrap();
        assert_eq!(reading.source, FusionSource::Map);
        let expected = kpa_to_gauge_psi(60.0, 14.7) + 0.2;
        assert!((reading.manifold_psi - expected).abs() < 1e-3);
    }

    #[test]
    fn blend_is_continuous_at_threshold() {
        let mut fusion = fusion();
        let map = (14.7 + 1.0) * KPA_PER_PSI;
        let below = fusion.fuse(&frame(0.99, 0), Some(map), 0.0, 5).unwrap();
        let above = fusion.fuse(&frame(1.0, 5), Some(map), 0.0, 10).unwrap();
        assert_eq!(below.source, FusionSource::Blended);
        assert!((below.manifold_psi - above.manifold_psi).abs() < 0.05);
    }

    #[test]
    fn rejects_out_of_range_and_stale() {
        let mut fusion = fusion();
        let mut bad = frame(5.0, 0);
        bad.dome_upper_mv = 4900.0;
        assert!(matches!(
            fusion.fuse(&bad, None, 0.0, 5),
            Err(ControlError::SensorInvalid(_))
        ));
        assert!(matches!(
            fusion.fuse(&frame(5.0, 0), None, 0.0, 500),
            Err(ControlError::SensorInvalid(_))
        ));
    }

    #[test]
    fn offset_sample_only_near_atmospheric() {
        let mut fusion = fusion();
        let near = fusion
            .fuse(&frame(0.5, 0), Some(14.9 * KPA_PER_PSI), 0.0, 5)
            .unwrap();
        assert!(near.offset_sample.is_some());
        let boosted = fusion
            .fuse(&frame(6.0, 5), Some(20.7 * KPA_PER_PSI), 0.0, 10)
            .unwrap();
        assert!(boosted.offset_sample.is_none());
    }

    #[test]
    fn classifies_agreement() {
        let mut fusion = fusion();
        let good = fusion
            .fuse(&frame(3.0, 0), Some(17.7 * KPA_PER_PSI), 0.0, 5)
            .unwrap();
        assert_eq!(good.agreement, SensorAgreement::Good);
        let major = fusion
            .fuse(&frame(4.0, 5), Some(15.7 * KPA_PER_PSI), 0.0, 10)
            .unwrap();
        assert_eq!(major.agreement, SensorAgreement::Major);
        let none = fusion.fuse(&frame(4.0, 10), None, 0.0, 15).unwrap();
        assert_eq!(none.agreement, SensorAgreement::Unavailable);
    }
}
