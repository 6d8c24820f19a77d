// The SGP40 reports a raw resistance signal in ticks that falls as VOC load
// rises. This scaler turns it into the 0-500 index the telemetry contract
// expects: 100 is baseline air, deviations push the index up. The baseline is
// a slow EMA so the index tracks changes against recent history rather than
// an absolute calibration.

const BASELINE_ALPHA: f32 = 0.002;
const TICKS_PER_INDEX_POINT: f32 = 10.0;
const INDEX_CENTER: f32 = 100.0;
const INDEX_MAX: f32 = 500.0;

#[derive(Debug, Clone)]
pub struct VocIndex {
    warmup_samples: u32,
    baseline: Option<f32>,
    samples: u32,
}

impl VocIndex {
    pub fn new(warmup_samples: u32) -> Self {
        Self {
            warmup_samples,
            baseline: None,
            samples: 0,
        }
    }

    // Returns `None` while the sensor is stabilizing or when the raw signal
    // is invalid (the SGP40 reports 0 ticks until its hotplate is ready).
    pub fn update(&mut self, raw_ticks: f32) -> Option<f32> {
        if !raw_ticks.is_finite() || raw_ticks <= 0.0 {
            return None;
        }

        let baseline = self.baseline.get_or_insert(raw_ticks);
        let index =
            (INDEX_CENTER + (*baseline - raw_ticks) / TICKS_PER_INDEX_POINT).clamp(0.0, INDEX_MAX);
        *baseline += (raw_ticks - *baseline) * BASELINE_ALPHA;

        self.samples = self.samples.saturating_add(1);
        if self.samples < self.warmup_samples {
            return None;
        }
        Some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn withholds_index_during_warmup() {
        let mut voc = VocIndex::new(3);

        assert_eq!(voc.update(30_000.0), None);
        assert_eq!(voc.update(30_000.0), None);

        let index = voc.update(30_000.0).unwrap();
        assert!((index - 100.0).abs() < 1.0);
    }

    #[test]
    fn invalid_raw_does_not_advance_warmup() {
        let mut voc = VocIndex::new(1);

        assert_eq!(voc.update(0.0), None);
        assert_eq!(voc.update(-5.0), None);
        assert_eq!(voc.update(f32::NAN), None);
        assert!(voc.update(30_000.0).is_some());
    }

    #[test]
    fn falling_raw_signal_raises_the_index() {
        let mut voc = VocIndex::new(1);
        for _ in 0..50 {
            voc.update(30_000.0);
        }

        let index = voc.update(29_000.0).unwrap();
        assert!(index > 150.0, "index was {index}");
    }

    #[test]
    fn index_recovers_toward_center_in_clean_air() {
        let mut voc = VocIndex::new(1);
        for _ in 0..50 {
            voc.update(30_000.0);
        }
        voc.update(29_000.0);

        let index = voc.update(30_000.0).unwrap();
        assert!((index - 100.0).abs() < 2.0, "index was {index}");
    }

    #[test]
    fn index_is_clamped_to_scale() {
        let mut voc = VocIndex::new(1);
        voc.update(100_000.0);

        let index = voc.update(10.0).unwrap();
        assert_eq!(index, INDEX_MAX);

        let mut voc = VocIndex::new(1);
        voc.update(10_000.0);
        let index = voc.update(80_000.0).unwrap();
        assert_eq!(index, 0.0);
    }
}
