//! Classification of the link state from the filtered delay offset.

/// Hypothesis about the current usage of the bottleneck link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandwidthUsage {
    Normal,
    Underusing,
    Overusing,
}

/// Adaptation is skipped when the offset exceeds the threshold by more than
/// this, so single latency spikes do not drag the threshold up.
const MAX_ADAPT_OFFSET_MS: f64 = 15.0;
const OVER_USING_TIME_THRESHOLD_MS: f64 = 10.0;
/// The offset is scaled by the number of fused deltas, capped here.
const MIN_NUM_DELTAS: usize = 60;
const MAX_TIME_DELTA_MS: i64 = 100;
/// Adaptation gains. The threshold rises faster than it decays so a
/// sustained offset widens the dead zone quickly while recovery is gradual.
const K_UP: f64 = 0.039;
const K_DOWN: f64 = 0.0087;

/// State machine that declares over-use only after the offset has stayed
/// above an adaptive threshold for long enough and is still growing.
pub struct OveruseDetector {
    threshold: f64,
    last_update_ms: Option<i64>,
    prev_offset: f64,
    time_over_using: Option<f64>,
    overuse_counter: usize,
    hypothesis: BandwidthUsage,
}

impl Default for OveruseDetector {
    fn default() -> Self {
        Self {
            threshold: 12.5,
            last_update_ms: None,
            prev_offset: 0.0,
            time_over_using: None,
            overuse_counter: 0,
            hypothesis: BandwidthUsage::Normal,
        }
    }
}

impl OveruseDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> BandwidthUsage {
        self.hypothesis
    }

    /// Current adaptive threshold, clamped to [6, 600].
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Classify the link state from the latest offset sample.
    pub fn detect(
        &mut self,
        offset: f64,
        ts_delta_ms: f64,
        num_of_deltas: usize,
        now_ms: i64,
    ) -> BandwidthUsage {
        if num_of_deltas < 2 {
            return BandwidthUsage::Normal;
        }
        let t = num_of_deltas.min(MIN_NUM_DELTAS) as f64 * offset;
        if t > self.threshold {
            let time_over_using = match self.time_over_using {
                // Assume over-use started in the middle of the previous
                // group interval.
                None => ts_delta_ms / 2.0,
                Some(acc) => acc + ts_delta_ms,
            };
            self.time_over_using = Some(time_over_using);
            self.overuse_counter += 1;
            if time_over_using > OVER_USING_TIME_THRESHOLD_MS
                && self.overuse_counter >= 1
                && offset >= self.prev_offset
            {
                self.time_over_using = Some(0.0);
                self.overuse_counter = 0;
                self.hypothesis = BandwidthUsage::Overusing;
            }
        } else if t < -self.threshold {
            self.time_over_using = None;
            self.overuse_counter = 0;
            self.hypothesis = BandwidthUsage::Underusing;
        } else {
            self.time_over_using = None;
            self.overuse_counter = 0;
            self.hypothesis = BandwidthUsage::Normal;
        }
        self.prev_offset = offset;
        self.update_threshold(t, now_ms);
        self.hypothesis
    }

    fn update_threshold(&mut self, modified_offset: f64, now_ms: i64) {
        if modified_offset.abs() > self.threshold + MAX_ADAPT_OFFSET_MS {
            self.last_update_ms = Some(now_ms);
            return;
        }
        let k = if modified_offset.abs() < self.threshold {
            K_DOWN
        } else {
            K_UP
        };
        let last_update_ms = self.last_update_ms.unwrap_or(now_ms);
        let time_delta_ms = (now_ms - last_update_ms).min(MAX_TIME_DELTA_MS);
        self.threshold += k * (modified_offset.abs() - self.threshold) * time_delta_ms as f64;
        self.threshold = self.threshold.clamp(6.0, 600.0);
        self.last_update_ms = Some(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_with_too_few_deltas() {
        let mut detector = OveruseDetector::new();
        assert_eq!(detector.detect(100.0, 20.0, 1, 0), BandwidthUsage::Normal);
        assert_eq!(detector.state(), BandwidthUsage::Normal);
    }

    #[test]
    fn test_sustained_growing_offset_declares_overuse() {
        let mut detector = OveruseDetector::new();
        let mut now_ms = 0;
        let mut offset = 0.3;
        let mut overuse_at = None;
        for i in 0..20 {
            offset += 0.1;
            if detector.detect(offset, 20.0, 60, now_ms) == BandwidthUsage::Overusing {
                overuse_at = Some(i);
                break;
            }
            now_ms += 20;
        }
        // T exceeds the initial threshold from the first sample; over-use
        // needs the time-in-state condition on top.
        assert!(overuse_at.is_some());
        assert!(overuse_at.unwrap() >= 1);
    }

    #[test]
    fn test_shrinking_offset_does_not_declare_overuse() {
        let mut detector = OveruseDetector::new();
        // Above the threshold but falling: the declaration requires the
        // offset to still be growing.
        detector.detect(1.0, 20.0, 60, 0);
        let state = detector.detect(0.5, 20.0, 60, 20);
        assert_ne!(state, BandwidthUsage::Overusing);
    }

    #[test]
    fn test_negative_offset_declares_underuse() {
        let mut detector = OveruseDetector::new();
        assert_eq!(
            detector.detect(-1.0, 20.0, 60, 0),
            BandwidthUsage::Underusing
        );
    }

    #[test]
    fn test_small_offset_is_normal() {
        let mut detector = OveruseDetector::new();
        assert_eq!(detector.detect(0.05, 20.0, 60, 0), BandwidthUsage::Normal);
    }

    #[test]
    fn test_threshold_stays_within_bounds() {
        let mut detector = OveruseDetector::new();
        let mut now_ms = 0;
        // Alternate huge and tiny offsets; the threshold must stay clamped.
        for i in 0..1000 {
            let offset = if i % 2 == 0 { 100.0 } else { 0.0 };
            detector.detect(offset, 5.0, 60, now_ms);
            let threshold = detector.threshold();
            assert!((6.0..=600.0).contains(&threshold));
            now_ms += 5;
        }
        for _ in 0..10_000 {
            detector.detect(0.0, 5.0, 60, now_ms);
            assert!(detector.threshold() >= 6.0);
            now_ms += 5;
        }
    }

    #[test]
    fn test_threshold_decays_toward_small_offsets() {
        let mut detector = OveruseDetector::new();
        let initial = detector.threshold();
        let mut now_ms = 0;
        for _ in 0..100 {
            detector.detect(0.0, 20.0, 60, now_ms);
            now_ms += 20;
        }
        assert!(detector.threshold() < initial);
    }

    #[test]
    fn test_threshold_rises_on_offsets_above_it() {
        let mut detector = OveruseDetector::new();
        let initial = detector.threshold();
        // T = 60 * 0.3 = 18, above the initial threshold of 12.5 but within
        // the adaptation window.
        detector.detect(0.3, 20.0, 60, 0);
        detector.detect(0.3, 20.0, 60, 20);
        assert!(detector.threshold() > initial);
    }

    #[test]
    fn test_spike_does_not_adapt_threshold() {
        let mut detector = OveruseDetector::new();
        let initial = detector.threshold();
        // T = 600, far beyond threshold + 15: adaptation must be skipped.
        detector.detect(10.0, 20.0, 60, 0);
        assert_eq!(detector.threshold(), initial);
    }
}
