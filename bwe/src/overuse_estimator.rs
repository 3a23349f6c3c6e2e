//! Kalman-filter estimation of the one-way delay variation.

use std::collections::VecDeque;

use crate::overuse_detector::BandwidthUsage;

const DELTA_COUNTER_MAX: usize = 1000;
const MIN_FRAME_PERIOD_HISTORY_LENGTH: usize = 60;
/// Scale applied to the measurement noise while the detector reports
/// over-use, making the filter less reactive during loss events.
const OVER_USE_NOISE_SCALE: f64 = 10.0;
const VAR_NOISE_FLOOR: f64 = 1.0;

/// Two-state Kalman filter over the delay signal.
///
/// The state vector is (slope, offset): the slope captures link-capacity
/// effects through the group size delta, the offset is the smoothed one-way
/// delay variation. A positive offset means queueing is building up.
pub struct OveruseEstimator {
    num_of_deltas: usize,
    slope: f64,
    offset: f64,
    e: [[f64; 2]; 2],
    process_noise: [f64; 2],
    avg_noise: f64,
    var_noise: f64,
    ts_delta_hist: VecDeque<f64>,
}

impl Default for OveruseEstimator {
    fn default() -> Self {
        Self {
            num_of_deltas: 0,
            slope: 8.0 / 512.0,
            offset: 0.0,
            e: [[100.0, 0.0], [0.0, 0.1]],
            process_noise: [1e-13, 1e-3],
            avg_noise: 0.0,
            var_noise: 50.0,
            ts_delta_hist: VecDeque::new(),
        }
    }
}

impl OveruseEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fuse one measurement. `t_delta_ms` is the arrival-time delta,
    /// `ts_delta_ms` the send-time delta and `size_delta` the size delta of
    /// the latest completed group pair.
    pub fn update(
        &mut self,
        t_delta_ms: i64,
        ts_delta_ms: f64,
        size_delta: i64,
        current_hypothesis: BandwidthUsage,
    ) {
        let min_frame_period = self.update_min_frame_period(ts_delta_ms);
        let t_ts_delta = t_delta_ms as f64 - ts_delta_ms;

        self.num_of_deltas = (self.num_of_deltas + 1).min(DELTA_COUNTER_MAX);

        // Predict: the state persists, the process noise widens the
        // covariance.
        self.e[0][0] += self.process_noise[0];
        self.e[1][1] += self.process_noise[1];

        let h = [size_delta as f64, 1.0];
        let eh = [
            self.e[0][0] * h[0] + self.e[0][1] * h[1],
            self.e[1][0] * h[0] + self.e[1][1] * h[1],
        ];
        let residual = t_ts_delta - self.slope * h[0] - self.offset;

        // Periodic large frames do not fit the Gaussian model; the residual
        // fed to the noise estimate is capped at three standard deviations.
        let max_residual = 3.0 * self.var_noise.sqrt();
        self.update_noise_estimate(
            residual.clamp(-max_residual, max_residual),
            min_frame_period,
            current_hypothesis == BandwidthUsage::Normal,
        );

        let measurement_var = if current_hypothesis == BandwidthUsage::Overusing {
            self.var_noise * OVER_USE_NOISE_SCALE
        } else {
            self.var_noise
        };
        let denom = measurement_var + h[0] * eh[0] + h[1] * eh[1];
        let k = [eh[0] / denom, eh[1] / denom];

        let ikh = [
            [1.0 - k[0] * h[0], -k[0] * h[1]],
            [-k[1] * h[0], 1.0 - k[1] * h[1]],
        ];
        let e00 = self.e[0][0];
        let e01 = self.e[0][1];
        self.e[0][0] = e00 * ikh[0][0] + self.e[1][0] * ikh[0][1];
        self.e[0][1] = e01 * ikh[0][0] + self.e[1][1] * ikh[0][1];
        self.e[1][0] = e00 * ikh[1][0] + self.e[1][0] * ikh[1][1];
        self.e[1][1] = e01 * ikh[1][0] + self.e[1][1] * ikh[1][1];

        self.slope += k[0] * residual;
        self.offset += k[1] * residual;
    }

    /// Smoothed one-way delay variation in milliseconds.
    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn var_noise(&self) -> f64 {
        self.var_noise
    }

    /// Measurements fused since the last reset.
    pub fn num_of_deltas(&self) -> usize {
        self.num_of_deltas
    }

    fn update_min_frame_period(&mut self, ts_delta_ms: f64) -> f64 {
        if self.ts_delta_hist.len() >= MIN_FRAME_PERIOD_HISTORY_LENGTH {
            self.ts_delta_hist.pop_front();
        }
        let mut min_frame_period = ts_delta_ms;
        for &old_ts_delta in &self.ts_delta_hist {
            min_frame_period = min_frame_period.min(old_ts_delta);
        }
        self.ts_delta_hist.push_back(ts_delta_ms);
        min_frame_period
    }

    fn update_noise_estimate(&mut self, residual: f64, ts_delta_ms: f64, stable_state: bool) {
        if !stable_state {
            return;
        }
        // Faster smoothing during startup adapts quicker to the jitter
        // level of the path. `alpha` is tuned for 30 samples per second and
        // rescaled by the observed delta.
        let alpha: f64 = if self.num_of_deltas > 10 * 30 {
            0.002
        } else {
            0.01
        };
        let beta = (1.0 - alpha).powf(ts_delta_ms * 30.0 / 1000.0);
        self.avg_noise = beta * self.avg_noise + (1.0 - beta) * residual;
        self.var_noise =
            beta * self.var_noise + (1.0 - beta) * (self.avg_noise - residual).powi(2);
        if self.var_noise < VAR_NOISE_FLOOR {
            self.var_noise = VAR_NOISE_FLOOR;
        }
    }
}
