//! Additive-increase/multiplicative-decrease control of the target bitrate.

use crate::overuse_detector::BandwidthUsage;

const DEFAULT_RTT_MS: i64 = 200;
const MIN_CONFIGURED_BITRATE_BPS: u32 = 10_000;
const MAX_CONFIGURED_BITRATE_BPS: u32 = 30_000_000;
/// The first estimate is seeded from the measured throughput once it has
/// been observed for this long.
const INITIALIZATION_TIME_MS: i64 = 3_000;
const RTCP_SIZE_BYTES: f64 = 80.0;
const MIN_FEEDBACK_INTERVAL_MS: i64 = 200;
const MAX_FEEDBACK_INTERVAL_MS: i64 = 1000;
const BETA: f64 = 0.85;

/// Input to one rate-control update.
#[derive(Debug, Clone, Copy)]
pub struct RateControlInput {
    pub bw_state: BandwidthUsage,
    pub incoming_bitrate_bps: Option<u32>,
    pub noise_var: f64,
}

impl Default for RateControlInput {
    fn default() -> Self {
        Self {
            bw_state: BandwidthUsage::Normal,
            incoming_bitrate_bps: None,
            noise_var: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RateControlState {
    Hold,
    Increase,
    Decrease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RateControlRegion {
    /// Operating close to a previously observed stable throughput; grow
    /// additively.
    NearMax,
    /// The link capacity is unknown; grow multiplicatively to discover it.
    MaxUnknown,
}

/// Rate controller driven by the over-use detector state.
///
/// Over-use drops the estimate below the measured incoming rate and records
/// that rate as the nearest known stable point; while the measured rate
/// stays within three standard deviations of that point the controller
/// grows additively, otherwise multiplicatively.
pub struct AimdRateControl {
    min_configured_bitrate_bps: u32,
    max_configured_bitrate_bps: u32,
    current_bitrate_bps: u32,
    avg_max_bitrate_kbps: Option<f64>,
    var_max_bitrate_kbps: f64,
    state: RateControlState,
    region: RateControlRegion,
    time_last_bitrate_change_ms: Option<i64>,
    current_input: RateControlInput,
    updated: bool,
    time_first_incoming_estimate_ms: Option<i64>,
    bitrate_is_initialized: bool,
    beta: f64,
    rtt_ms: i64,
}

impl Default for AimdRateControl {
    fn default() -> Self {
        Self {
            min_configured_bitrate_bps: MIN_CONFIGURED_BITRATE_BPS,
            max_configured_bitrate_bps: MAX_CONFIGURED_BITRATE_BPS,
            current_bitrate_bps: MAX_CONFIGURED_BITRATE_BPS,
            avg_max_bitrate_kbps: None,
            var_max_bitrate_kbps: 0.4,
            state: RateControlState::Hold,
            region: RateControlRegion::MaxUnknown,
            time_last_bitrate_change_ms: None,
            current_input: RateControlInput::default(),
            updated: false,
            time_first_incoming_estimate_ms: None,
            bitrate_is_initialized: false,
            beta: BETA,
            rtt_ms: DEFAULT_RTT_MS,
        }
    }
}

impl AimdRateControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the estimate has been initialized, either from the
    /// measured throughput, a probe or an over-use reduction.
    pub fn valid_estimate(&self) -> bool {
        self.bitrate_is_initialized
    }

    pub fn latest_estimate(&self) -> u32 {
        self.current_bitrate_bps
    }

    pub fn set_rtt(&mut self, rtt_ms: i64) {
        self.rtt_ms = rtt_ms;
    }

    pub fn set_min_bitrate(&mut self, min_bitrate_bps: u32) {
        self.min_configured_bitrate_bps = min_bitrate_bps;
        self.current_bitrate_bps = self.current_bitrate_bps.max(min_bitrate_bps);
    }

    /// How often feedback can be sent if it may use up to 5% of the target
    /// bitrate, assuming 80-byte reports.
    pub fn feedback_interval_ms(&self) -> i64 {
        let interval = (RTCP_SIZE_BYTES * 8.0 * 1000.0 / (0.05 * self.current_bitrate_bps as f64)
            + 0.5) as i64;
        interval.clamp(MIN_FEEDBACK_INTERVAL_MS, MAX_FEEDBACK_INTERVAL_MS)
    }

    /// Whether the estimate should be reduced again while still over-using:
    /// either it has not changed for an RTT, or the measured throughput has
    /// fallen to less than half of it.
    pub fn time_to_reduce_further(&self, now_ms: i64, incoming_bitrate_bps: u32) -> bool {
        let reduction_interval_ms = self.rtt_ms.clamp(10, 200);
        if let Some(last_ms) = self.time_last_bitrate_change_ms {
            if now_ms - last_ms >= reduction_interval_ms {
                return true;
            }
        }
        if self.valid_estimate() {
            return incoming_bitrate_bps < self.latest_estimate() / 2;
        }
        false
    }

    /// Replace the estimate, e.g. from a successful probe cluster.
    pub fn set_estimate(&mut self, bitrate_bps: u32, now_ms: i64) {
        self.updated = true;
        self.bitrate_is_initialized = true;
        self.current_bitrate_bps = self.clamp_bitrate(bitrate_bps, bitrate_bps);
        self.time_last_bitrate_change_ms = Some(now_ms);
    }

    /// A probe can only raise the estimate, never lower it.
    pub fn is_bitrate_improving(&self, new_bitrate_bps: u32) -> bool {
        let initial_probe = !self.valid_estimate() && new_bitrate_bps > 0;
        let above_estimate = self.valid_estimate() && new_bitrate_bps > self.latest_estimate();
        initial_probe || above_estimate
    }

    /// Record one detector/throughput observation. The estimate itself only
    /// moves in [`update_bandwidth_estimate`](Self::update_bandwidth_estimate).
    pub fn update(&mut self, input: &RateControlInput, now_ms: i64) {
        if !self.bitrate_is_initialized {
            if let Some(incoming_bitrate_bps) = input.incoming_bitrate_bps {
                match self.time_first_incoming_estimate_ms {
                    None => self.time_first_incoming_estimate_ms = Some(now_ms),
                    Some(first_ms) if now_ms - first_ms > INITIALIZATION_TIME_MS => {
                        self.current_bitrate_bps = incoming_bitrate_bps;
                        self.bitrate_is_initialized = true;
                    }
                    Some(_) => {}
                }
            }
        }
        if self.updated && self.current_input.bw_state == BandwidthUsage::Overusing {
            // Only refresh the rate and noise so a pending over-use still
            // gets acted on.
            self.current_input.incoming_bitrate_bps = input.incoming_bitrate_bps;
            self.current_input.noise_var = input.noise_var;
        } else {
            self.updated = true;
            self.current_input = *input;
        }
    }

    /// Apply the most recent input and return the new target bitrate.
    pub fn update_bandwidth_estimate(&mut self, now_ms: i64) -> u32 {
        self.change_bitrate(self.current_input, now_ms);
        self.current_bitrate_bps
    }

    fn change_bitrate(&mut self, input: RateControlInput, now_ms: i64) {
        if !self.updated {
            return;
        }
        self.updated = false;
        // An over-use always triggers a reduction, even before the first
        // estimate has been established; acting on it produces one.
        if !self.bitrate_is_initialized && input.bw_state != BandwidthUsage::Overusing {
            return;
        }
        self.change_state(&input, now_ms);

        let incoming_bitrate_bps = input
            .incoming_bitrate_bps
            .unwrap_or(self.current_bitrate_bps);
        let incoming_bitrate_kbps = incoming_bitrate_bps as f64 / 1000.0;
        let mut new_bitrate_bps = self.current_bitrate_bps;

        match self.state {
            RateControlState::Hold => {}
            RateControlState::Increase => {
                if let Some(avg_max_kbps) = self.avg_max_bitrate_kbps {
                    let std_max_bitrate = (self.var_max_bitrate_kbps * avg_max_kbps).sqrt();
                    if incoming_bitrate_kbps > avg_max_kbps + 3.0 * std_max_bitrate {
                        // The measured throughput left the known stable
                        // region.
                        self.region = RateControlRegion::MaxUnknown;
                        self.avg_max_bitrate_kbps = None;
                    }
                }
                let increase_bps = match self.region {
                    RateControlRegion::NearMax => self.additive_rate_increase(now_ms),
                    RateControlRegion::MaxUnknown => {
                        self.multiplicative_rate_increase(now_ms, new_bitrate_bps)
                    }
                };
                new_bitrate_bps = new_bitrate_bps.saturating_add(increase_bps);
                self.time_last_bitrate_change_ms = Some(now_ms);
            }
            RateControlState::Decrease => {
                self.bitrate_is_initialized = true;
                // Slightly below the measured throughput, to drain
                // self-induced queues.
                new_bitrate_bps = (self.beta * incoming_bitrate_bps as f64 + 0.5) as u32;
                if new_bitrate_bps > self.current_bitrate_bps {
                    if self.region != RateControlRegion::MaxUnknown {
                        if let Some(avg_max_kbps) = self.avg_max_bitrate_kbps {
                            new_bitrate_bps = (self.beta * avg_max_kbps * 1000.0 + 0.5) as u32;
                        }
                    }
                    // Avoid raising the rate while over-using.
                    new_bitrate_bps = new_bitrate_bps.min(self.current_bitrate_bps);
                }
                self.region = RateControlRegion::NearMax;
                if let Some(avg_max_kbps) = self.avg_max_bitrate_kbps {
                    let std_max_bitrate = (self.var_max_bitrate_kbps * avg_max_kbps).sqrt();
                    if incoming_bitrate_kbps < avg_max_kbps - 3.0 * std_max_bitrate {
                        self.avg_max_bitrate_kbps = None;
                    }
                }
                self.update_max_bitrate_estimate(incoming_bitrate_kbps);
                // Stay on hold until the pipes are cleared.
                self.state = RateControlState::Hold;
                self.time_last_bitrate_change_ms = Some(now_ms);
            }
        }
        self.current_bitrate_bps = self.clamp_bitrate(new_bitrate_bps, incoming_bitrate_bps);
    }

    fn change_state(&mut self, input: &RateControlInput, now_ms: i64) {
        match input.bw_state {
            BandwidthUsage::Normal => {
                if self.state == RateControlState::Hold {
                    self.time_last_bitrate_change_ms = Some(now_ms);
                    self.state = RateControlState::Increase;
                }
            }
            BandwidthUsage::Overusing => {
                if self.state != RateControlState::Decrease {
                    self.state = RateControlState::Decrease;
                }
            }
            BandwidthUsage::Underusing => {
                self.state = RateControlState::Hold;
            }
        }
    }

    fn clamp_bitrate(&self, mut new_bitrate_bps: u32, incoming_bitrate_bps: u32) -> u32 {
        // Don't grow far beyond what is actually arriving.
        let max_bitrate_bps = incoming_bitrate_bps.saturating_mul(3) / 2 + 10_000;
        if new_bitrate_bps > self.current_bitrate_bps && new_bitrate_bps > max_bitrate_bps {
            new_bitrate_bps = self.current_bitrate_bps.max(max_bitrate_bps);
        }
        new_bitrate_bps.clamp(
            self.min_configured_bitrate_bps,
            self.max_configured_bitrate_bps,
        )
    }

    /// 5% growth per second, compounded over the elapsed interval, with a
    /// 1 kbps floor.
    fn multiplicative_rate_increase(&self, now_ms: i64, current_bitrate_bps: u32) -> u32 {
        let mut alpha = 1.05f64;
        if let Some(last_ms) = self.time_last_bitrate_change_ms {
            let time_since_last_update_ms = (now_ms - last_ms).min(1000);
            alpha = alpha.powf(time_since_last_update_ms as f64 / 1000.0);
        }
        (current_bitrate_bps as f64 * (alpha - 1.0)).max(1000.0) as u32
    }

    fn additive_rate_increase(&self, now_ms: i64) -> u32 {
        let Some(last_ms) = self.time_last_bitrate_change_ms else {
            return 0;
        };
        ((now_ms - last_ms) as f64 * self.near_max_increase_rate_bps_per_second() / 1000.0) as u32
    }

    /// Roughly one average packet per response time: a frame at 30 fps is
    /// split into 1200-byte packets and the growth is paced by the RTT plus
    /// the estimator delay.
    fn near_max_increase_rate_bps_per_second(&self) -> f64 {
        let bits_per_frame = self.current_bitrate_bps as f64 / 30.0;
        let packets_per_frame = (bits_per_frame / (8.0 * 1200.0)).ceil().max(1.0);
        let avg_packet_size_bits = bits_per_frame / packets_per_frame;
        let response_time_ms = (self.rtt_ms + 100) as f64;
        (avg_packet_size_bits * 1000.0 / response_time_ms).max(1000.0)
    }

    fn update_max_bitrate_estimate(&mut self, incoming_bitrate_kbps: f64) {
        const ALPHA: f64 = 0.05;
        let avg_max_kbps = match self.avg_max_bitrate_kbps {
            None => incoming_bitrate_kbps,
            Some(avg) => (1.0 - ALPHA) * avg + ALPHA * incoming_bitrate_kbps,
        };
        // Normalize the variance with the average max bitrate;
        // 0.4 ~= 14 kbit/s and 2.5 ~= 35 kbit/s of standard deviation at
        // 500 kbit/s.
        let norm = avg_max_kbps.max(1.0);
        self.var_max_bitrate_kbps = ((1.0 - ALPHA) * self.var_max_bitrate_kbps
            + ALPHA * (avg_max_kbps - incoming_bitrate_kbps).powi(2) / norm)
            .clamp(0.4, 2.5);
        self.avg_max_bitrate_kbps = Some(avg_max_kbps);
    }
}
