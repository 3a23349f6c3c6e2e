//! Orchestration of the per-packet estimation pipeline.

use log::{info, warn};
use rtp::header::Header;
use shared::error::Result;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::aimd_rate_control::{AimdRateControl, RateControlInput};
use crate::inter_arrival::InterArrival;
use crate::overuse_detector::{BandwidthUsage, OveruseDetector};
use crate::overuse_estimator::OveruseEstimator;
use crate::probe_analyzer::{ProbeAnalyzer, ProbeResult};
use crate::rate_statistics::RateStatistics;

const TIMESTAMP_GROUP_LENGTH_MS: u64 = 5;
const ABS_SEND_TIME_FRACTION: u32 = 18;
const ABS_SEND_TIME_INTER_ARRIVAL_UPSHIFT: u32 = 8;
/// The 24-bit send time is shifted into the high bits of a 32-bit value so
/// modular arithmetic wraps correctly across the 24-bit boundary.
const INTER_ARRIVAL_SHIFT: u32 = ABS_SEND_TIME_FRACTION + ABS_SEND_TIME_INTER_ARRIVAL_UPSHIFT;
const TIMESTAMP_TO_MS: f64 = 1000.0 / (1u64 << INTER_ARRIVAL_SHIFT) as f64;
const INITIAL_PROBING_INTERVAL_MS: i64 = 2000;
/// Only packets larger than this are assumed to be paced by the sender.
const MIN_PROBE_PACKET_SIZE: usize = 200;
const STREAM_TIMEOUT_MS: i64 = 2000;
const BITRATE_WINDOW_MS: i64 = 1000;
const BITRATE_SCALE: f64 = 8000.0;

/// Marks a packet that is not part of a probe burst.
pub const NOT_A_PROBE: i32 = -1;

/// Encode a millisecond timestamp into the 24-bit 6.18 fixed-point wire
/// representation of the absolute send time.
pub fn convert_ms_to_24bits(time_ms: i64) -> u32 {
    ((((time_ms as u64) << ABS_SEND_TIME_FRACTION) + 500) / 1000) as u32 & 0x00ff_ffff
}

/// Receives every promoted target bitrate together with the active streams.
///
/// Called on the network thread, outside the estimator's critical section,
/// so implementations may call back into the estimator.
pub trait BitrateObserver {
    fn on_receive_bitrate_changed(&self, ssrcs: &[u32], bitrate_bps: u32);
}

/// Transport-feedback record with already-resolved send and arrival times.
#[derive(Debug, Clone, Copy)]
pub struct PacketInfo {
    pub arrival_time_ms: i64,
    pub send_time_ms: i64,
    pub payload_size: usize,
    pub probe_cluster_id: i32,
}

/// Builder for [`DelayBasedBwe`].
///
/// # Example
///
/// ```ignore
/// let bwe = DelayBasedBweBuilder::new()
///     .with_min_bitrate(30_000)
///     .build(observer);
/// ```
#[derive(Default)]
pub struct DelayBasedBweBuilder {
    min_bitrate_bps: Option<u32>,
}

impl DelayBasedBweBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Floor for the produced target bitrate.
    pub fn with_min_bitrate(mut self, min_bitrate_bps: u32) -> Self {
        self.min_bitrate_bps = Some(min_bitrate_bps);
        self
    }

    pub fn build(self, observer: Arc<dyn BitrateObserver + Send + Sync>) -> DelayBasedBwe {
        let mut remote_rate = AimdRateControl::new();
        if let Some(min_bitrate_bps) = self.min_bitrate_bps {
            remote_rate.set_min_bitrate(min_bitrate_bps);
        }
        info!("delay-based bandwidth estimator instantiated");
        DelayBasedBwe {
            observer,
            inner: Mutex::new(Inner {
                inter_arrival: Inner::make_inter_arrival(),
                estimator: OveruseEstimator::new(),
                detector: OveruseDetector::new(),
                incoming_bitrate: RateStatistics::new(BITRATE_WINDOW_MS, BITRATE_SCALE),
                probes: ProbeAnalyzer::new(),
                remote_rate,
                first_packet_time_ms: None,
                last_update_ms: None,
                ssrcs: BTreeMap::new(),
            }),
        }
    }
}

/// Receive-side delay-based bandwidth estimator.
///
/// The network thread feeds packets through [`Self::incoming_packet`] or
/// [`Self::incoming_packet_info`]; a configuration thread may concurrently
/// query and reconfigure. One mutex guards all estimation state; the
/// observer is always invoked with it released.
pub struct DelayBasedBwe {
    observer: Arc<dyn BitrateObserver + Send + Sync>,
    inner: Mutex<Inner>,
}

struct Inner {
    inter_arrival: InterArrival,
    estimator: OveruseEstimator,
    detector: OveruseDetector,
    incoming_bitrate: RateStatistics,
    probes: ProbeAnalyzer,
    remote_rate: AimdRateControl,
    first_packet_time_ms: Option<i64>,
    last_update_ms: Option<i64>,
    /// ssrc -> last seen, ordered so observers get a stable listing.
    ssrcs: BTreeMap<u32, i64>,
}

impl DelayBasedBwe {
    /// Feed one parsed packet. Packets without the absolute-send-time
    /// extension are dropped: the estimator cannot advance without the
    /// send-time signal.
    pub fn incoming_packet(
        &self,
        arrival_time_ms: i64,
        payload_size: usize,
        header: &Header,
        probe_cluster_id: i32,
    ) -> Result<()> {
        let Some(send_time_24bits) = header.extensions.absolute_send_time else {
            warn!("incoming packet is missing the absolute send time extension");
            return Ok(());
        };
        self.incoming_packet_info(
            arrival_time_ms,
            send_time_24bits,
            payload_size,
            header.ssrc,
            probe_cluster_id,
        )
    }

    /// Batch entry for the transport-feedback path.
    pub fn incoming_packet_feedback_vector(&self, packet_feedback: &[PacketInfo]) -> Result<()> {
        for feedback in packet_feedback {
            self.incoming_packet_info(
                feedback.arrival_time_ms,
                convert_ms_to_24bits(feedback.send_time_ms),
                feedback.payload_size,
                0,
                feedback.probe_cluster_id,
            )?;
        }
        Ok(())
    }

    /// Run the full per-packet pipeline for one arrival.
    pub fn incoming_packet_info(
        &self,
        arrival_time_ms: i64,
        send_time_24bits: u32,
        payload_size: usize,
        ssrc: u32,
        probe_cluster_id: i32,
    ) -> Result<()> {
        debug_assert!(send_time_24bits < (1 << 24));
        let timestamp = send_time_24bits << ABS_SEND_TIME_INTER_ARRIVAL_UPSHIFT;
        let send_time_ms = (timestamp as f64 * TIMESTAMP_TO_MS) as i64;
        let now_ms = arrival_time_ms;

        let mut update_estimate = false;
        let mut target_bitrate_bps = 0;
        let mut ssrcs = Vec::new();
        {
            let mut inner = self.inner.lock()?;
            inner.incoming_bitrate.update(payload_size, now_ms);
            if inner.first_packet_time_ms.is_none() {
                inner.first_packet_time_ms = Some(arrival_time_ms);
            }
            inner.timeout_streams(now_ms);
            inner.ssrcs.insert(ssrc, now_ms);

            // Probes are only examined while no estimate exists or during
            // the initial probing phase, and only for packets large enough
            // to have been paced by the sender.
            let in_initial_interval = inner
                .first_packet_time_ms
                .is_some_and(|first_ms| now_ms - first_ms < INITIAL_PROBING_INTERVAL_MS);
            if probe_cluster_id != NOT_A_PROBE
                && payload_size > MIN_PROBE_PACKET_SIZE
                && (!inner.remote_rate.valid_estimate() || in_initial_interval)
            {
                let Inner {
                    probes,
                    remote_rate,
                    ..
                } = &mut *inner;
                probes.push_probe(send_time_ms, arrival_time_ms, payload_size, probe_cluster_id);
                if let ProbeResult::BitrateUpdated(bitrate_bps) =
                    probes.process(|bps| remote_rate.is_bitrate_improving(bps))
                {
                    remote_rate.set_estimate(bitrate_bps, now_ms);
                    // A probe that moved the estimate must reach the
                    // observer immediately.
                    update_estimate = true;
                }
            }

            if let Some(deltas) =
                inner
                    .inter_arrival
                    .compute_deltas(timestamp, arrival_time_ms, payload_size)
            {
                let ts_delta_ms =
                    1000.0 * deltas.timestamp_delta as f64 / (1u64 << INTER_ARRIVAL_SHIFT) as f64;
                let prev_state = inner.detector.state();
                inner.estimator.update(
                    deltas.arrival_time_delta_ms,
                    ts_delta_ms,
                    deltas.packet_size_delta,
                    prev_state,
                );
                let offset = inner.estimator.offset();
                let num_of_deltas = inner.estimator.num_of_deltas();
                inner
                    .detector
                    .detect(offset, ts_delta_ms, num_of_deltas, arrival_time_ms);
            }

            if !update_estimate {
                // Periodic update, or an over-use severe enough to reduce
                // below the rate we are actually receiving.
                let periodic = match inner.last_update_ms {
                    None => true,
                    Some(last_ms) => now_ms - last_ms > inner.remote_rate.feedback_interval_ms(),
                };
                if periodic {
                    update_estimate = true;
                } else if inner.detector.state() == BandwidthUsage::Overusing {
                    if let Some(incoming_rate_bps) = inner.incoming_bitrate.rate(now_ms) {
                        if inner
                            .remote_rate
                            .time_to_reduce_further(now_ms, incoming_rate_bps)
                        {
                            update_estimate = true;
                        }
                    }
                }
            }

            if update_estimate {
                let input = RateControlInput {
                    bw_state: inner.detector.state(),
                    incoming_bitrate_bps: inner.incoming_bitrate.rate(now_ms),
                    noise_var: inner.estimator.var_noise(),
                };
                inner.remote_rate.update(&input, now_ms);
                target_bitrate_bps = inner.remote_rate.update_bandwidth_estimate(now_ms);
                update_estimate = inner.remote_rate.valid_estimate();
                if update_estimate {
                    inner.last_update_ms = Some(now_ms);
                    ssrcs = inner.ssrcs.keys().copied().collect();
                }
            }
        }
        if update_estimate {
            // Outside the critical section so the observer may call back
            // into the estimator.
            self.observer
                .on_receive_bitrate_changed(&ssrcs, target_bitrate_bps);
        }
        Ok(())
    }

    pub fn on_rtt_update(&self, avg_rtt_ms: i64, _max_rtt_ms: i64) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.remote_rate.set_rtt(avg_rtt_ms);
        Ok(())
    }

    pub fn remove_stream(&self, ssrc: u32) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.ssrcs.remove(&ssrc);
        Ok(())
    }

    pub fn set_min_bitrate(&self, min_bitrate_bps: u32) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.remote_rate.set_min_bitrate(min_bitrate_bps);
        Ok(())
    }

    /// Latest target bitrate together with the active streams, once an
    /// estimate exists.
    pub fn latest_estimate(&self) -> Option<(Vec<u32>, u32)> {
        let inner = self.inner.lock().ok()?;
        if !inner.remote_rate.valid_estimate() {
            return None;
        }
        let ssrcs: Vec<u32> = inner.ssrcs.keys().copied().collect();
        let bitrate_bps = if ssrcs.is_empty() {
            0
        } else {
            inner.remote_rate.latest_estimate()
        };
        Some((ssrcs, bitrate_bps))
    }

    /// Periodic poke for module schedulers. All work happens inline on
    /// packet arrival.
    pub fn process(&self) {}

    pub fn time_until_next_process(&self) -> i64 {
        const DISABLED_MODULE_TIME_MS: i64 = 1000;
        DISABLED_MODULE_TIME_MS
    }
}

impl Inner {
    fn make_inter_arrival() -> InterArrival {
        InterArrival::new(
            ((TIMESTAMP_GROUP_LENGTH_MS << INTER_ARRIVAL_SHIFT) / 1000) as u32,
            TIMESTAMP_TO_MS,
        )
    }

    /// Drop streams that have not been seen for a while. When none remain
    /// the delay estimation state is flushed, while the rate controller and
    /// its estimate deliberately survive stream churn.
    fn timeout_streams(&mut self, now_ms: i64) {
        self.ssrcs
            .retain(|_, last_seen_ms| now_ms - *last_seen_ms <= STREAM_TIMEOUT_MS);
        if self.ssrcs.is_empty() {
            self.inter_arrival = Self::make_inter_arrival();
            self.estimator = OveruseEstimator::new();
            self.detector = OveruseDetector::new();
        }
    }
}
