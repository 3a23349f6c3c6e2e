//! Receive-side delay-based bandwidth estimation.
//!
//! Packets are grouped into send-time cohorts; the variation between send
//! spacing and arrival spacing is filtered by a Kalman estimator, classified
//! by an adaptive over-use detector and fed to an AIMD rate controller that
//! produces the target bitrate. Bursts of sender-paced probe packets
//! bootstrap an initial estimate before the delay signal has converged.
//!
//! The entry point is [`DelayBasedBwe`]: the network thread feeds it packets
//! and a configuration thread may query or reconfigure it concurrently.

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

mod aimd_rate_control;
mod delay_based_bwe;
mod inter_arrival;
mod overuse_detector;
mod overuse_estimator;
mod probe_analyzer;
mod rate_statistics;

pub use aimd_rate_control::{AimdRateControl, RateControlInput};
pub use delay_based_bwe::{
    convert_ms_to_24bits, BitrateObserver, DelayBasedBwe, DelayBasedBweBuilder, PacketInfo,
    NOT_A_PROBE,
};
pub use inter_arrival::{InterArrival, InterArrivalDeltas};
pub use overuse_detector::{BandwidthUsage, OveruseDetector};
pub use overuse_estimator::OveruseEstimator;
pub use probe_analyzer::{ProbeAnalyzer, ProbeResult};
pub use rate_statistics::RateStatistics;
