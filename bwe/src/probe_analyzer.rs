//! Clustering of sender-paced probe packets into an initial bitrate.

use log::info;
use std::collections::VecDeque;

const MIN_CLUSTER_SIZE: usize = 4;
const MAX_PROBE_PACKETS: usize = 15;
const EXPECTED_NUMBER_OF_PROBES: usize = 3;

#[derive(Debug, Clone, Copy)]
struct Probe {
    send_time_ms: i64,
    recv_time_ms: i64,
    payload_size: usize,
    cluster_id: i32,
}

#[derive(Debug, Default, Clone, Copy)]
struct Cluster {
    send_mean_ms: f64,
    recv_mean_ms: f64,
    mean_size: usize,
    count: usize,
    num_above_min_delta: usize,
}

impl Cluster {
    fn send_bitrate_bps(&self) -> f64 {
        self.mean_size as f64 * 8.0 * 1000.0 / self.send_mean_ms
    }

    fn recv_bitrate_bps(&self) -> f64 {
        self.mean_size as f64 * 8.0 * 1000.0 / self.recv_mean_ms
    }
}

/// Result of scanning the recorded probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    BitrateUpdated(u32),
    NoUpdate,
}

/// Collects probe packets and derives a bitrate from the best cluster.
///
/// Probes arrive as sender-paced bursts labeled with a cluster id; a
/// cluster only counts once it has enough packets with measurable pacing,
/// and a cluster received meaningfully slower than it was sent means the
/// probe overshot the link.
#[derive(Default)]
pub struct ProbeAnalyzer {
    probes: VecDeque<Probe>,
    total_probes_received: usize,
}

impl ProbeAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one probe packet.
    pub fn push_probe(
        &mut self,
        send_time_ms: i64,
        recv_time_ms: i64,
        payload_size: usize,
        cluster_id: i32,
    ) {
        if self.total_probes_received < MAX_PROBE_PACKETS {
            let (send_delta_ms, recv_delta_ms) = match self.probes.back() {
                Some(last) => (
                    send_time_ms - last.send_time_ms,
                    recv_time_ms - last.recv_time_ms,
                ),
                None => (-1, -1),
            };
            info!(
                "Probe packet received: send time={send_time_ms} ms, recv time={recv_time_ms} ms, \
                 send delta={send_delta_ms} ms, recv delta={recv_delta_ms} ms"
            );
        }
        self.total_probes_received += 1;
        self.probes.push_back(Probe {
            send_time_ms,
            recv_time_ms,
            payload_size,
            cluster_id,
        });
    }

    /// Scan the recorded probes. `is_improving` decides whether the best
    /// cluster's bitrate may replace the current estimate.
    pub fn process(&mut self, is_improving: impl FnOnce(u32) -> bool) -> ProbeResult {
        let clusters = self.compute_clusters();
        if clusters.is_empty() {
            // At the cap with nothing usable, make room for fresh probes.
            if self.probes.len() >= MAX_PROBE_PACKETS {
                self.probes.pop_front();
            }
            return ProbeResult::NoUpdate;
        }

        if let Some(best) = find_best_probe(&clusters) {
            let probe_bitrate_bps = best.send_bitrate_bps().min(best.recv_bitrate_bps()) as u32;
            if is_improving(probe_bitrate_bps) {
                info!(
                    "Probe successful, sent at {} bps, received at {} bps. Mean send delta: {} ms, \
                     mean recv delta: {} ms, num probes: {}",
                    best.send_bitrate_bps(),
                    best.recv_bitrate_bps(),
                    best.send_mean_ms,
                    best.recv_mean_ms,
                    best.count
                );
                return ProbeResult::BitrateUpdated(probe_bitrate_bps);
            }
        }

        // Finished with the current set of probes.
        if clusters.len() >= EXPECTED_NUMBER_OF_PROBES {
            self.probes.clear();
        }
        ProbeResult::NoUpdate
    }

    /// Partition the probe list into maximal runs sharing a cluster id and
    /// accumulate per-cluster pacing statistics.
    fn compute_clusters(&self) -> Vec<Cluster> {
        let mut clusters = Vec::new();
        let mut current = Cluster::default();
        let mut prev_probe: Option<Probe> = None;
        let mut last_cluster_id: Option<i32> = None;
        for probe in &self.probes {
            let last_id = *last_cluster_id.get_or_insert(probe.cluster_id);
            if let Some(prev) = prev_probe {
                let send_delta_ms = probe.send_time_ms - prev.send_time_ms;
                let recv_delta_ms = probe.recv_time_ms - prev.recv_time_ms;
                if send_delta_ms >= 1 && recv_delta_ms >= 1 {
                    current.num_above_min_delta += 1;
                }
                if probe.cluster_id != last_id {
                    if current.count >= MIN_CLUSTER_SIZE {
                        clusters.push(finish_cluster(current));
                    }
                    current = Cluster::default();
                }
                current.send_mean_ms += send_delta_ms as f64;
                current.recv_mean_ms += recv_delta_ms as f64;
                current.mean_size += probe.payload_size;
                current.count += 1;
                last_cluster_id = Some(probe.cluster_id);
            }
            prev_probe = Some(*probe);
        }
        if current.count >= MIN_CLUSTER_SIZE {
            clusters.push(finish_cluster(current));
        }
        clusters
    }
}

fn finish_cluster(mut cluster: Cluster) -> Cluster {
    cluster.send_mean_ms /= cluster.count as f64;
    cluster.recv_mean_ms /= cluster.count as f64;
    cluster.mean_size /= cluster.count;
    cluster
}

/// Pick the valid cluster with the highest usable bitrate. Scanning halts
/// at the first invalid cluster: with pipelined probes a failed burst means
/// later bursts were paced against a congested link.
fn find_best_probe(clusters: &[Cluster]) -> Option<&Cluster> {
    let mut highest_probe_bitrate_bps = 0.0f64;
    let mut best = None;
    for cluster in clusters {
        if cluster.send_mean_ms == 0.0 || cluster.recv_mean_ms == 0.0 {
            continue;
        }
        if cluster.num_above_min_delta > cluster.count / 2
            && cluster.recv_mean_ms - cluster.send_mean_ms <= 2.0
            && cluster.send_mean_ms - cluster.recv_mean_ms <= 5.0
        {
            let probe_bitrate_bps = cluster.send_bitrate_bps().min(cluster.recv_bitrate_bps());
            if probe_bitrate_bps > highest_probe_bitrate_bps {
                highest_probe_bitrate_bps = probe_bitrate_bps;
                best = Some(cluster);
            }
        } else {
            info!(
                "Probe failed, sent at {} bps, received at {} bps. Mean send delta: {} ms, \
                 mean recv delta: {} ms, num probes: {}",
                cluster.send_bitrate_bps(),
                cluster.recv_bitrate_bps(),
                cluster.send_mean_ms,
                cluster.recv_mean_ms,
                cluster.count
            );
            break;
        }
    }
    best
}
