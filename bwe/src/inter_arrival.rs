//! Grouping of packets into send-time cohorts and computation of
//! inter-group deltas.

/// Two packets arriving at most this close together may belong to the same
/// coalesced burst.
const BURST_DELTA_THRESHOLD_MS: i64 = 5;

/// Deltas between the two most recently completed timestamp groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterArrivalDeltas {
    /// Send-time delta in the (shifted) timestamp domain.
    pub timestamp_delta: u32,
    pub arrival_time_delta_ms: i64,
    pub packet_size_delta: i64,
}

#[derive(Debug, Clone, Copy)]
struct TimestampGroup {
    size: usize,
    first_timestamp: u32,
    timestamp: u32,
    complete_time_ms: i64,
}

impl TimestampGroup {
    fn start(timestamp: u32) -> Self {
        Self {
            size: 0,
            first_timestamp: timestamp,
            timestamp,
            complete_time_ms: 0,
        }
    }
}

/// Groups packets by send timestamp and reports the deltas between
/// completed group pairs.
///
/// Timestamps are 32-bit values with a caller-defined rate; wraparound is
/// handled with modular arithmetic. A group holds all packets whose
/// timestamp is at most `timestamp_group_length_ticks` newer than the
/// group's first timestamp.
pub struct InterArrival {
    timestamp_group_length_ticks: u32,
    timestamp_to_ms_coeff: f64,
    current_group: Option<TimestampGroup>,
    prev_group: Option<TimestampGroup>,
}

impl InterArrival {
    pub fn new(timestamp_group_length_ticks: u32, timestamp_to_ms_coeff: f64) -> Self {
        Self {
            timestamp_group_length_ticks,
            timestamp_to_ms_coeff,
            current_group: None,
            prev_group: None,
        }
    }

    /// Feed one packet. Returns the deltas of the previous group pair when
    /// this packet starts a new group; reordered packets are discarded and
    /// never produce deltas.
    pub fn compute_deltas(
        &mut self,
        timestamp: u32,
        arrival_time_ms: i64,
        packet_size: usize,
    ) -> Option<InterArrivalDeltas> {
        let mut deltas = None;

        match self.current_group {
            None => {
                // Not enough data; store until a group pair can complete.
                self.current_group = Some(TimestampGroup::start(timestamp));
            }
            Some(current) => {
                if !packet_in_order(current.first_timestamp, timestamp) {
                    return None;
                }
                if self.new_timestamp_group(&current, arrival_time_ms, timestamp) {
                    // First packet of a later group; the pair formed by the
                    // two previous groups is ready.
                    if let Some(prev) = self.prev_group {
                        deltas = Some(InterArrivalDeltas {
                            timestamp_delta: current.timestamp.wrapping_sub(prev.timestamp),
                            arrival_time_delta_ms: current.complete_time_ms
                                - prev.complete_time_ms,
                            packet_size_delta: current.size as i64 - prev.size as i64,
                        });
                    }
                    self.prev_group = Some(current);
                    self.current_group = Some(TimestampGroup::start(timestamp));
                } else if let Some(current) = self.current_group.as_mut() {
                    current.timestamp = latest_timestamp(current.timestamp, timestamp);
                }
            }
        }

        if let Some(current) = self.current_group.as_mut() {
            current.size += packet_size;
            current.complete_time_ms = arrival_time_ms;
        }
        deltas
    }

    fn new_timestamp_group(
        &self,
        current: &TimestampGroup,
        arrival_time_ms: i64,
        timestamp: u32,
    ) -> bool {
        if self.belongs_to_burst(current, arrival_time_ms, timestamp) {
            return false;
        }
        timestamp.wrapping_sub(current.first_timestamp) > self.timestamp_group_length_ticks
    }

    /// Packets sent close together may be coalesced on the path and arrive
    /// back to back; treating them as a new group would produce spurious
    /// negative delay samples.
    fn belongs_to_burst(
        &self,
        current: &TimestampGroup,
        arrival_time_ms: i64,
        timestamp: u32,
    ) -> bool {
        let arrival_time_delta_ms = arrival_time_ms - current.complete_time_ms;
        let timestamp_diff = timestamp.wrapping_sub(current.timestamp);
        let ts_delta_ms = (self.timestamp_to_ms_coeff * timestamp_diff as f64 + 0.5) as i64;
        if ts_delta_ms == 0 {
            return true;
        }
        let propagation_delta_ms = arrival_time_delta_ms - ts_delta_ms;
        propagation_delta_ms < 0 && arrival_time_delta_ms <= BURST_DELTA_THRESHOLD_MS
    }
}

/// A diff larger than half the timestamp range must be due to reordering.
fn packet_in_order(first_timestamp: u32, timestamp: u32) -> bool {
    timestamp.wrapping_sub(first_timestamp) < 0x8000_0000
}

fn latest_timestamp(a: u32, b: u32) -> u32 {
    if b.wrapping_sub(a) < 0x8000_0000 {
        b
    } else {
        a
    }
}
