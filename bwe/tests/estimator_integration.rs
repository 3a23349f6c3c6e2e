//! End-to-end scenarios driven through the public estimator API.
//!
//! The tester plays the transport: it feeds packets with explicit
//! (send time, arrival time, size) triples and checks what a registered
//! observer gets told.

use bwe::{
    convert_ms_to_24bits, BitrateObserver, DelayBasedBwe, DelayBasedBweBuilder, NOT_A_PROBE,
};
use rtp::extension::{ExtensionMap, ExtensionType};
use rtp::header::Header;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingObserver {
    updates: Mutex<Vec<(Vec<u32>, u32)>>,
}

impl RecordingObserver {
    fn updates(&self) -> Vec<(Vec<u32>, u32)> {
        self.updates.lock().unwrap().clone()
    }

    fn last_bitrate_bps(&self) -> Option<u32> {
        self.updates
            .lock()
            .unwrap()
            .last()
            .map(|(_, bitrate_bps)| *bitrate_bps)
    }
}

impl BitrateObserver for RecordingObserver {
    fn on_receive_bitrate_changed(&self, ssrcs: &[u32], bitrate_bps: u32) {
        self.updates
            .lock()
            .unwrap()
            .push((ssrcs.to_vec(), bitrate_bps));
    }
}

fn make_bwe() -> (Arc<RecordingObserver>, DelayBasedBwe) {
    let observer = Arc::new(RecordingObserver::default());
    let bwe = DelayBasedBweBuilder::new().build(observer.clone());
    (observer, bwe)
}

fn feed(
    bwe: &DelayBasedBwe,
    send_ms: i64,
    recv_ms: i64,
    payload_size: usize,
    ssrc: u32,
    probe_cluster_id: i32,
) {
    bwe.incoming_packet_info(
        recv_ms,
        convert_ms_to_24bits(send_ms),
        payload_size,
        ssrc,
        probe_cluster_id,
    )
    .unwrap();
}

#[test]
fn test_cold_start_converges_to_incoming_rate() {
    let (observer, bwe) = make_bwe();
    // 200 packets of 1000 bytes every 20 ms: 400 kbps.
    for i in 0..200i64 {
        feed(&bwe, i * 20, i * 20, 1000, 0x1234, NOT_A_PROBE);
    }
    let updates = observer.updates();
    assert!(!updates.is_empty());
    for (ssrcs, _) in &updates {
        assert_eq!(ssrcs, &vec![0x1234]);
    }
    let final_bitrate_bps = observer.last_bitrate_bps().unwrap() as f64;
    assert!(
        (360_000.0..=440_000.0).contains(&final_bitrate_bps),
        "final bitrate {final_bitrate_bps}"
    );
}

#[test]
fn test_probe_cluster_sets_initial_estimate() {
    let (observer, bwe) = make_bwe();
    // 7 probe packets of 1200 bytes, paced 5 ms apart on both sides:
    // 1.92 Mbps.
    for i in 0..7i64 {
        feed(&bwe, i * 5, i * 5, 1200, 0x1234, 1);
    }
    let updates = observer.updates();
    assert_eq!(updates.len(), 1);
    let bitrate_bps = updates[0].1 as f64;
    assert!(
        (1_820_000.0..=2_020_000.0).contains(&bitrate_bps),
        "bitrate {bitrate_bps}"
    );
    let (ssrcs, estimate_bps) = bwe.latest_estimate().unwrap();
    assert_eq!(ssrcs, vec![0x1234]);
    assert!(estimate_bps >= 1_820_000);
}

#[test]
fn test_failed_probe_does_not_update_estimate() {
    let (observer, bwe) = make_bwe();
    // Sent 5 ms apart but arriving 15 ms apart: the probe overshot the
    // link and must not produce an estimate.
    for i in 0..7i64 {
        feed(&bwe, i * 5, i * 15, 1200, 0x1234, 1);
    }
    assert!(observer.updates().is_empty());
    assert!(bwe.latest_estimate().is_none());
}

#[test]
fn test_overuse_triggers_decrease_below_incoming_rate() {
    let (observer, bwe) = make_bwe();
    // 2 s of steady traffic at 500 kbps: 1250 bytes every 20 ms.
    let mut send_ms = 0i64;
    let mut recv_ms = 0i64;
    while send_ms < 2000 {
        feed(&bwe, send_ms, recv_ms, 1250, 0x1234, NOT_A_PROBE);
        send_ms += 20;
        recv_ms += 20;
    }
    let updates_before = observer.updates().len();
    // Receive intervals stretch to 150% of the send intervals for 500 ms.
    while send_ms < 2500 {
        feed(&bwe, send_ms, recv_ms, 1250, 0x1234, NOT_A_PROBE);
        send_ms += 20;
        recv_ms += 30;
    }
    let updates = observer.updates();
    assert!(
        updates.len() > updates_before,
        "over-use must promote a reduced estimate"
    );
    let final_bitrate_bps = observer.last_bitrate_bps().unwrap() as f64;
    // Reduced to beta times the measured incoming rate (with 5% slack).
    assert!(
        final_bitrate_bps <= 0.85 * 500_000.0 * 1.05,
        "final bitrate {final_bitrate_bps}"
    );
    assert!(final_bitrate_bps > 100_000.0, "final bitrate {final_bitrate_bps}");
}

#[test]
fn test_stream_timeout_flushes_and_new_stream_registers() {
    let (_observer, bwe) = make_bwe();
    // Prime a valid estimate with a probe burst from the first stream.
    for i in 0..5i64 {
        feed(&bwe, i * 5, i * 5, 1200, 0xaaaa, 1);
    }
    let (ssrcs, first_estimate_bps) = bwe.latest_estimate().unwrap();
    assert_eq!(ssrcs, vec![0xaaaa]);
    // Silence past the stream timeout, then a new stream appears.
    let restart_ms = 20 + 2001 + 500;
    feed(&bwe, restart_ms, restart_ms, 1000, 0xbbbb, NOT_A_PROBE);
    let (ssrcs, estimate_bps) = bwe.latest_estimate().unwrap();
    assert_eq!(ssrcs, vec![0xbbbb]);
    // The rate controller's estimate survives stream churn.
    assert!(estimate_bps >= first_estimate_bps);
}

#[test]
fn test_latest_estimate_lists_all_active_streams() {
    let (_observer, bwe) = make_bwe();
    for i in 0..5i64 {
        feed(&bwe, i * 5, i * 5, 1200, 0xbbbb, 1);
    }
    feed(&bwe, 40, 40, 1000, 0xaaaa, NOT_A_PROBE);
    let (ssrcs, _) = bwe.latest_estimate().unwrap();
    assert_eq!(ssrcs, vec![0xaaaa, 0xbbbb]);
}

#[test]
fn test_remove_stream_drops_it_from_the_active_set() {
    let (_observer, bwe) = make_bwe();
    for i in 0..5i64 {
        feed(&bwe, i * 5, i * 5, 1200, 0xaaaa, 1);
    }
    feed(&bwe, 40, 40, 1000, 0xbbbb, NOT_A_PROBE);
    bwe.remove_stream(0xaaaa).unwrap();
    let (ssrcs, _) = bwe.latest_estimate().unwrap();
    assert_eq!(ssrcs, vec![0xbbbb]);
}

#[test]
fn test_packet_without_abs_send_time_is_dropped() {
    let (observer, bwe) = make_bwe();
    let header = Header {
        ssrc: 0x1234,
        ..Default::default()
    };
    for i in 0..100i64 {
        bwe.incoming_packet(i * 20, 1000, &header, NOT_A_PROBE)
            .unwrap();
    }
    assert!(observer.updates().is_empty());
    assert!(bwe.latest_estimate().is_none());
}

#[test]
fn test_parsed_packets_drive_the_estimator() {
    // The full path: raw bytes -> header parser -> estimator.
    let mut extension_map = ExtensionMap::new();
    extension_map
        .register(5, ExtensionType::AbsoluteSendTime)
        .unwrap();

    let make_packet = |send_time_24: u32, ssrc: u32| -> Vec<u8> {
        let mut raw = vec![0u8; 12];
        raw[0] = (2 << 6) | 0x10;
        raw[1] = 96;
        raw[8..12].copy_from_slice(&ssrc.to_be_bytes());
        raw.extend_from_slice(&0xbede_u16.to_be_bytes());
        raw.extend_from_slice(&1u16.to_be_bytes());
        let send_time_bytes = send_time_24.to_be_bytes();
        raw.extend_from_slice(&[0x52, send_time_bytes[1], send_time_bytes[2], send_time_bytes[3]]);
        raw.extend_from_slice(&[0u8; 1200]);
        raw
    };

    let (observer, bwe) = make_bwe();
    for i in 0..7i64 {
        let raw = make_packet(convert_ms_to_24bits(i * 5), 0x4242);
        let header = Header::unmarshal(&raw, &extension_map).unwrap();
        let payload_size = raw.len() - header.header_length;
        bwe.incoming_packet(i * 5, payload_size, &header, 1).unwrap();
    }
    let updates = observer.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, vec![0x4242]);
    assert!(updates[0].1 >= 1_800_000);
}

#[test]
fn test_feedback_vector_path_produces_estimate() {
    use bwe::PacketInfo;
    let (observer, bwe) = make_bwe();
    let feedback: Vec<PacketInfo> = (0..7i64)
        .map(|i| PacketInfo {
            arrival_time_ms: i * 5,
            send_time_ms: i * 5,
            payload_size: 1200,
            probe_cluster_id: 1,
        })
        .collect();
    bwe.incoming_packet_feedback_vector(&feedback).unwrap();
    assert_eq!(observer.updates().len(), 1);
    assert!(observer.last_bitrate_bps().unwrap() >= 1_800_000);
}

#[test]
fn test_process_is_a_no_op_on_a_fixed_cadence() {
    let (observer, bwe) = make_bwe();
    assert_eq!(bwe.time_until_next_process(), 1000);
    bwe.process();
    assert!(observer.updates().is_empty());
    assert!(bwe.latest_estimate().is_none());
}
