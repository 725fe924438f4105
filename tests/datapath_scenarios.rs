use std::net::Ipv4Addr;
use upf_common::probe::{self, Skip};
use upf_common::reason::errno;
use upf_common::{ConfigFlag, Direction, DropReason, SessionInfo};
use upf_monitor::config::MonitorConfig;
use upf_monitor::control::ControlPlane;
use upf_monitor::datapath::{HostDatapath, SkbImage};
use upf_monitor::ebpf::events::{events_from, MonitorEvent};

fn uplink(dp: &HostDatapath, core: usize, len: u32, teid: u32, ret: i32) -> probe::ProbeResult {
    let skb = dp.place(&SkbImage::uplink(len, teid));
    let entry = probe::encap_recv(&dp.core(core), skb);
    // A full ring on the return path only loses the event
    let _ = probe::encap_recv_return(&dp.core(core), ret);
    entry
}

fn downlink(
    dp: &HostDatapath,
    core: usize,
    len: u32,
    ue_ip: Ipv4Addr,
    ret: i32,
) -> probe::ProbeResult {
    let skb = dp.place(&SkbImage::downlink(len, ue_ip));
    let entry = probe::dev_xmit(&dp.core(core), skb);
    let _ = probe::dev_xmit_return(&dp.core(core), ret);
    entry
}

fn drops(dp: &HostDatapath) -> Vec<MonitorEvent> {
    events_from(dp.drain_drops(usize::MAX))
}

#[test]
fn test_uplink_packets_accumulate_per_tunnel() {
    let dp = HostDatapath::new(1);

    uplink(&dp, 0, 100, 42, 0).unwrap();
    let snapshot = dp.snapshot();
    assert_eq!((snapshot.uplink.packets, snapshot.uplink.bytes), (1, 100));
    let tunnel = snapshot.tunnel(42).unwrap();
    assert_eq!((tunnel.packets, tunnel.bytes), (1, 100));

    uplink(&dp, 0, 50, 42, 0).unwrap();
    let tunnel = dp.snapshot().tunnel(42).unwrap();
    assert_eq!((tunnel.packets, tunnel.bytes), (2, 150));
    assert!(tunnel.last_update_ns > 0);
    assert!(drops(&dp).is_empty());
}

#[test]
fn test_uplink_invalid_teid_is_reported() {
    let dp = HostDatapath::new(1);

    uplink(&dp, 0, 100, 42, -errno::EINVAL).unwrap();

    let events = drops(&dp);
    assert_eq!(events.len(), 1);
    let MonitorEvent::Drop(drop) = &events[0] else {
        panic!("expected a drop, got {:?}", events[0]);
    };
    assert_eq!(drop.reason, DropReason::InvalidTeid);
    assert_eq!(drop.direction, Direction::Uplink);
    assert_eq!(drop.tunnel_id, 42);
    assert_eq!(drop.packet_len, 100);
    assert!(drop.timestamp_ns > 0);
}

#[test]
fn test_uplink_return_codes() {
    let dp = HostDatapath::new(1);

    uplink(&dp, 0, 100, 7, -errno::ENOENT).unwrap();
    uplink(&dp, 0, 100, 7, -errno::ENOMEM).unwrap();
    uplink(&dp, 0, 100, 7, -1).unwrap();
    uplink(&dp, 0, 100, 7, 1).unwrap();

    let reasons: Vec<_> = drops(&dp)
        .into_iter()
        .map(|event| match event {
            MonitorEvent::Drop(drop) => drop.reason,
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(
        reasons,
        vec![
            DropReason::NoPdrMatch,
            DropReason::Memory,
            DropReason::DecapFailed
        ]
    );
}

#[test]
fn test_downlink_accounted_per_subscriber() {
    let dp = HostDatapath::new(1);
    let ue = Ipv4Addr::new(10, 45, 0, 2);

    downlink(&dp, 0, 200, ue, 0).unwrap();

    let snapshot = dp.snapshot();
    let subscriber = snapshot.subscriber(ue).unwrap();
    assert_eq!((subscriber.packets, subscriber.bytes), (1, 200));
    assert_eq!((snapshot.downlink.packets, snapshot.downlink.bytes), (1, 200));
    assert_eq!(snapshot.uplink.packets, 0);
    assert!(drops(&dp).is_empty());
}

#[test]
fn test_downlink_transmit_failure() {
    let dp = HostDatapath::new(1);
    let ue = Ipv4Addr::new(10, 45, 0, 3);

    downlink(&dp, 0, 300, ue, 1).unwrap();

    let events = drops(&dp);
    assert_eq!(events.len(), 1);
    let MonitorEvent::Drop(drop) = &events[0] else {
        panic!("expected a drop");
    };
    assert_eq!(drop.reason, DropReason::EncapFailed);
    assert_eq!(drop.direction, Direction::Downlink);
    assert_eq!(drop.dst_ip, ue);
    assert_eq!(drop.packet_len, 300);
}

#[test]
fn test_free_path_respects_toggle_and_noise_filter() {
    let mut dp = HostDatapath::new(1);
    let skb = dp.place(&SkbImage::bare(64));

    assert_eq!(
        probe::free_skb(&dp.core(0), || Some(skb)),
        Err(Skip::Disabled)
    );
    assert!(drops(&dp).is_empty());

    dp.set_flag(ConfigFlag::DropTracing, true).unwrap();
    let tiny = dp.place(&SkbImage::bare(19));
    assert_eq!(
        probe::free_skb(&dp.core(0), || Some(tiny)),
        Err(Skip::Filtered)
    );
    assert_eq!(probe::free_skb(&dp.core(0), || Some(skb)), Ok(()));
    assert_eq!(probe::free_skb(&dp.core(0), || None), Err(Skip::Unreadable));

    let events = drops(&dp);
    assert_eq!(events.len(), 1);
    let MonitorEvent::Drop(drop) = &events[0] else {
        panic!("expected a drop");
    };
    assert_eq!(drop.reason, DropReason::Kernel);
    assert_eq!(drop.packet_len, 64);
}

#[test]
fn test_free_path_does_not_read_record_when_disabled() {
    let dp = HostDatapath::new(1);
    let mut read = false;

    let _ = probe::free_skb(&dp.core(0), || {
        read = true;
        Some(0)
    });
    assert!(!read);
}

#[test]
fn test_detailed_tracing_gates_trace_events() {
    let mut dp = HostDatapath::new(1);
    uplink(&dp, 0, 100, 42, 0).unwrap();
    assert!(dp.drain_traces(usize::MAX).is_empty());

    dp.set_flag(ConfigFlag::DetailedTracing, true).unwrap();
    uplink(&dp, 0, 100, 42, 0).unwrap();
    downlink(&dp, 0, 80, Ipv4Addr::new(10, 45, 0, 2), 0).unwrap();

    let traces = events_from(dp.drain_traces(usize::MAX));
    assert_eq!(traces.len(), 2);
    let MonitorEvent::Trace(trace) = &traces[1] else {
        panic!("expected a trace");
    };
    assert_eq!(trace.direction, Direction::Downlink);
    assert_eq!(trace.dst_ip, Ipv4Addr::new(10, 45, 0, 2));
    assert_eq!(trace.qfi, 0);
}

#[test]
fn test_full_ring_loses_event_only() {
    let dp = HostDatapath::new(1).with_ring_capacity(1, 1);

    uplink(&dp, 0, 100, 42, -errno::EINVAL).unwrap();
    uplink(&dp, 0, 100, 42, -errno::EINVAL).unwrap();

    assert_eq!(dp.drop_ring().len(), 1);
    assert_eq!(dp.snapshot().tunnel(42).unwrap().packets, 2);

    assert_eq!(dp.drain_drops(usize::MAX).len(), 1);
    uplink(&dp, 0, 100, 42, -errno::EINVAL).unwrap();
    assert_eq!(dp.drop_ring().len(), 1);
}

#[test]
fn test_unreadable_descriptor_has_no_side_effects() {
    let dp = HostDatapath::new(1);

    assert_eq!(probe::encap_recv(&dp.core(0), 0), Err(Skip::Unreadable));
    assert_eq!(
        probe::encap_recv(&dp.core(0), 0xdead_0000),
        Err(Skip::Unreadable)
    );
    let headless = dp.place(&SkbImage::bare(100));
    assert_eq!(probe::encap_recv(&dp.core(0), headless), Err(Skip::Unreadable));

    let snapshot = dp.snapshot();
    assert_eq!(snapshot.uplink.packets, 0);
    assert!(snapshot.tunnels.is_empty());
}

#[test]
fn test_missing_tunnel_id_counts_aggregate_only() {
    let dp = HostDatapath::new(1);

    let no_transport = dp.place(&SkbImage::uplink(100, 42).with_transport_header(0));
    assert_eq!(probe::encap_recv(&dp.core(0), no_transport), Err(Skip::NotFound));
    let zero_teid = dp.place(&SkbImage::uplink(100, 0));
    assert_eq!(probe::encap_recv(&dp.core(0), zero_teid), Err(Skip::NotFound));

    let snapshot = dp.snapshot();
    assert_eq!(snapshot.uplink.packets, 2);
    assert!(snapshot.tunnels.is_empty());
}

#[test]
fn test_short_downlink_counts_aggregate_only() {
    let dp = HostDatapath::new(1);

    downlink(&dp, 0, 19, Ipv4Addr::new(10, 45, 0, 2), 0).unwrap_err();

    let snapshot = dp.snapshot();
    assert_eq!(snapshot.downlink.packets, 1);
    assert!(snapshot.subscribers.is_empty());
}

#[test]
fn test_table_overflow_loses_new_keys() {
    let mut config = MonitorConfig::default();
    config.tables.tunnels = 2;
    let dp = HostDatapath::from_config(1, &config);

    uplink(&dp, 0, 100, 1, 0).unwrap();
    uplink(&dp, 0, 100, 2, 0).unwrap();
    assert_eq!(
        probe::encap_recv(&dp.core(0), dp.place(&SkbImage::uplink(100, 3))),
        Err(Skip::Full)
    );
    uplink(&dp, 0, 100, 1, 0).unwrap();

    let snapshot = dp.snapshot();
    assert_eq!(snapshot.uplink.packets, 4);
    assert_eq!(snapshot.tunnels.len(), 2);
    assert!(snapshot.tunnel(3).is_none());
    assert_eq!(snapshot.tunnel(1).unwrap().packets, 2);
}

#[test]
fn test_aggregates_sum_across_cores() {
    let dp = HostDatapath::new(4);

    for core in 0..4 {
        uplink(&dp, core, 100 + core as u32, 42, 0).unwrap();
    }
    uplink(&dp, 1, 10, 42, 0).unwrap();

    let per_core = dp.per_core(Direction::Uplink);
    assert_eq!(per_core.len(), 4);
    assert_eq!(per_core[1].packets, 2);

    let snapshot = dp.snapshot();
    assert_eq!(snapshot.uplink.packets, 5);
    assert_eq!(snapshot.uplink.bytes, 100 + 101 + 102 + 103 + 10);
    assert_eq!(snapshot.tunnel(42).unwrap().packets, 5);
    let newest = per_core.iter().map(|c| c.last_update_ns).max().unwrap();
    assert_eq!(snapshot.uplink.last_update_ns, newest);
}

#[test]
fn test_pending_packets_are_per_core() {
    let dp = HostDatapath::new(2);

    let first = dp.place(&SkbImage::uplink(100, 1));
    let second = dp.place(&SkbImage::uplink(200, 2));
    probe::encap_recv(&dp.core(0), first).unwrap();
    probe::encap_recv(&dp.core(1), second).unwrap();
    probe::encap_recv_return(&dp.core(1), -errno::EINVAL).unwrap();
    probe::encap_recv_return(&dp.core(0), -errno::ENOENT).unwrap();

    let tunnels: Vec<_> = drops(&dp)
        .into_iter()
        .map(|event| match event {
            MonitorEvent::Drop(drop) => (drop.tunnel_id, drop.packet_len, drop.reason),
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(
        tunnels,
        vec![
            (2, 200, DropReason::InvalidTeid),
            (1, 100, DropReason::NoPdrMatch)
        ]
    );
}

#[test]
fn test_session_correlation() {
    let mut dp = HostDatapath::new(1);
    let ue = Ipv4Addr::new(10, 45, 0, 2);
    let upf = Ipv4Addr::new(192, 168, 1, 1);
    dp.upsert_session(
        42,
        SessionInfo {
            seid: 9,
            ue_ip: u32::from(ue),
            upf_ip: u32::from(upf),
            created_at_ns: 1,
        },
    )
    .unwrap();

    uplink(&dp, 0, 100, 42, -errno::EINVAL).unwrap();
    uplink(&dp, 0, 100, 43, -errno::EINVAL).unwrap();

    let events = drops(&dp);
    let MonitorEvent::Drop(known) = &events[0] else {
        panic!("expected a drop");
    };
    assert_eq!((known.src_ip, known.dst_ip), (ue, upf));
    let MonitorEvent::Drop(unknown) = &events[1] else {
        panic!("expected a drop");
    };
    assert_eq!(unknown.src_ip, Ipv4Addr::UNSPECIFIED);
    assert_eq!(unknown.dst_ip, Ipv4Addr::UNSPECIFIED);

    dp.remove_session(42).unwrap();
    dp.remove_session(42).unwrap();
    assert!(dp.session(42).is_none());
}

#[test]
fn test_forward_and_netfilter_are_gated_and_paired() {
    let mut dp = HostDatapath::new(1);
    let skb = dp.place(&SkbImage::bare(120));

    assert_eq!(probe::forward(&dp.core(0), || Some(skb)), Err(Skip::Disabled));
    assert_eq!(probe::forward_return(&dp.core(0), 1), Err(Skip::Disabled));
    assert!(drops(&dp).is_empty());

    dp.set_flag(ConfigFlag::NetfilterTracing, true).unwrap();

    probe::forward(&dp.core(0), || Some(skb)).unwrap();
    probe::forward_return(&dp.core(0), 0).unwrap();
    probe::forward(&dp.core(0), || Some(skb)).unwrap();
    probe::forward_return(&dp.core(0), 1).unwrap();

    probe::netfilter(&dp.core(0), || Some(skb)).unwrap();
    probe::netfilter_return(&dp.core(0), 1).unwrap();
    probe::netfilter(&dp.core(0), || Some(skb)).unwrap();
    probe::netfilter_return(&dp.core(0), -1).unwrap();

    let events: Vec<_> = drops(&dp)
        .into_iter()
        .map(|event| match event {
            MonitorEvent::Drop(drop) => (drop.reason, drop.packet_len, drop.direction),
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(
        events,
        vec![
            (DropReason::Routing, 120, Direction::Uplink),
            (DropReason::Policy, 120, Direction::Uplink)
        ]
    );
}

#[test]
fn test_unpaired_return_reports_zero_length() {
    let mut dp = HostDatapath::new(1);
    dp.set_flag(ConfigFlag::NetfilterTracing, true).unwrap();

    probe::netfilter_return(&dp.core(0), -1).unwrap();

    let events = drops(&dp);
    let MonitorEvent::Drop(drop) = &events[0] else {
        panic!("expected a drop");
    };
    assert_eq!(drop.packet_len, 0);
    assert_eq!(drop.reason, DropReason::Policy);
}

#[test]
fn test_full_table_still_traces_packet() {
    let mut config = MonitorConfig::default();
    config.tables.tunnels = 1;
    config.toggles.detailed_tracing = true;
    let dp = HostDatapath::from_config(1, &config);

    uplink(&dp, 0, 100, 1, 0).unwrap();
    assert_eq!(uplink(&dp, 0, 100, 2, 0), Err(Skip::Full));

    let traces = events_from(dp.drain_traces(usize::MAX));
    assert_eq!(traces.len(), 2);
    let MonitorEvent::Trace(trace) = &traces[1] else {
        panic!("expected a trace");
    };
    assert_eq!(trace.tunnel_id, 2);
    assert!(dp.snapshot().tunnel(2).is_none());
}

#[test]
fn test_downlink_without_subscriber_keeps_length_on_drop() {
    let dp = HostDatapath::new(1);

    downlink(&dp, 0, 19, Ipv4Addr::new(10, 45, 0, 2), 1).unwrap_err();

    let events = drops(&dp);
    let MonitorEvent::Drop(drop) = &events[0] else {
        panic!("expected a drop");
    };
    assert_eq!(drop.reason, DropReason::EncapFailed);
    assert_eq!(drop.packet_len, 19);
    assert_eq!(drop.dst_ip, Ipv4Addr::UNSPECIFIED);
}

#[test]
fn test_concurrent_cores_share_tunnel_counter() {
    const CORES: usize = 4;
    const PACKETS: u64 = 500;
    let dp = HostDatapath::new(CORES);
    uplink(&dp, 0, 10, 42, 0).unwrap();

    std::thread::scope(|scope| {
        for core in 0..CORES {
            let dp = &dp;
            scope.spawn(move || {
                for _ in 0..PACKETS {
                    uplink(dp, core, 10, 42, 0).unwrap();
                }
            });
        }
    });

    let expected = 1 + CORES as u64 * PACKETS;
    let snapshot = dp.snapshot();
    let tunnel = snapshot.tunnel(42).unwrap();
    assert_eq!((tunnel.packets, tunnel.bytes), (expected, expected * 10));
    assert_eq!(snapshot.uplink.packets, expected);
}

#[test]
fn test_concurrent_drops_never_exceed_ring() {
    const CORES: usize = 4;
    const CAPACITY: usize = 8;
    let dp = HostDatapath::new(CORES).with_ring_capacity(CAPACITY, CAPACITY);

    std::thread::scope(|scope| {
        for core in 0..CORES {
            let dp = &dp;
            scope.spawn(move || {
                let teid = 100 + core as u32;
                for _ in 0..50 {
                    uplink(dp, core, teid, teid, -errno::EINVAL).unwrap();
                    assert!(dp.drop_ring().len() <= CAPACITY);
                }
            });
        }
    });

    let events = drops(&dp);
    assert_eq!(events.len(), CAPACITY);
    for event in events {
        let MonitorEvent::Drop(drop) = event else {
            panic!("expected a drop");
        };
        assert_eq!(drop.reason, DropReason::InvalidTeid);
        assert!((100..100 + CORES as u32).contains(&drop.tunnel_id));
        assert_eq!(drop.packet_len, drop.tunnel_id);
        assert!(drop.timestamp_ns > 0);
    }
}
