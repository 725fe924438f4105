use std::io::Write;
use std::net::Ipv4Addr;
use std::path::Path;
use upf_common::{Direction, DropReason};
use upf_monitor::config::MonitorConfig;
use upf_monitor::datapath::replay::{self, Scenario};
use upf_monitor::ebpf::events::MonitorEvent;

fn scenario_file(yaml: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file
}

#[test]
fn test_bundled_scenario() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("scenarios/basic.yaml");
    let scenario = Scenario::load(&path).unwrap();
    let report = replay::run(&scenario, &MonitorConfig::default()).unwrap();

    let counters = &report.counters;
    assert_eq!((counters.uplink.packets, counters.uplink.bytes), (3, 250));
    assert_eq!((counters.downlink.packets, counters.downlink.bytes), (1, 200));
    assert_eq!(counters.tunnel(42).unwrap().packets, 3);
    assert_eq!(
        counters.subscriber(Ipv4Addr::new(10, 45, 0, 2)).unwrap().bytes,
        200
    );

    let reasons: Vec<_> = report
        .events
        .iter()
        .map(|event| match event {
            MonitorEvent::Drop(drop) => (drop.reason, drop.direction),
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(
        reasons,
        vec![
            (DropReason::InvalidTeid, Direction::Uplink),
            (DropReason::Kernel, Direction::Uplink)
        ]
    );
}

#[test]
fn test_events_are_ordered_by_time() {
    let file = scenario_file(
        r#"
toggles:
  detailed_tracing: true
steps:
  - uplink: { len: 100, teid: 1, ret: -2 }
  - downlink: { len: 80, ue_ip: 10.45.0.9 }
  - uplink: { len: 90, teid: 2, ret: -12 }
"#,
    );
    let scenario = Scenario::load(file.path()).unwrap();
    let report = replay::run(&scenario, &MonitorConfig::default()).unwrap();

    assert_eq!(report.events.len(), 5);
    let timestamps: Vec<_> = report.events.iter().map(|e| e.timestamp_ns()).collect();
    let mut sorted = timestamps.clone();
    sorted.sort_unstable();
    assert_eq!(timestamps, sorted);
}

#[test]
fn test_session_lifecycle_steps() {
    let file = scenario_file(
        r#"
steps:
  - session: { teid: 5, ue_ip: 10.45.0.5, upf_ip: 192.168.1.1 }
  - uplink: { len: 100, teid: 5, ret: -22 }
  - end_session: { teid: 5 }
  - uplink: { len: 100, teid: 5, ret: -22 }
"#,
    );
    let report = replay::run(
        &Scenario::load(file.path()).unwrap(),
        &MonitorConfig::default(),
    )
    .unwrap();

    let sources: Vec<_> = report
        .events
        .iter()
        .filter_map(|event| match event {
            MonitorEvent::Drop(drop) => Some(drop.src_ip),
            _ => None,
        })
        .collect();
    assert_eq!(
        sources,
        vec![Ipv4Addr::new(10, 45, 0, 5), Ipv4Addr::UNSPECIFIED]
    );
}

#[test]
fn test_report_serializes_to_json() {
    let file = scenario_file("steps:\n  - uplink: { len: 100, teid: 42, ret: -22 }\n");
    let report = replay::run(
        &Scenario::load(file.path()).unwrap(),
        &MonitorConfig::default(),
    )
    .unwrap();

    let json: serde_json::Value = serde_json::to_value(&report).unwrap();
    assert_eq!(json["counters"]["uplink"]["packets"], 1);
    assert_eq!(json["events"][0]["type"], "drop");
    assert_eq!(json["events"][0]["reason"], "INVALID_TEID");
    assert_eq!(json["events"][0]["direction"], "uplink");

    let text = report.to_string();
    assert!(text.contains("INVALID_TEID"));
}

#[test]
fn test_config_capacities_apply_to_replay() {
    let config = MonitorConfig::from_yaml("tables:\n  tunnels: 1\n").unwrap();
    let file = scenario_file(
        "steps:\n  - uplink: { len: 100, teid: 1 }\n  - uplink: { len: 100, teid: 2 }\n",
    );
    let report = replay::run(&Scenario::load(file.path()).unwrap(), &config).unwrap();

    assert_eq!(report.counters.uplink.packets, 2);
    assert_eq!(report.counters.tunnels.len(), 1);
}

#[test]
fn test_unknown_step_is_rejected() {
    let file = scenario_file("steps:\n  - teleport: { len: 1 }\n");
    assert!(Scenario::load(file.path()).is_err());
}
