use crate::ebpf::events::{DropRecord, MonitorEvent};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use upf_common::{Direction, DropReason};

/// How many drops [`Metrics::recent_drops`] keeps
pub const RECENT_DROPS: usize = 100;

/// Consumer-side tally of drained events
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    pub drops_total: u64,
    pub drops_by_reason: BTreeMap<DropReason, u64>,
    pub uplink_drops: u64,
    pub downlink_drops: u64,
    pub traces_total: u64,
    pub trace_bytes_total: u64,
    /// Newest last
    pub recent_drops: VecDeque<DropRecord>,
}

impl Metrics {
    pub fn drops_for(&self, reason: DropReason) -> u64 {
        self.drops_by_reason.get(&reason).copied().unwrap_or(0)
    }
}

pub struct MetricsCollector {
    metrics: Arc<RwLock<Metrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(Metrics::default())),
        }
    }

    pub async fn process_event(&self, event: MonitorEvent) {
        let mut metrics = self.metrics.write().await;
        record(&mut metrics, event);
    }

    /// Tally a whole poll batch under one lock
    pub async fn process_batch(&self, events: Vec<MonitorEvent>) {
        if events.is_empty() {
            return;
        }
        let mut metrics = self.metrics.write().await;
        for event in events {
            record(&mut metrics, event);
        }
    }

    pub async fn get_metrics(&self) -> Metrics {
        self.metrics.read().await.clone()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn record(metrics: &mut Metrics, event: MonitorEvent) {
    match event {
        MonitorEvent::Drop(drop) => {
            metrics.drops_total += 1;
            *metrics.drops_by_reason.entry(drop.reason).or_insert(0) += 1;
            match drop.direction {
                Direction::Uplink => metrics.uplink_drops += 1,
                Direction::Downlink => metrics.downlink_drops += 1,
            }
            if metrics.recent_drops.len() == RECENT_DROPS {
                metrics.recent_drops.pop_front();
            }
            metrics.recent_drops.push_back(drop);
        }
        MonitorEvent::Trace(trace) => {
            metrics.traces_total += 1;
            metrics.trace_bytes_total += trace.packet_len as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebpf::events::TraceRecord;
    use std::net::Ipv4Addr;

    fn drop_event(reason: DropReason, direction: Direction, timestamp_ns: u64) -> MonitorEvent {
        MonitorEvent::Drop(DropRecord {
            timestamp_ns,
            tunnel_id: 0,
            src_ip: Ipv4Addr::UNSPECIFIED,
            dst_ip: Ipv4Addr::UNSPECIFIED,
            src_port: 0,
            dst_port: 0,
            packet_len: 64,
            reason,
            direction,
        })
    }

    #[tokio::test]
    async fn test_tally_by_reason_and_direction() {
        let collector = MetricsCollector::new();
        collector
            .process_event(drop_event(DropReason::InvalidTeid, Direction::Uplink, 1))
            .await;
        collector
            .process_batch(vec![
                drop_event(DropReason::InvalidTeid, Direction::Uplink, 2),
                drop_event(DropReason::EncapFailed, Direction::Downlink, 3),
                MonitorEvent::Trace(TraceRecord {
                    timestamp_ns: 4,
                    tunnel_id: 42,
                    src_ip: Ipv4Addr::UNSPECIFIED,
                    dst_ip: Ipv4Addr::UNSPECIFIED,
                    packet_len: 100,
                    direction: Direction::Uplink,
                    qfi: 0,
                }),
            ])
            .await;

        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.drops_total, 3);
        assert_eq!(metrics.drops_for(DropReason::InvalidTeid), 2);
        assert_eq!(metrics.drops_for(DropReason::EncapFailed), 1);
        assert_eq!(metrics.drops_for(DropReason::Policy), 0);
        assert_eq!((metrics.uplink_drops, metrics.downlink_drops), (2, 1));
        assert_eq!((metrics.traces_total, metrics.trace_bytes_total), (1, 100));
    }

    #[tokio::test]
    async fn test_recent_drops_are_bounded() {
        let collector = MetricsCollector::new();
        let events = (0..RECENT_DROPS as u64 + 5)
            .map(|ts| drop_event(DropReason::Kernel, Direction::Uplink, ts + 1))
            .collect();
        collector.process_batch(events).await;

        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.recent_drops.len(), RECENT_DROPS);
        assert_eq!(metrics.recent_drops.front().map(|d| d.timestamp_ns), Some(6));
        assert_eq!(metrics.drops_total, RECENT_DROPS as u64 + 5);
    }
}
