//! Decoding of ring buffer records into typed events

use crate::{MonitorError, Result};
use serde::{Serialize, Serializer};
use std::fmt;
use std::mem;
use std::net::Ipv4Addr;
use tracing::warn;
use upf_common::{Direction, DropEvent, DropReason, PacketTraceEvent};

/// A fixed-layout record read from one of the event rings
pub trait WireRecord: Copy {
    const KIND: &'static str;

    fn into_event(self) -> Result<MonitorEvent>;
}

impl WireRecord for DropEvent {
    const KIND: &'static str = "drop";

    fn into_event(self) -> Result<MonitorEvent> {
        DropRecord::try_from(self).map(MonitorEvent::Drop)
    }
}

impl WireRecord for PacketTraceEvent {
    const KIND: &'static str = "trace";

    fn into_event(self) -> Result<MonitorEvent> {
        TraceRecord::try_from(self).map(MonitorEvent::Trace)
    }
}

/// Reinterpret a raw record. The length must match exactly.
pub fn decode<T: WireRecord>(bytes: &[u8]) -> Result<T> {
    let expected = mem::size_of::<T>();
    if bytes.len() != expected {
        return Err(MonitorError::MalformedEvent {
            kind: T::KIND,
            reason: format!("expected {} bytes, got {}", expected, bytes.len()),
        });
    }
    // SAFETY: the length matches and every WireRecord is a repr(C) struct of
    // integers, for which any bit pattern is valid.
    Ok(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) })
}

/// Decode one raw record, logging and skipping it when malformed
pub fn decode_or_skip<T: WireRecord>(bytes: &[u8]) -> Option<MonitorEvent> {
    accept(decode::<T>(bytes).and_then(WireRecord::into_event))
}

/// Convert typed records, logging and skipping malformed ones
pub fn events_from<T, I>(records: I) -> Vec<MonitorEvent>
where
    T: WireRecord,
    I: IntoIterator<Item = T>,
{
    records
        .into_iter()
        .filter_map(|record| accept(record.into_event()))
        .collect()
}

fn accept(result: Result<MonitorEvent>) -> Option<MonitorEvent> {
    match result {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("{} - skipping", e);
            None
        }
    }
}

fn direction(kind: &'static str, value: u8) -> Result<Direction> {
    Direction::from_u8(value).ok_or_else(|| MonitorError::MalformedEvent {
        kind,
        reason: format!("unknown direction {}", value),
    })
}

fn serialize_reason<S: Serializer>(
    reason: &DropReason,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(reason.as_str())
}

fn serialize_direction<S: Serializer>(
    direction: &Direction,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(direction.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DropRecord {
    pub timestamp_ns: u64,
    pub tunnel_id: u32,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub packet_len: u32,
    #[serde(serialize_with = "serialize_reason")]
    pub reason: DropReason,
    #[serde(serialize_with = "serialize_direction")]
    pub direction: Direction,
}

impl TryFrom<DropEvent> for DropRecord {
    type Error = MonitorError;

    fn try_from(event: DropEvent) -> Result<Self> {
        let reason =
            DropReason::from_u8(event.reason).ok_or_else(|| MonitorError::MalformedEvent {
                kind: DropEvent::KIND,
                reason: format!("unknown drop reason code {}", event.reason),
            })?;
        Ok(Self {
            timestamp_ns: event.timestamp_ns,
            tunnel_id: event.tunnel_id,
            src_ip: Ipv4Addr::from(event.src_ip),
            dst_ip: Ipv4Addr::from(event.dst_ip),
            src_port: event.src_port,
            dst_port: event.dst_port,
            packet_len: event.packet_len,
            reason,
            direction: direction(DropEvent::KIND, event.direction)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceRecord {
    pub timestamp_ns: u64,
    pub tunnel_id: u32,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub packet_len: u32,
    #[serde(serialize_with = "serialize_direction")]
    pub direction: Direction,
    pub qfi: u8,
}

impl TryFrom<PacketTraceEvent> for TraceRecord {
    type Error = MonitorError;

    fn try_from(event: PacketTraceEvent) -> Result<Self> {
        Ok(Self {
            timestamp_ns: event.timestamp_ns,
            tunnel_id: event.tunnel_id,
            src_ip: Ipv4Addr::from(event.src_ip),
            dst_ip: Ipv4Addr::from(event.dst_ip),
            packet_len: event.packet_len,
            direction: direction(PacketTraceEvent::KIND, event.direction)?,
            qfi: event.qfi,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MonitorEvent {
    Drop(DropRecord),
    Trace(TraceRecord),
}

impl MonitorEvent {
    pub fn timestamp_ns(&self) -> u64 {
        match self {
            MonitorEvent::Drop(drop) => drop.timestamp_ns,
            MonitorEvent::Trace(trace) => trace.timestamp_ns,
        }
    }
}

impl fmt::Display for MonitorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorEvent::Drop(drop) => write!(
                f,
                "[{}] DROP {} {} teid={:#x} {} -> {} len={}",
                drop.timestamp_ns,
                drop.reason,
                drop.direction.as_str(),
                drop.tunnel_id,
                drop.src_ip,
                drop.dst_ip,
                drop.packet_len
            ),
            MonitorEvent::Trace(trace) => write!(
                f,
                "[{}] TRACE {} teid={:#x} {} -> {} len={} qfi={}",
                trace.timestamp_ns,
                trace.direction.as_str(),
                trace.tunnel_id,
                trace.src_ip,
                trace.dst_ip,
                trace.packet_len,
                trace.qfi
            ),
        }
    }
}
