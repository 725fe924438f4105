//! Bounded multi-producer, single-consumer event ring with reserve/publish
//! semantics, mirroring `BPF_MAP_TYPE_RINGBUF`.
//!
//! A [`Reservation`] holds one slot of capacity. Publishing it can no longer
//! fail. Dropping it unpublished gives the slot back. Slots are released
//! again as the consumer drains records.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use upf_common::probe::EventSlot;

/// Per-record header the kernel ring buffer adds (`BPF_RINGBUF_HDR_SZ`)
pub const RECORD_HEADER_BYTES: usize = 8;

pub struct EventRing<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    used: Arc<AtomicUsize>,
    capacity: usize,
}

impl<T> EventRing<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            used: Arc::new(AtomicUsize::new(0)),
            capacity,
        }
    }

    /// Capacity in records of a kernel ring of `bytes` bytes
    pub fn with_byte_size(bytes: u32) -> Self {
        let record = std::mem::size_of::<T>() + RECORD_HEADER_BYTES;
        Self::with_capacity(bytes as usize / record)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records reserved or waiting to be drained
    pub fn len(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim room for one record, or `None` when the ring is full
    pub fn reserve(&self) -> Option<Reservation<T>> {
        let mut used = self.used.load(Ordering::Acquire);
        loop {
            if used >= self.capacity {
                return None;
            }
            match self.used.compare_exchange_weak(
                used,
                used + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => used = current,
            }
        }
        Some(Reservation {
            tx: self.tx.clone(),
            used: Arc::clone(&self.used),
            published: false,
        })
    }

    /// Destructive read of up to `max` published records
    pub fn drain(&self, max: usize) -> Vec<T> {
        let mut records = Vec::new();
        while records.len() < max {
            match self.rx.try_recv() {
                Ok(record) => {
                    self.used.fetch_sub(1, Ordering::AcqRel);
                    records.push(record);
                }
                Err(_) => break,
            }
        }
        records
    }
}

pub struct Reservation<T> {
    tx: Sender<T>,
    used: Arc<AtomicUsize>,
    published: bool,
}

impl<T> EventSlot<T> for Reservation<T> {
    fn publish(mut self, event: T) {
        // The channel holds `capacity` records and every queued record owns
        // a reservation, so this send always finds room.
        self.published = self.tx.try_send(event).is_ok();
    }
}

impl<T> Drop for Reservation<T> {
    fn drop(&mut self) {
        if !self.published {
            self.used.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_fails_when_full() {
        let ring = EventRing::with_capacity(2);
        ring.reserve().unwrap().publish(1u32);
        ring.reserve().unwrap().publish(2);

        assert!(ring.reserve().is_none());
        assert_eq!(ring.drain(10), vec![1, 2]);
        assert!(ring.reserve().is_some());
    }

    #[test]
    fn test_abandoned_reservation_is_released() {
        let ring = EventRing::<u32>::with_capacity(1);
        let slot = ring.reserve().unwrap();
        assert!(ring.reserve().is_none());

        drop(slot);
        assert!(ring.is_empty());
        assert!(ring.drain(10).is_empty());
        assert!(ring.reserve().is_some());
    }

    #[test]
    fn test_drain_respects_batch_cap() {
        let ring = EventRing::with_capacity(8);
        for i in 0..5u32 {
            ring.reserve().unwrap().publish(i);
        }

        assert_eq!(ring.drain(3), vec![0, 1, 2]);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.drain(3), vec![3, 4]);
    }

    #[test]
    fn test_byte_size_accounts_for_headers() {
        // 32-byte records plus the 8-byte header
        let ring = EventRing::<[u64; 4]>::with_byte_size(4096);
        assert_eq!(ring.capacity(), 4096 / 40);
    }
}
