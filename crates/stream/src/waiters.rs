//! Tail-notification fabric for long-poll and SSE readers.
//!
//! Writers publish a [`TailEvent`] after every state change that can unblock
//! a reader: an append (tail moved), a close (no more data will come), or a
//! delete (the stream is gone). Readers at the tail subscribe before
//! re-checking the snapshot, so an append racing with the subscription is
//! never missed. The number of concurrently parked readers is bounded; the
//! HTTP layer turns the overflow into 503.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::StoreError;

/// What changed at the tail of a stream.
#[derive(Debug, Clone)]
pub enum TailSignal {
    /// New records; `next_offset` is the tail after the append.
    Append { next_offset: String },
    /// The stream was closed; `next_offset` is the final tail.
    Closed { next_offset: String },
    /// The stream was deleted.
    Deleted,
}

/// Notification published when the tail of a stream changes.
#[derive(Debug, Clone)]
pub struct TailEvent {
    pub path: String,
    pub signal: TailSignal,
}

struct TailBusInner {
    tx: broadcast::Sender<TailEvent>,
    active: AtomicUsize,
    max_waiters: usize,
}

/// Broadcast fabric connecting the coordinator to parked readers.
#[derive(Clone)]
pub struct TailBus {
    inner: Arc<TailBusInner>,
}

impl TailBus {
    pub fn new(max_waiters: usize) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(TailBusInner {
                tx,
                active: AtomicUsize::new(0),
                max_waiters,
            }),
        }
    }

    /// Publish a tail event. Callers must update the stream state before
    /// publishing so a woken waiter always observes the new tail.
    pub fn publish(&self, event: TailEvent) {
        // Send only fails when no receiver is parked, which is fine.
        let _ = self.inner.tx.send(event);
    }

    /// Register a waiter. Fails with BUSY when the process-wide bound is
    /// reached. The permit releases the slot on drop.
    pub fn waiter(&self) -> Result<(WaiterPermit, broadcast::Receiver<TailEvent>), StoreError> {
        let inner = &self.inner;
        let mut current = inner.active.load(Ordering::Acquire);
        loop {
            if inner.max_waiters != 0 && current >= inner.max_waiters {
                return Err(StoreError::Busy("waiter limit reached"));
            }
            match inner.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        Ok((
            WaiterPermit {
                inner: self.inner.clone(),
            },
            inner.tx.subscribe(),
        ))
    }

    /// Number of currently parked waiters.
    pub fn active_waiters(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }
}

/// Slot held by a parked reader; returned to the pool on drop.
pub struct WaiterPermit {
    inner: Arc<TailBusInner>,
}

impl Drop for WaiterPermit {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waiter_bound() {
        let bus = TailBus::new(2);

        let w1 = bus.waiter().unwrap();
        let w2 = bus.waiter().unwrap();
        assert_eq!(bus.active_waiters(), 2);

        assert!(matches!(bus.waiter(), Err(StoreError::Busy(_))));

        drop(w1);
        assert_eq!(bus.active_waiters(), 1);
        let _w3 = bus.waiter().unwrap();

        drop(w2);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = TailBus::new(8);
        let (_permit, mut rx) = bus.waiter().unwrap();

        bus.publish(TailEvent {
            path: "/s".to_string(),
            signal: TailSignal::Append {
                next_offset: "0000000000000001_0000000000000005".to_string(),
            },
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.path, "/s");
        assert!(matches!(event.signal, TailSignal::Append { .. }));
    }

    #[test]
    fn test_unbounded_when_zero() {
        let bus = TailBus::new(0);
        let mut waiters = Vec::new();
        for _ in 0..100 {
            waiters.push(bus.waiter().unwrap());
        }
        assert_eq!(bus.active_waiters(), 100);
    }
}
