// crates/server-jobs/src/bus.rs
//! Fan-out of job events to independent, bounded subscriber queues.
//!
//! Unlike a `broadcast` channel, a slow subscriber never makes others lag:
//! each one owns its own queue, and a full queue evicts only that
//! subscriber, flagging the subscription as gapped so it can resync from a
//! registry snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use jobcast_types::JobEvent;
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::sync::mpsc;

/// Sizing for subscriber queues.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Events buffered per subscriber before it is dropped as gapped.
    pub subscriber_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 256,
        }
    }
}

/// Why a subscription stopped yielding events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvError {
    /// The queue overflowed and events were dropped. Resync from a snapshot.
    #[error("subscriber fell behind, events were dropped")]
    Gap,
    /// Unsubscribed, or the bus shut down.
    #[error("subscription closed")]
    Closed,
}

struct Subscriber {
    tx: mpsc::Sender<JobEvent>,
    gapped: Arc<AtomicBool>,
}

struct BusInner {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
}

impl BusInner {
    fn subscribers(&self) -> MutexGuard<'_, HashMap<u64, Subscriber>> {
        self.subscribers.lock().unwrap_or_else(|e| {
            tracing::error!("Mutex poisoned on event bus subscribers: {e}");
            e.into_inner()
        })
    }

    fn remove(&self, id: u64) {
        let mut subs = self.subscribers();
        if subs.remove(&id).is_some() {
            gauge!("job_bus_subscribers").set(subs.len() as f64);
        }
    }
}

/// Cheaply cloneable handle to the shared bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity: config.subscriber_capacity.max(1),
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Deliver `event` to every current subscriber.
    ///
    /// Never waits: a subscriber whose queue is full is evicted and marked
    /// gapped. Returns the number of subscribers the event was queued for.
    pub fn publish(&self, event: JobEvent) -> usize {
        let mut subs = self.inner.subscribers();
        let mut delivered = 0;
        let mut evicted = Vec::new();

        for (id, sub) in subs.iter() {
            match sub.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.gapped.store(true, Ordering::Release);
                    evicted.push(*id);
                    counter!("job_bus_gaps_total").increment(1);
                    tracing::warn!(subscriber = *id, "subscriber queue full, dropping subscription");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => evicted.push(*id),
            }
        }
        for id in evicted {
            subs.remove(&id);
        }
        gauge!("job_bus_subscribers").set(subs.len() as f64);
        drop(subs);

        counter!("job_events_published_total", "kind" => event.kind().as_str()).increment(1);
        delivered
    }

    /// Register a new subscriber with its own bounded queue.
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let gapped = Arc::new(AtomicBool::new(false));

        let mut subs = self.inner.subscribers();
        subs.insert(
            id,
            Subscriber {
                tx,
                gapped: Arc::clone(&gapped),
            },
        );
        gauge!("job_bus_subscribers").set(subs.len() as f64);
        drop(subs);

        tracing::debug!(subscriber = id, "event bus subscriber added");
        Subscription {
            id,
            rx,
            gapped,
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }

    /// Drop every subscriber. Pending events are still drained by receivers,
    /// after which they see [`RecvError::Closed`].
    pub fn close(&self) {
        let mut subs = self.inner.subscribers();
        subs.clear();
        gauge!("job_bus_subscribers").set(0.0);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

/// Receive side of one bus subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<JobEvent>,
    gapped: Arc<AtomicBool>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event.
    ///
    /// Events queued before an overflow are still delivered; the gap is
    /// reported once the queue is drained.
    pub async fn recv(&mut self) -> Result<JobEvent, RecvError> {
        match self.rx.recv().await {
            Some(event) => Ok(event),
            None => Err(self.end_reason()),
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv). `Ok(None)` means the
    /// queue is currently empty.
    pub fn try_recv(&mut self) -> Result<Option<JobEvent>, RecvError> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(self.end_reason()),
        }
    }

    pub fn is_gapped(&self) -> bool {
        self.gapped.load(Ordering::Acquire)
    }

    pub fn unsubscribe(self) {
        drop(self);
    }

    fn end_reason(&self) -> RecvError {
        if self.is_gapped() {
            RecvError::Gap
        } else {
            RecvError::Closed
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn progress(runner_id: &str, current_task: u64) -> JobEvent {
        JobEvent::JobProgress {
            runner_id: runner_id.into(),
            current_task,
        }
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.publish(progress("r1", 1)), 2);
        assert_eq!(a.recv().await.unwrap(), progress("r1", 1));
        assert_eq!(b.recv().await.unwrap(), progress("r1", 1));
    }

    #[tokio::test]
    async fn test_per_runner_order_is_preserved() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();
        for i in 1..=5 {
            bus.publish(progress("r1", i));
            bus.publish(progress("r2", i * 10));
        }

        let mut r1 = Vec::new();
        while let Ok(Some(event)) = sub.try_recv() {
            if let JobEvent::JobProgress {
                runner_id,
                current_task,
            } = event
            {
                if runner_id == "r1" {
                    r1.push(current_task);
                }
            }
        }
        assert_eq!(r1, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_full_queue_marks_gap_without_blocking() {
        let bus = EventBus::new(BusConfig {
            subscriber_capacity: 2,
        });
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        bus.publish(progress("r1", 1));
        bus.publish(progress("r1", 2));
        assert_eq!(fast.recv().await.unwrap(), progress("r1", 1));
        assert_eq!(fast.recv().await.unwrap(), progress("r1", 2));

        // Third publish overflows both queues only for the one that did not drain.
        assert_eq!(bus.publish(progress("r1", 3)), 1);
        assert!(slow.is_gapped());
        assert!(!fast.is_gapped());
        assert_eq!(bus.subscriber_count(), 1);

        // Buffered events still arrive, then the gap is reported.
        assert_eq!(slow.recv().await.unwrap(), progress("r1", 1));
        assert_eq!(slow.recv().await.unwrap(), progress("r1", 2));
        assert_eq!(slow.recv().await, Err(RecvError::Gap));

        assert_eq!(fast.recv().await.unwrap(), progress("r1", 3));
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = EventBus::default();
        let sub = bus.subscribe();
        let other = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(sub);
        assert_eq!(bus.subscriber_count(), 1);
        other.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(progress("r1", 1)), 0);
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();
        bus.publish(progress("r1", 1));
        bus.close();

        assert_eq!(sub.recv().await.unwrap(), progress("r1", 1));
        assert_eq!(sub.recv().await, Err(RecvError::Closed));
    }
}
