//! Bounded, ordered hand-off between the broker task and the pipeline.
//!
//! The broker side never waits: when the queue is full the oldest delivery is
//! evicted and handed back to the caller for logging. The consumer side waits
//! asynchronously for work and sees `None` once the queue is closed and empty.
//! There is exactly one consumer (the pipeline dispatcher).

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

// ---

/// One inbound MQTT publish, untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    // ---
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl Delivery {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        // ---
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

/// Result of [`DeliveryQueue::push`].
#[derive(Debug, PartialEq)]
pub enum PushOutcome {
    Accepted,
    /// Queue was full; this (oldest) delivery was evicted to make room.
    DroppedOldest(Delivery),
    /// Queue is closed; the new delivery was not enqueued.
    Closed,
}

#[derive(Debug, Default)]
struct Inner {
    items: VecDeque<Delivery>,
    closed: bool,
}

#[derive(Debug)]
pub struct DeliveryQueue {
    // ---
    capacity: usize,
    inner: Mutex<Inner>,
    ready: Notify,
}

impl DeliveryQueue {
    // ---
    pub fn new(capacity: usize) -> Self {
        // ---
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            ready: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue without blocking; evicts the oldest entry when full.
    pub fn push(&self, delivery: Delivery) -> PushOutcome {
        // ---
        let outcome = {
            let mut inner = self.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }
            let evicted = if inner.items.len() >= self.capacity {
                inner.items.pop_front()
            } else {
                None
            };
            inner.items.push_back(delivery);
            match evicted {
                Some(old) => PushOutcome::DroppedOldest(old),
                None => PushOutcome::Accepted,
            }
        };
        self.ready.notify_one();
        outcome
    }

    /// Next delivery in receive order, or `None` once closed and drained.
    pub async fn pop(&self) -> Option<Delivery> {
        // ---
        loop {
            {
                let mut inner = self.lock();
                if let Some(delivery) = inner.items.pop_front() {
                    return Some(delivery);
                }
                if inner.closed {
                    return None;
                }
            }
            // notify_one stores a permit when nobody waits, so a push that
            // lands between the unlock above and this await is not missed.
            self.ready.notified().await;
        }
    }

    /// Stop accepting deliveries. Queued items remain poppable.
    pub fn close(&self) {
        // ---
        self.lock().closed = true;
        self.ready.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn delivery(n: u32) -> Delivery {
        Delivery::new(format!("topic/sensor/H-0/S-{n}"), format!("{n}"))
    }

    #[tokio::test]
    async fn test_fifo_order() {
        // ---
        let q = DeliveryQueue::new(8);
        for n in 0..3 {
            assert_eq!(q.push(delivery(n)), PushOutcome::Accepted);
        }
        for n in 0..3 {
            assert_eq!(q.pop().await.unwrap().topic, delivery(n).topic);
        }
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest() {
        // ---
        let q = DeliveryQueue::new(2);
        q.push(delivery(0));
        q.push(delivery(1));

        match q.push(delivery(2)) {
            PushOutcome::DroppedOldest(old) => assert_eq!(old.topic, delivery(0).topic),
            other => panic!("expected eviction, got {other:?}"),
        }
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().await.unwrap().topic, delivery(1).topic);
        assert_eq!(q.pop().await.unwrap().topic, delivery(2).topic);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        // ---
        let q = DeliveryQueue::new(4);
        q.push(delivery(0));
        q.close();

        assert_eq!(q.push(delivery(1)), PushOutcome::Closed);
        assert!(q.pop().await.is_some());
        assert!(q.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        // ---
        let q = Arc::new(DeliveryQueue::new(4));
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push(delivery(7));

        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.unwrap().topic, delivery(7).topic);
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_consumer() {
        // ---
        let q = Arc::new(DeliveryQueue::new(4));
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close();

        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(got.is_none());
    }
}
