use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;

use crate::error::QueueError;

/// A message handed out by a queue. It stays in flight, counting against the
/// prefetch limit, until it is acked or requeued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub body: Vec<u8>,
    /// Whether this body was delivered before.
    pub redelivered: bool,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Waits for the next delivery. Returns `None` once the queue is closed
    /// and drained.
    async fn receive(&self) -> Option<Delivery>;

    /// Removes the delivery from the queue for good.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Hands the delivery out again after `delay`.
    async fn requeue(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError>;
}

struct Pending {
    body: Vec<u8>,
    redelivered: bool,
}

/// Thread-safe in-memory message queue with a prefetch limit and delayed
/// requeueing. Locks are never held across an await, so a cancelled
/// `receive` cannot lose a message.
pub struct InMemoryQueue {
    pending: Arc<Mutex<VecDeque<Pending>>>,
    in_flight: Mutex<HashMap<u64, (Vec<u8>, OwnedSemaphorePermit)>>,
    prefetch: Arc<Semaphore>,
    notify: Arc<Notify>,
    next_tag: AtomicU64,
    delayed: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl InMemoryQueue {
    /// At most `prefetch` deliveries are unacked at once.
    pub fn new(prefetch: usize) -> Self {
        Self {
            pending: Arc::new(Mutex::new(VecDeque::new())),
            in_flight: Mutex::new(HashMap::new()),
            prefetch: Arc::new(Semaphore::new(prefetch.max(1))),
            notify: Arc::new(Notify::new()),
            next_tag: AtomicU64::new(1),
            delayed: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        }
    }

    /// Appends a raw body.
    pub fn publish(&self, body: Vec<u8>) {
        lock(&self.pending).push_back(Pending {
            body,
            redelivered: false,
        });
        self.notify.notify_one();
    }

    /// Appends `value` as a JSON body.
    pub fn publish_json<T: Serialize>(&self, value: &T) -> serde_json::Result<()> {
        let body = serde_json::to_vec(value)?;
        self.publish(body);
        Ok(())
    }

    /// Stops accepting work. `receive` returns `None` once everything pending
    /// or scheduled for redelivery has been handed out.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Bodies waiting to be received, not counting delayed redeliveries.
    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Deliveries received but not yet acked or requeued.
    pub fn in_flight_len(&self) -> usize {
        lock(&self.in_flight).len()
    }

    fn settle(&self, tag: u64) -> Result<Vec<u8>, QueueError> {
        lock(&self.in_flight)
            .remove(&tag)
            .map(|(body, _permit)| body)
            .ok_or(QueueError::UnknownDelivery(tag))
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn receive(&self) -> Option<Delivery> {
        let permit = self.prefetch.clone().acquire_owned().await.ok()?;
        loop {
            let next = lock(&self.pending).pop_front();
            if let Some(next) = next {
                let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
                lock(&self.in_flight).insert(tag, (next.body.clone(), permit));
                return Some(Delivery {
                    tag,
                    body: next.body,
                    redelivered: next.redelivered,
                });
            }
            if self.closed.load(Ordering::SeqCst) && self.delayed.load(Ordering::SeqCst) == 0 {
                // let any other receiver observe the close as well
                self.notify.notify_one();
                return None;
            }
            self.notify.notified().await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.settle(delivery.tag).map(|_| ())
    }

    async fn requeue(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let body = self.settle(delivery.tag)?;
        let pending = self.pending.clone();
        let notify = self.notify.clone();
        let delayed = self.delayed.clone();

        delayed.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            lock(&pending).push_back(Pending {
                body,
                redelivered: true,
            });
            delayed.fetch_sub(1, Ordering::SeqCst);
            notify.notify_one();
        });
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_order_and_acks() {
        let queue = InMemoryQueue::new(2);
        queue.publish(b"a".to_vec());
        queue.publish(b"b".to_vec());

        let a = queue.receive().await.unwrap();
        let b = queue.receive().await.unwrap();
        assert_eq!((a.body.as_slice(), b.body.as_slice()), (&b"a"[..], &b"b"[..]));
        assert_eq!(queue.in_flight_len(), 2);

        queue.ack(&a).await.unwrap();
        assert!(matches!(
            queue.ack(&a).await,
            Err(QueueError::UnknownDelivery(_))
        ));
        queue.ack(&b).await.unwrap();
        assert_eq!(queue.in_flight_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_bounds_in_flight() {
        let queue = Arc::new(InMemoryQueue::new(1));
        queue.publish(b"a".to_vec());
        queue.publish(b"b".to_vec());

        let first = queue.receive().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_secs(1), queue.receive()).await;
        assert!(blocked.is_err());

        queue.ack(&first).await.unwrap();
        let second = queue.receive().await.unwrap();
        assert_eq!(second.body, b"b");
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_redelivers_after_delay() {
        let queue = InMemoryQueue::new(1);
        queue.publish(b"a".to_vec());
        let first = queue.receive().await.unwrap();

        let start = tokio::time::Instant::now();
        queue.requeue(&first, Duration::from_secs(12)).await.unwrap();
        let again = queue.receive().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(12));
        assert_eq!(again.body, b"a");
        assert!(again.redelivered);
        assert_ne!(again.tag, first.tag);
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let queue = InMemoryQueue::new(4);
        queue.publish(b"a".to_vec());
        queue.close();
        let a = queue.receive().await.unwrap();
        queue.ack(&a).await.unwrap();
        assert!(queue.receive().await.is_none());
    }
}
