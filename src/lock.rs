//! Per-event exclusive sections. Attempts on distinct events never contend;
//! two attempts on the same event (e.g. a redelivery racing the original)
//! run one after the other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::types::EventId;

#[derive(Default, Clone)]
pub struct EventLocks {
    inner: Arc<Mutex<HashMap<EventId, Arc<AsyncMutex<()>>>>>,
}

impl EventLocks {
    /// No events locked.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `id`. Released when the guard drops.
    pub async fn lock(&self, id: EventId) -> EventGuard {
        let mutex = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_default()
            .clone();
        let guard = mutex.lock_owned().await;
        EventGuard {
            id,
            guard: Some(guard),
            locks: self.clone(),
        }
    }

    /// Number of events currently locked or waited on.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no event is locked or waited on.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held for the duration of an event's exclusive section.
pub struct EventGuard {
    id: EventId,
    guard: Option<OwnedMutexGuard<()>>,
    locks: EventLocks,
}

impl Drop for EventGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self
            .locks
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // only the map still refers to the mutex: nobody holds or awaits it
        if map.get(&self.id).is_some_and(|m| Arc::strong_count(m) == 1) {
            map.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ethers::types::H256;
    use tokio::time::{Instant, sleep};

    use super::*;

    fn id(n: u64) -> EventId {
        EventId::new(H256::from_low_u64_be(n), 0)
    }

    #[tokio::test(start_paused = true)]
    async fn same_event_is_serialized() {
        let locks = EventLocks::new();
        let start = Instant::now();

        let first = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(id(1)).await;
                sleep(Duration::from_secs(10)).await;
            })
        };
        tokio::task::yield_now().await;
        let second = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(id(1)).await;
                Instant::now()
            })
        };

        first.await.unwrap();
        let acquired_at = second.await.unwrap();
        assert!(acquired_at - start >= Duration::from_secs(10));
        assert!(locks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_events_do_not_contend() {
        let locks = EventLocks::new();
        let _a = locks.lock(id(1)).await;
        let start = Instant::now();
        let _b = tokio::time::timeout(Duration::from_secs(1), locks.lock(id(2)))
            .await
            .expect("distinct event must not block");
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(locks.len(), 2);
    }
}
