use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::types::{EventId, EventRecord, unix_now};

/// Persistence for message event records. Implementations must reject status
/// changes out of `Done` and `Failed`.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn get(&self, id: &EventId) -> Result<Option<EventRecord>, StoreError>;

    async fn save(&self, record: EventRecord) -> Result<(), StoreError>;
}

/// Thread-safe in-memory event store. Keeps every status a record has been
/// saved with.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    records: Arc<RwLock<HashMap<EventId, EventRecord>>>,
    history: Arc<RwLock<HashMap<EventId, Vec<EventRecord>>>>,
}

impl InMemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every saved version of a record, oldest first.
    pub async fn history(&self, id: &EventId) -> Vec<EventRecord> {
        self.history
            .read()
            .await
            .get(id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn get(&self, id: &EventId) -> Result<Option<EventRecord>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn save(&self, mut record: EventRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let id = record.id();
        if let Some(existing) = records.get(&id) {
            let from = existing.status;
            let to = record.status;
            let allowed = if from == to {
                !from.is_terminal()
            } else {
                from.can_transition_to(to)
            };
            if !allowed {
                return Err(StoreError::IllegalTransition { id, from, to });
            }
            if from != to {
                record.updated_at = unix_now();
            }
        }

        self.history
            .write()
            .await
            .entry(id)
            .or_default()
            .push(record.clone());
        records.insert(id, record);
        Ok(())
    }
}
