// ABOUTME: Change bus shared by application instances and a store wrapper that publishes to it.
// ABOUTME: Every successful write through an ObservedStore announces {key, old, new, origin}.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::store::{DurableStore, StoreError};

/// Identity of one application instance writing to a shared medium.
pub type ContextId = Ulid;

/// A key changed on the shared medium.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageEvent {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub origin: ContextId,
}

/// Broadcast channel of storage events. Delivery is best-effort: a slow
/// subscriber may miss events.
#[derive(Debug, Clone)]
pub struct ChangeBus {
    tx: broadcast::Sender<StorageEvent>,
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ChangeBus {
    /// A bus buffering up to `capacity` events per subscriber (at least one).
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: StorageEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.tx.subscribe()
    }
}

/// Wraps a medium so that this instance's writes are announced on the bus,
/// tagged with its `ContextId`.
pub struct ObservedStore {
    inner: Arc<dyn DurableStore>,
    origin: ContextId,
    bus: ChangeBus,
}

impl ObservedStore {
    pub fn new(inner: Arc<dyn DurableStore>, origin: ContextId, bus: ChangeBus) -> Self {
        Self { inner, origin, bus }
    }

    pub fn origin(&self) -> ContextId {
        self.origin
    }

    /// Previous value for the event payload. A failed read only loses
    /// detail in the notification, so it is not an error.
    async fn previous(&self, key: &str) -> Option<String> {
        self.inner.get(key).await.ok().flatten()
    }
}

#[async_trait]
impl DurableStore for ObservedStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let old_value = self.previous(key).await;
        self.inner.set(key, value).await?;
        self.bus.publish(StorageEvent {
            key: key.to_string(),
            old_value,
            new_value: Some(value.to_string()),
            origin: self.origin,
        });
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let old_value = self.previous(key).await;
        self.inner.remove(key).await?;
        if old_value.is_some() {
            self.bus.publish(StorageEvent {
                key: key.to_string(),
                old_value,
                new_value: None,
                origin: self.origin,
            });
        }
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.keys(prefix).await
    }

    async fn probe(&self) -> Result<(), StoreError> {
        // Probing the raw medium keeps the sentinel key off the bus.
        self.inner.probe().await
    }
}
