// ABOUTME: Relays writes made by other application instances to this instance's subscribers.
// ABOUTME: Filters the shared change bus by key and drops events this instance caused itself.

use hearth_store::{ChangeBus, ContextId, StorageEvent};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Another instance changed the watched key. Advisory: the local session
/// keeps running on its own state until the host decides what to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalChange {
    pub key: String,
    /// Raw stored text, or `None` if the key was removed.
    pub new_value: Option<String>,
}

/// Watches one key on a `ChangeBus` for writes from other contexts.
pub struct CrossContextNotifier {
    key: String,
    tx: broadcast::Sender<ExternalChange>,
    task: JoinHandle<()>,
}

impl CrossContextNotifier {
    /// Start relaying. The bus subscription is taken before this returns,
    /// so no event published afterwards is missed.
    pub fn spawn(bus: &ChangeBus, key: impl Into<String>, local: ContextId) -> Self {
        let key = key.into();
        let (tx, _) = broadcast::channel(64);
        let rx = bus.subscribe();
        let task = tokio::spawn(relay(rx, key.clone(), local, tx.clone()));
        Self { key, tx, task }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExternalChange> {
        self.tx.subscribe()
    }

    /// Stop relaying. Subscribers see the channel close once the notifier
    /// is dropped.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for CrossContextNotifier {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn relay(
    mut rx: broadcast::Receiver<StorageEvent>,
    key: String,
    local: ContextId,
    tx: broadcast::Sender<ExternalChange>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if event.key != key || event.origin == local {
                    continue;
                }
                tracing::info!("{} was changed by another instance ({})", key, event.origin);
                // Nobody listening locally is fine.
                let _ = tx.send(ExternalChange {
                    key: event.key,
                    new_value: event.new_value,
                });
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("change notifier for {} lagged, missed {} events", key, n);
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::debug!("change notifier for {} shutting down (bus closed)", key);
                break;
            }
        }
    }
}
