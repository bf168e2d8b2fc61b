//! Shared descriptor snapshots and broadcast to remote contexts.
//!
//! ```text
//! SharedStatePropagator
//! ├── store: SnapshotStore
//! │   ├── pending:   ArcSwap<HashMap<id, SnapshotEntry>>   (not yet Running)
//! │   └── published: ArcSwap<HashMap<id, SnapshotEntry>>   (visible to readers)
//! └── hub: ContextHub
//!     └── contexts: HashMap<ContextId, Sender<Envelope>>
//! ```
//!
//! The owning extension is the only writer; remote contexts only read.
//! Every write replaces the whole map, so a reader sees either the old
//! descriptor or the new one and never a mix of the two.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};

use super::descriptor::ExtensionDescriptor;
use super::error::ExtensionResult;
use super::permissions::PermissionSet;

pub type ContextId = u64;

/// Notification sent to every connected context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BroadcastMessage {
    Startup {
        id: String,
    },
    UpdatePermissions {
        id: String,
        delta: PermissionSet,
        /// `true` for a grant, `false` for a revocation.
        added: bool,
    },
    Shutdown {
        id: String,
    },
}

impl BroadcastMessage {
    pub fn extension_id(&self) -> &str {
        match self {
            BroadcastMessage::Startup { id }
            | BroadcastMessage::UpdatePermissions { id, .. }
            | BroadcastMessage::Shutdown { id } => id,
        }
    }
}

/// A delivered message awaiting acknowledgment.
#[derive(Debug)]
pub struct Envelope {
    pub message: BroadcastMessage,
    ack: oneshot::Sender<()>,
}

impl Envelope {
    /// Report the message as handled.
    pub fn ack(self) {
        let _ = self.ack.send(());
    }
}

/// Result of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub acknowledged: Vec<ContextId>,
    /// Gone before acknowledging; counts as an acknowledgment.
    pub disconnected: Vec<ContextId>,
    /// Still pending when the timeout elapsed.
    pub timed_out: Vec<ContextId>,
}

impl BroadcastOutcome {
    pub fn is_complete(&self) -> bool {
        self.timed_out.is_empty()
    }
}

#[derive(Debug)]
pub struct SnapshotEntry {
    pub version: u64,
    pub bytes: Vec<u8>,
}

type Registry = ArcSwap<HashMap<String, Arc<SnapshotEntry>>>;

/// Pending and published descriptor registries.
#[derive(Default)]
pub struct SnapshotStore {
    pending: Registry,
    published: Registry,
    version: AtomicU64,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(registry: &Registry, id: &str, entry: Arc<SnapshotEntry>) {
        registry.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(id.to_string(), entry.clone());
            next
        });
    }

    fn remove_from(registry: &Registry, id: &str) -> Option<Arc<SnapshotEntry>> {
        let mut removed = None;
        registry.rcu(|current| {
            let mut next = HashMap::clone(current);
            removed = next.remove(id);
            next
        });
        removed
    }

    fn entry(&self, bytes: Vec<u8>) -> Arc<SnapshotEntry> {
        Arc::new(SnapshotEntry {
            version: self.version.fetch_add(1, Ordering::SeqCst) + 1,
            bytes,
        })
    }

    pub fn set_pending(&self, id: &str, bytes: Vec<u8>) -> u64 {
        let entry = self.entry(bytes);
        let version = entry.version;
        Self::insert(&self.pending, id, entry);
        version
    }

    pub fn set_published(&self, id: &str, bytes: Vec<u8>) -> u64 {
        let entry = self.entry(bytes);
        let version = entry.version;
        Self::insert(&self.published, id, entry);
        Self::remove_from(&self.pending, id);
        version
    }

    /// Move the pending entry into the published registry.
    pub fn promote(&self, id: &str) -> bool {
        match Self::remove_from(&self.pending, id) {
            Some(entry) => {
                Self::insert(&self.published, id, entry);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &str) {
        Self::remove_from(&self.pending, id);
        Self::remove_from(&self.published, id);
    }

    pub fn published(&self, id: &str) -> Option<Arc<SnapshotEntry>> {
        self.published.load().get(id).cloned()
    }

    pub fn pending(&self, id: &str) -> Option<Arc<SnapshotEntry>> {
        self.pending.load().get(id).cloned()
    }

    pub fn published_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.published.load().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Connected remote contexts.
pub struct ContextHub {
    contexts: Mutex<HashMap<ContextId, mpsc::UnboundedSender<Envelope>>>,
    next_id: AtomicU64,
    store: Arc<SnapshotStore>,
}

impl ContextHub {
    pub fn new(store: Arc<SnapshotStore>) -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            store,
        }
    }

    pub async fn connect(&self) -> RemoteContext {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.contexts.lock().await.insert(id, tx);
        tracing::debug!(context_id = id, "remote context connected");
        RemoteContext {
            id,
            receiver: rx,
            store: self.store.clone(),
        }
    }

    pub async fn connected(&self) -> usize {
        self.contexts.lock().await.len()
    }

    /// Deliver `message` to every connected context and wait for each to
    /// acknowledge or disconnect, up to `timeout` when one is given.
    pub async fn broadcast(
        &self,
        message: BroadcastMessage,
        timeout: Option<Duration>,
    ) -> BroadcastOutcome {
        let mut outcome = BroadcastOutcome::default();
        let mut waiting = FuturesUnordered::new();
        let mut remaining = HashSet::new();

        {
            let mut contexts = self.contexts.lock().await;
            contexts.retain(|&id, tx| {
                let (ack_tx, ack_rx) = oneshot::channel();
                let envelope = Envelope {
                    message: message.clone(),
                    ack: ack_tx,
                };
                if tx.send(envelope).is_err() {
                    outcome.disconnected.push(id);
                    return false;
                }
                remaining.insert(id);
                waiting.push(async move { (id, ack_rx.await.is_ok()) });
                true
            });
        }

        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, waiting.next()).await {
                    Ok(next) => next,
                    Err(_) => break,
                },
                None => waiting.next().await,
            };
            let Some((id, acked)) = next else {
                break;
            };
            remaining.remove(&id);
            if acked {
                outcome.acknowledged.push(id);
            } else {
                outcome.disconnected.push(id);
            }
        }

        outcome.timed_out = remaining.into_iter().collect();
        outcome.timed_out.sort_unstable();
        outcome
    }
}

/// A reader in another execution context.
pub struct RemoteContext {
    id: ContextId,
    receiver: mpsc::UnboundedReceiver<Envelope>,
    store: Arc<SnapshotStore>,
}

impl RemoteContext {
    pub fn id(&self) -> ContextId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }

    /// The published descriptor, if the extension is running.
    pub fn descriptor(&self, extension_id: &str) -> Option<ExtensionDescriptor> {
        let entry = self.store.published(extension_id)?;
        ExtensionDescriptor::from_bytes(&entry.bytes).ok()
    }

    /// Acknowledge every message as it arrives until the hub goes away.
    pub fn spawn_auto_ack(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(envelope) = self.recv().await {
                envelope.ack();
            }
        })
    }
}

/// Publishes descriptors and notifies remote contexts.
pub struct SharedStatePropagator {
    store: Arc<SnapshotStore>,
    hub: Arc<ContextHub>,
}

impl Default for SharedStatePropagator {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStatePropagator {
    pub fn new() -> Self {
        let store = Arc::new(SnapshotStore::new());
        let hub = Arc::new(ContextHub::new(store.clone()));
        Self { store, hub }
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<ContextHub> {
        &self.hub
    }

    /// Stage a descriptor for an extension that is not yet running.
    pub fn publish_pending(&self, descriptor: &ExtensionDescriptor) -> ExtensionResult<()> {
        self.store.set_pending(&descriptor.id, descriptor.to_bytes()?);
        Ok(())
    }

    /// Make the staged descriptor visible to readers.
    pub fn promote(&self, extension_id: &str) -> bool {
        self.store.promote(extension_id)
    }

    /// Replace the published descriptor of a running extension.
    pub fn publish(&self, descriptor: &ExtensionDescriptor) -> ExtensionResult<()> {
        let version = self.store.set_published(&descriptor.id, descriptor.to_bytes()?);
        tracing::debug!(extension_id = %descriptor.id, version, "published descriptor");
        Ok(())
    }

    pub fn retract(&self, extension_id: &str) {
        self.store.remove(extension_id);
    }

    pub fn published(&self, extension_id: &str) -> Option<ExtensionDescriptor> {
        let entry = self.store.published(extension_id)?;
        ExtensionDescriptor::from_bytes(&entry.bytes).ok()
    }

    pub fn pending(&self, extension_id: &str) -> Option<ExtensionDescriptor> {
        let entry = self.store.pending(extension_id)?;
        ExtensionDescriptor::from_bytes(&entry.bytes).ok()
    }

    pub async fn broadcast(
        &self,
        message: BroadcastMessage,
        timeout: Option<Duration>,
    ) -> BroadcastOutcome {
        self.hub.broadcast(message, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_is_invisible_until_promoted() {
        let store = SnapshotStore::new();
        store.set_pending("a", b"one".to_vec());
        assert!(store.published("a").is_none());
        assert!(store.pending("a").is_some());

        assert!(store.promote("a"));
        assert_eq!(store.published("a").unwrap().bytes, b"one");
        assert!(store.pending("a").is_none());
        assert!(!store.promote("a"));
    }

    #[test]
    fn test_whole_value_replacement() {
        let store = SnapshotStore::new();
        store.set_published("a", b"v1".to_vec());
        let held = store.published("a").unwrap();
        let v2 = store.set_published("a", b"v2".to_vec());

        // A reader holding the old entry keeps a consistent copy.
        assert_eq!(held.bytes, b"v1");
        assert_eq!(store.published("a").unwrap().version, v2);
        store.remove("a");
        assert!(store.published_ids().is_empty());
    }

    #[test]
    fn test_message_wire_names() {
        let message = BroadcastMessage::UpdatePermissions {
            id: "a".into(),
            delta: PermissionSet::default(),
            added: true,
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["kind"], "update-permissions");
        assert_eq!(message.extension_id(), "a");
    }

    #[tokio::test]
    async fn test_broadcast_acks_and_disconnects() {
        let hub = ContextHub::new(Arc::new(SnapshotStore::new()));
        let mut first = hub.connect().await;
        let second = hub.connect().await;
        let gone = hub.connect().await;
        drop(gone);

        let acker = tokio::spawn(async move {
            let envelope = first.recv().await.unwrap();
            assert_eq!(envelope.message, BroadcastMessage::Startup { id: "x".into() });
            envelope.ack();
            first
        });
        let second_task = second.spawn_auto_ack();

        let outcome = hub
            .broadcast(BroadcastMessage::Startup { id: "x".into() }, None)
            .await;
        assert_eq!(outcome.acknowledged.len(), 2);
        assert_eq!(outcome.disconnected.len(), 1);
        assert!(outcome.is_complete());
        assert_eq!(hub.connected().await, 2);

        drop(acker.await.unwrap());
        second_task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_timeout() {
        let hub = ContextHub::new(Arc::new(SnapshotStore::new()));
        let _silent = hub.connect().await;

        let started = tokio::time::Instant::now();
        let outcome = hub
            .broadcast(
                BroadcastMessage::Shutdown { id: "x".into() },
                Some(Duration::from_millis(8000)),
            )
            .await;
        assert_eq!(outcome.timed_out, vec![1]);
        assert!(started.elapsed() >= Duration::from_millis(8000));
    }
}
