// ── Shepherd facade ──
//
// Owns the registry, the correlator and the collaborators. Cheaply
// cloneable via `Arc<ShepherdInner>`; nodes hold a `Weak` back-reference.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ShepherdConfig;
use crate::correlation::{Correlator, Reply};
use crate::error::CoreError;
use crate::model::{DeviceId, ShepherdEvent};
use crate::node::DeviceNode;
use crate::registry::Registry;
use crate::store::DocumentStore;
use crate::transport::{InboundMessage, PassThrough, SecurityHooks, Transport};

// ── Shepherd ─────────────────────────────────────────────────────────

/// Device-management server for one broker connection.
#[derive(Clone)]
pub struct Shepherd {
    inner: Arc<ShepherdInner>,
}

pub(crate) struct ShepherdInner {
    pub(crate) config: ShepherdConfig,
    pub(crate) registry: Registry<DeviceNode>,
    pub(crate) correlator: Correlator,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) store: Arc<dyn DocumentStore>,
    pub(crate) hooks: Arc<dyn SecurityHooks>,
    event_tx: broadcast::Sender<Arc<ShepherdEvent>>,
    pub(crate) cancel: CancellationToken,
}

impl Shepherd {
    /// Create a shepherd with pass-through security hooks.
    pub fn new(
        config: ShepherdConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self::with_security(config, transport, store, Arc::new(PassThrough))
    }

    pub fn with_security(
        config: ShepherdConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn DocumentStore>,
        hooks: Arc<dyn SecurityHooks>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(ShepherdInner {
                config,
                registry: Registry::new(),
                correlator: Correlator::new(),
                transport,
                store,
                hooks,
                event_tx,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &ShepherdConfig {
        &self.inner.config
    }

    // ── Inbound ──────────────────────────────────────────────────────

    /// Handle one inbound message to completion.
    ///
    /// Flows that talk to the device wait for responses, which must arrive
    /// on another task; see [`spawn_dispatcher`](Self::spawn_dispatcher).
    pub async fn handle_message(&self, message: InboundMessage) {
        self.inner.dispatch(message).await;
    }

    /// Consume inbound messages until the channel closes or [`shutdown`](Self::shutdown).
    /// Every message is handled on its own task.
    pub fn spawn_dispatcher(&self, mut rx: mpsc::Receiver<InboundMessage>) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = inner.cancel.cancelled() => break,
                    message = rx.recv() => {
                        let Some(message) = message else { break };
                        let inner = Arc::clone(&inner);
                        tokio::spawn(async move { inner.dispatch(message).await });
                    }
                }
            }
            debug!("dispatcher stopped");
        })
    }

    // ── Registry ─────────────────────────────────────────────────────

    /// Rebuild the registry from the store after a restart.
    ///
    /// Restored nodes start Offline with their life checker armed.
    /// Returns the number of nodes restored.
    pub async fn load(&self) -> Result<usize, CoreError> {
        let ids = self.inner.store.export_all_device_ids().await?;
        let mut restored = 0;
        for id in ids {
            let Some(record) = self.inner.store.find_by_device_id(&id).await? else {
                continue;
            };
            let node = DeviceNode::from_record(&self.inner, record);
            if self
                .inner
                .registry
                .insert_if_absent(id.clone(), Arc::clone(&node))
                .is_err()
            {
                debug!(device_id = %id, "already registered, skipping restore");
                continue;
            }
            node.arm_life_checker().await;
            restored += 1;
        }
        info!(restored, "device registry restored");
        Ok(restored)
    }

    /// Deregister a device locally: timers off, record purged, events emitted.
    pub async fn remove(&self, device_id: &DeviceId) -> Result<(), CoreError> {
        let node = self
            .inner
            .registry
            .get(device_id)
            .ok_or_else(|| CoreError::not_found(format!("device {device_id}")))?;
        self.inner.depart(&node).await
    }

    pub fn find(&self, device_id: &DeviceId) -> Option<Arc<DeviceNode>> {
        self.inner.registry.get(device_id)
    }

    pub fn devices(&self) -> Vec<Arc<DeviceNode>> {
        self.inner.registry.values()
    }

    /// Watch the sorted set of registered device ids.
    pub fn device_ids(&self) -> watch::Receiver<Arc<Vec<DeviceId>>> {
        self.inner.registry.subscribe()
    }

    pub fn device_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Subscribe to the event broadcast stream.
    pub fn events(&self) -> broadcast::Receiver<Arc<ShepherdEvent>> {
        self.inner.event_tx.subscribe()
    }

    // ── Remote operation shortcuts ───────────────────────────────────

    pub async fn read(&self, device_id: &DeviceId, path: &str) -> Result<Reply, CoreError> {
        self.node(device_id)?.read(path).await
    }

    pub async fn write(
        &self,
        device_id: &DeviceId,
        path: &str,
        value: Value,
    ) -> Result<Reply, CoreError> {
        self.node(device_id)?.write(path, value).await
    }

    // ── Authorization passthrough ────────────────────────────────────

    pub fn authorize_connect(&self, client_id: &str, username: Option<&str>) -> bool {
        self.inner.hooks.authorize_connect(client_id, username)
    }

    pub fn authorize_subscribe(&self, client_id: &str, topic: &str) -> bool {
        self.inner.hooks.authorize_subscribe(client_id, topic)
    }

    /// Stop the dispatcher and every node's timers.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        for node in self.inner.registry.values() {
            self.inner.correlator.cancel_device(node.id());
        }
        info!("shepherd shut down");
    }

    fn node(&self, device_id: &DeviceId) -> Result<Arc<DeviceNode>, CoreError> {
        self.find(device_id).ok_or_else(|| CoreError::NotReady {
            device_id: device_id.clone(),
        })
    }
}

// ── ShepherdInner helpers ────────────────────────────────────────────

impl ShepherdInner {
    pub(crate) fn emit(&self, event: ShepherdEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(Arc::new(event));
    }

    /// Serialize, seal and publish one outbound body.
    pub(crate) async fn publish(
        &self,
        device_id: &DeviceId,
        topic: &str,
        body: &impl Serialize,
    ) -> Result<(), CoreError> {
        let json = serde_json::to_vec(body).map_err(|e| CoreError::Internal(e.to_string()))?;
        let payload = self.hooks.encrypt(device_id.as_str(), Bytes::from(json))?;
        self.transport.publish(topic, payload).await?;
        Ok(())
    }

    /// Tear a node down and forget it. Serialized with structural flows.
    pub(crate) async fn retire(&self, node: &Arc<DeviceNode>) -> Result<(), CoreError> {
        let _guard = node.lock_mutation().await;
        self.retire_locked(node).await
    }

    /// [`retire`](Self::retire) for a caller already holding the mutation lock.
    async fn retire_locked(&self, node: &Arc<DeviceNode>) -> Result<(), CoreError> {
        if !node.is_attached().await {
            return Err(CoreError::not_found(format!("device {}", node.id())));
        }
        node.teardown().await;
        self.registry.remove_if_same(node.id(), node);
        self.store.remove_by_device_id(node.id()).await?;
        Ok(())
    }

    /// The deregister path without a reply: retire, then announce.
    pub(crate) async fn depart(&self, node: &Arc<DeviceNode>) -> Result<(), CoreError> {
        let _guard = node.lock_mutation().await;
        self.depart_locked(node).await
    }

    pub(crate) async fn depart_locked(&self, node: &Arc<DeviceNode>) -> Result<(), CoreError> {
        if let Err(e) = self.retire_locked(node).await {
            warn!(device_id = %node.id(), error = %e, "device removal failed");
            return Err(e);
        }
        self.announce_departure(node.id());
        info!(device_id = %node.id(), "device removed");
        Ok(())
    }

    pub(crate) fn announce_departure(&self, device_id: &DeviceId) {
        self.emit(ShepherdEvent::Deregistered {
            device_id: device_id.clone(),
        });
        self.emit(ShepherdEvent::DeviceLeaving {
            device_id: device_id.clone(),
        });
    }
}
