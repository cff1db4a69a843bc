// ── Device node ──
//
// In-memory representative of one remote device: attributes, mirrored
// resource tree, liveness status and timers. Remote operations go out
// through the correlator and fold good replies back into the tree.
//
// Locking: `state` is never held across a remote round trip. `mutation`
// serializes structural flows (register, update, deregister, expiry).

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, MutexGuard, RwLock, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::correlation::Reply;
use crate::diff;
use crate::error::CoreError;
use crate::liveness::{LivenessTimers, SleepLadder};
use crate::model::tree::{instance_from_payload, object_from_payload};
use crate::model::{
    AttributeChanges, DeviceAttributes, DeviceId, DeviceRecord, DeviceStatus, MacAddress,
    ObjectInstances, ResourcePath, ResourceTree, ShepherdEvent,
};
use crate::shepherd::ShepherdInner;
use crate::wire::{self, Command, RequestMessage};

/// Attribute keys accepted by `write_attrs`.
pub const NOTIFY_ATTRIBUTES: [&str; 6] = ["pmin", "pmax", "gt", "lt", "stp", "cancel"];

struct NodeState {
    attributes: DeviceAttributes,
    tree: Option<ResourceTree>,
    registered: bool,
    attached: bool,
}

pub struct DeviceNode {
    id: DeviceId,
    mac: MacAddress,
    join_epoch: DateTime<Utc>,
    state: RwLock<NodeState>,
    mutation: Mutex<()>,
    status: watch::Sender<DeviceStatus>,
    timers: LivenessTimers,
    shepherd: Weak<ShepherdInner>,
}

impl std::fmt::Debug for DeviceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceNode")
            .field("id", &self.id)
            .field("mac", &self.mac)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl DeviceNode {
    pub(crate) fn new(
        shepherd: &Arc<ShepherdInner>,
        id: DeviceId,
        mac: MacAddress,
        attributes: DeviceAttributes,
        join_epoch: DateTime<Utc>,
        status: DeviceStatus,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(status);
        Arc::new(Self {
            id,
            mac,
            join_epoch,
            state: RwLock::new(NodeState {
                attributes,
                tree: None,
                registered: false,
                attached: true,
            }),
            mutation: Mutex::new(()),
            status,
            timers: LivenessTimers::new(shepherd.cancel.child_token()),
            shepherd: Arc::downgrade(shepherd),
        })
    }

    /// Rebuild a registered node from its persisted record. Starts Offline.
    pub(crate) fn from_record(shepherd: &Arc<ShepherdInner>, record: DeviceRecord) -> Arc<Self> {
        let attributes = DeviceAttributes {
            lifetime_secs: record.lifetime_secs,
            ip: record.ip,
            version: record.version,
            object_list: record.object_list,
        };
        let (status, _) = watch::channel(DeviceStatus::Offline);
        Arc::new(Self {
            id: record.device_id,
            mac: record.mac,
            join_epoch: record.join_epoch,
            state: RwLock::new(NodeState {
                attributes,
                tree: Some(record.resource_tree),
                registered: true,
                attached: true,
            }),
            mutation: Mutex::new(()),
            status,
            timers: LivenessTimers::new(shepherd.cancel.child_token()),
            shepherd: Arc::downgrade(shepherd),
        })
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn mac(&self) -> &MacAddress {
        &self.mac
    }

    pub fn join_epoch(&self) -> DateTime<Utc> {
        self.join_epoch
    }

    pub fn status(&self) -> DeviceStatus {
        *self.status.borrow()
    }

    /// Subscribe to status transitions.
    pub fn status_watch(&self) -> watch::Receiver<DeviceStatus> {
        self.status.subscribe()
    }

    pub async fn attributes(&self) -> DeviceAttributes {
        self.state.read().await.attributes.clone()
    }

    /// Snapshot of the mirrored tree; `None` until bound.
    pub async fn tree(&self) -> Option<ResourceTree> {
        self.state.read().await.tree.clone()
    }

    pub async fn is_registered(&self) -> bool {
        self.state.read().await.registered
    }

    /// The node as a persistable record.
    pub async fn record(&self) -> DeviceRecord {
        let state = self.state.read().await;
        DeviceRecord {
            device_id: self.id.clone(),
            lifetime_secs: state.attributes.lifetime_secs,
            ip: state.attributes.ip.clone(),
            mac: self.mac.clone(),
            version: state.attributes.version.clone(),
            join_epoch: self.join_epoch,
            object_list: state.attributes.object_list.clone(),
            resource_tree: state.tree.clone().unwrap_or_default(),
        }
    }

    // ── Remote operations ────────────────────────────────────────────

    /// Read an object, instance or resource and mirror the result.
    pub async fn read(&self, path: &str) -> Result<Reply, CoreError> {
        let path = self.parse(path)?;
        let reply = self.request(Command::Read, Some(&path), None).await?;
        self.absorb(&path, &reply).await?;
        Ok(reply)
    }

    /// Write an instance record or a resource value.
    ///
    /// The target must already exist in the mirror and may not gain new keys.
    pub async fn write(&self, path: &str, value: Value) -> Result<Reply, CoreError> {
        let path = self.parse(path)?;
        if path.iid.is_none() {
            return Err(CoreError::Validation {
                message: format!("write to {path} needs an instance id"),
            });
        }
        self.ensure_ready().await?;
        self.check_writable(&path, &value).await?;

        let reply = self
            .request(Command::Write, Some(&path), Some(value.clone()))
            .await?;
        if reply.is_good() {
            let applied = reply.data.clone().unwrap_or(value);
            self.mirror(&path, &applied).await?;
        }
        Ok(reply)
    }

    pub async fn discover(&self, path: &str) -> Result<Reply, CoreError> {
        let path = self.parse(path)?;
        self.request(Command::Discover, Some(&path), None).await
    }

    /// Set notification attributes (`pmin`, `pmax`, `gt`, `lt`, `stp`, `cancel`).
    pub async fn write_attrs(
        &self,
        path: &str,
        attrs: Map<String, Value>,
    ) -> Result<Reply, CoreError> {
        let path = self.parse(path)?;
        if let Some(bad) = attrs.keys().find(|k| !NOTIFY_ATTRIBUTES.contains(&k.as_str())) {
            return Err(CoreError::Validation {
                message: format!("unsupported notification attribute {bad:?}"),
            });
        }
        self.request(Command::WriteAttrs, Some(&path), Some(Value::Object(attrs)))
            .await
    }

    pub async fn execute(&self, path: &str, args: Option<Value>) -> Result<Reply, CoreError> {
        let path = self.parse(path)?;
        if path.rid.is_none() {
            return Err(CoreError::Validation {
                message: format!("execute on {path} needs a resource id"),
            });
        }
        self.request(Command::Execute, Some(&path), args).await
    }

    /// Start observing `path`; the initial value is mirrored like a read.
    pub async fn observe(&self, path: &str) -> Result<Reply, CoreError> {
        let path = self.parse(path)?;
        let reply = self.request(Command::Observe, Some(&path), None).await?;
        self.absorb(&path, &reply).await?;
        Ok(reply)
    }

    pub async fn identify(&self) -> Result<Reply, CoreError> {
        self.request(Command::Identify, None, None).await
    }

    /// Round trip with the regular deadline. `data` carries the latency in ms.
    pub async fn ping(&self) -> Result<Reply, CoreError> {
        let timeout = self.shepherd()?.config.request_timeout;
        self.timed_ping(timeout).await
    }

    /// Round trip with the short probe deadline.
    pub async fn quick_ping(&self) -> Result<Reply, CoreError> {
        let timeout = self.shepherd()?.config.quick_ping_timeout;
        self.timed_ping(timeout).await
    }

    /// Read every declared instance; Offline if none answered, Online otherwise.
    pub async fn maintain(&self) -> Result<DeviceStatus, CoreError> {
        self.ensure_ready().await?;
        let timeout = self.shepherd()?.config.request_timeout;
        let paths: Vec<ResourcePath> = self
            .attributes()
            .await
            .object_list
            .pairs()
            .into_iter()
            .map(|(oid, iid)| ResourcePath::instance(oid, iid))
            .collect();
        if paths.is_empty() {
            return Ok(self.status());
        }

        let results = join_all(
            paths
                .iter()
                .map(|path| self.exchange(Command::Read, Some(path), None, timeout)),
        )
        .await;

        let all_timed_out = results
            .iter()
            .all(|r| r.as_ref().is_err_and(CoreError::is_timeout));
        for (path, result) in paths.iter().zip(results) {
            if let Ok(reply) = result {
                if let Err(e) = self.absorb(path, &reply).await {
                    warn!(
                        device_id = %self.id,
                        path = %path,
                        error = %e,
                        "sweep result not mirrored"
                    );
                }
            }
        }

        let status = if all_timed_out {
            DeviceStatus::Offline
        } else {
            DeviceStatus::Online
        };
        self.set_status(status);
        Ok(status)
    }

    /// Mark the device asleep for `duration` and arm the sleep ladder.
    pub async fn enter_sleep(self: &Arc<Self>, duration: Duration) -> Result<(), CoreError> {
        self.ensure_ready().await?;
        let inner = self.shepherd()?;
        let ladder = SleepLadder {
            margin: inner.config.sleep_margin,
            retry_interval: inner.config.sleep_retry_interval,
            attempts: inner.config.sleep_probe_attempts,
        };
        self.set_status(DeviceStatus::Sleep);
        self.timers.arm_sleep(self, duration, ladder);
        Ok(())
    }

    /// `true` while the sleep ladder is armed.
    pub fn sleep_checker_armed(&self) -> bool {
        self.timers.sleep_armed()
    }

    // ── Crate-internal lifecycle ─────────────────────────────────────

    pub(crate) async fn lock_mutation(&self) -> MutexGuard<'_, ()> {
        self.mutation.lock().await
    }

    pub(crate) async fn is_attached(&self) -> bool {
        self.state.read().await.attached
    }

    pub(crate) async fn has_tree(&self) -> bool {
        self.state.read().await.tree.is_some()
    }

    pub(crate) async fn set_registered(&self, registered: bool) {
        self.state.write().await.registered = registered;
    }

    pub(crate) async fn bind_tree(&self, tree: ResourceTree) {
        self.state.write().await.tree = Some(tree);
    }

    pub(crate) async fn apply_attributes(&self, changes: &AttributeChanges) {
        self.state.write().await.attributes.apply(changes);
    }

    pub(crate) async fn restore_attributes(&self, attributes: DeviceAttributes) {
        self.state.write().await.attributes = attributes;
    }

    /// Put back a snapshot taken before a failed structural update.
    pub(crate) async fn restore(&self, attributes: DeviceAttributes, tree: Option<ResourceTree>) {
        let mut state = self.state.write().await;
        state.attributes = attributes;
        state.tree = tree;
        state.registered = true;
    }

    /// Disarm timers, unbind the tree and cancel in-flight requests.
    pub(crate) async fn teardown(&self) {
        self.timers.shutdown();
        {
            let mut state = self.state.write().await;
            state.attached = false;
            state.registered = false;
            state.tree = None;
        }
        if let Some(inner) = self.shepherd.upgrade() {
            inner.correlator.cancel_device(&self.id);
        }
    }

    /// Move to `status`, emitting one event per real transition.
    pub(crate) fn set_status(&self, status: DeviceStatus) -> bool {
        if status != DeviceStatus::Sleep {
            self.timers.cancel_sleep();
        }
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            debug!(device_id = %self.id, status = %status, "status changed");
            if let Some(inner) = self.shepherd.upgrade() {
                inner.emit(ShepherdEvent::StatusChanged {
                    device_id: self.id.clone(),
                    status,
                });
            }
        }
        changed
    }

    /// The device showed signs of life: Online, and the lifetime restarts.
    pub(crate) async fn prove_liveness(self: &Arc<Self>) {
        self.set_status(DeviceStatus::Online);
        self.arm_life_checker().await;
    }

    pub(crate) async fn arm_life_checker(self: &Arc<Self>) {
        let (armed, lifetime) = {
            let state = self.state.read().await;
            (
                state.registered && state.attached,
                state.attributes.lifetime_secs,
            )
        };
        if armed {
            self.timers.arm_life(self, Duration::from_secs(lifetime));
        }
    }

    /// Lifetime ran out: take the deregister path without a reply.
    ///
    /// `timer` is the token of the firing life checker. Once the mutation
    /// lock is held, a cancelled token means a structural flow renewed the
    /// lifetime while expiry was waiting, and the device stays.
    pub(crate) async fn expire(
        self: &Arc<Self>,
        timer: &CancellationToken,
    ) -> Result<(), CoreError> {
        let inner = self.shepherd()?;
        let _guard = self.lock_mutation().await;
        if timer.is_cancelled() {
            debug!(device_id = %self.id, "lifetime renewed before expiry ran");
            return Ok(());
        }
        inner.depart_locked(self).await
    }

    /// Fetch the full detail of one object during (re)registration.
    pub(crate) async fn fetch_object(&self, oid: &str) -> Result<ObjectInstances, CoreError> {
        let inner = self.shepherd()?;
        let path = ResourcePath::object(oid);
        let reply = self
            .exchange(Command::Read, Some(&path), None, inner.config.request_timeout)
            .await?;
        if !reply.is_good() {
            return Err(CoreError::Rejected {
                device_id: self.id.clone(),
                command: Command::Read,
                status: reply.status,
            });
        }
        let data = reply
            .data
            .ok_or_else(|| CoreError::malformed(format!("read of {oid} returned no data")))?;
        object_from_payload(&inner.config.catalog, oid, &data)
    }

    /// Low-deadline ping with no status side effects.
    pub(crate) async fn probe(&self) -> Result<Reply, CoreError> {
        let timeout = self.shepherd()?.config.quick_ping_timeout;
        self.exchange(Command::Ping, None, None, timeout).await
    }

    /// Fold `data` into the tree at `path` and persist the result.
    ///
    /// Returns the changed scope and its sparse diff, `None` when nothing
    /// changed. A resource change is scoped to its instance, keyed by rid.
    pub(crate) async fn apply_at(
        &self,
        path: &ResourcePath,
        data: &Value,
    ) -> Result<Option<(ResourcePath, Value)>, CoreError> {
        let inner = self.shepherd()?;
        let catalog = &inner.config.catalog;

        let (changed, current, previous) = {
            let mut state = self.state.write().await;
            let tree = state.tree.as_mut().ok_or_else(|| self.not_ready())?;
            let previous = tree.object(&path.oid).cloned();
            let changed = match (path.iid, path.rid.as_deref()) {
                (Some(iid), Some(rid)) => tree
                    .patch_resource(&path.oid, iid, rid, data)?
                    .into_value()
                    .map(|delta| {
                        let mut scoped = Map::new();
                        scoped.insert(rid.to_owned(), delta);
                        (ResourcePath::instance(path.oid.clone(), iid), Value::Object(scoped))
                    }),
                (Some(iid), None) => {
                    let values = instance_from_payload(catalog, &path.oid, data)?;
                    non_empty(tree.patch_instance(&path.oid, iid, &values)?)
                        .map(|diff| (path.clone(), diff))
                }
                (None, _) => {
                    let values = object_from_payload(catalog, &path.oid, data)?;
                    non_empty(tree.patch_object(&path.oid, &values)?)
                        .map(|diff| (path.clone(), diff))
                }
            };
            let Some(changed) = changed else {
                return Ok(None);
            };
            (changed, tree.get(path), previous)
        };

        if let Some(current) = current {
            if let Err(e) = inner
                .store
                .replace_at_path(&self.id, &path.store_path(), current)
                .await
            {
                self.put_back(&path.oid, previous).await;
                return Err(e.into());
            }
        }
        Ok(Some(changed))
    }

    /// Undo an unpersisted patch by rebinding the object's prior instances.
    async fn put_back(&self, oid: &str, previous: Option<ObjectInstances>) {
        let mut state = self.state.write().await;
        if let (Some(tree), Some(instances)) = (state.tree.as_mut(), previous) {
            tree.bind(oid.to_owned(), instances);
        }
    }

    // ── Private helpers ──────────────────────────────────────────────

    fn shepherd(&self) -> Result<Arc<ShepherdInner>, CoreError> {
        self.shepherd.upgrade().ok_or_else(|| self.not_ready())
    }

    fn not_ready(&self) -> CoreError {
        CoreError::NotReady {
            device_id: self.id.clone(),
        }
    }

    fn parse(&self, raw: &str) -> Result<ResourcePath, CoreError> {
        self.shepherd()?.config.catalog.parse_path(raw)
    }

    async fn ensure_ready(&self) -> Result<(), CoreError> {
        let state = self.state.read().await;
        if state.attached && state.registered && state.tree.is_some() {
            Ok(())
        } else {
            Err(self.not_ready())
        }
    }

    async fn check_writable(&self, path: &ResourcePath, value: &Value) -> Result<(), CoreError> {
        let inner = self.shepherd()?;
        let state = self.state.read().await;
        let tree = state.tree.as_ref().ok_or_else(|| self.not_ready())?;
        let current = tree
            .get(path)
            .ok_or_else(|| CoreError::not_found(format!("{path} on {}", self.id)))?;

        let candidate = if path.rid.is_some() {
            value.clone()
        } else {
            Value::Object(instance_from_payload(&inner.config.catalog, &path.oid, value)?)
        };
        if let (Value::Object(target), Value::Object(candidate)) = (&current, &candidate) {
            if let Some(bad) = diff::invalid_paths_of(target, candidate).first() {
                return Err(CoreError::UnknownProperty {
                    path: format!("{path}/{bad}"),
                });
            }
        }
        Ok(())
    }

    /// Ready check, reachability check, round trip, timeout bookkeeping.
    async fn request(
        &self,
        command: Command,
        path: Option<&ResourcePath>,
        data: Option<Value>,
    ) -> Result<Reply, CoreError> {
        let timeout = self.shepherd()?.config.request_timeout;
        self.request_within(command, path, data, timeout).await
    }

    async fn request_within(
        &self,
        command: Command,
        path: Option<&ResourcePath>,
        data: Option<Value>,
        timeout: Duration,
    ) -> Result<Reply, CoreError> {
        self.ensure_ready().await?;
        if self.status() == DeviceStatus::Offline {
            return Err(CoreError::Unreachable {
                device_id: self.id.clone(),
            });
        }

        let result = self.exchange(command, path, data, timeout).await;
        let timed_out = result.as_ref().is_err_and(CoreError::is_timeout);
        if timed_out && self.status() != DeviceStatus::Sleep {
            self.set_status(DeviceStatus::Offline);
        }
        result
    }

    async fn timed_ping(&self, timeout: Duration) -> Result<Reply, CoreError> {
        let started = Instant::now();
        let reply = self.request_within(Command::Ping, None, None, timeout).await?;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(Reply::new(reply.status, Some(Value::from(elapsed_ms))))
    }

    /// Publish one request and wait for its reply. No status side effects.
    async fn exchange(
        &self,
        command: Command,
        path: Option<&ResourcePath>,
        data: Option<Value>,
        timeout: Duration,
    ) -> Result<Reply, CoreError> {
        let inner = self.shepherd()?;
        let ticket = inner.correlator.open(&self.id, command)?;
        let trans_id = ticket.trans_id();
        let message = RequestMessage::new(&inner.config.catalog, trans_id, command, path, data);

        debug!(device_id = %self.id, command = %command, trans_id, "sending request");
        if let Err(e) = inner
            .publish(&self.id, &wire::request_topic(&self.id), &message)
            .await
        {
            ticket.abandon();
            return Err(e);
        }
        ticket.wait(timeout).await
    }

    /// Mirror the data of a good reply.
    async fn absorb(&self, path: &ResourcePath, reply: &Reply) -> Result<(), CoreError> {
        match (&reply.data, reply.is_good()) {
            (Some(data), true) => self.mirror(path, data).await,
            _ => Ok(()),
        }
    }

    async fn mirror(&self, path: &ResourcePath, data: &Value) -> Result<(), CoreError> {
        if let Some((scope, diff)) = self.apply_at(path, data).await? {
            if let Some(inner) = self.shepherd.upgrade() {
                inner.emit(ShepherdEvent::ResourceChanged {
                    device_id: self.id.clone(),
                    path: scope,
                    diff,
                });
            }
        }
        Ok(())
    }
}

fn non_empty(map: Map<String, Value>) -> Option<Value> {
    (!map.is_empty()).then_some(Value::Object(map))
}
