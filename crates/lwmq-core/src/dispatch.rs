// ── Message dispatch ──
//
// One inbound message, one flow, one terminal reply. Each flow returns
// the status to reply with plus a follow-up (events, the maintenance
// sweep) that runs only after the reply is out. Register is a saga: any
// failed step after the node is inserted runs the single rollback.

use std::sync::Arc;

use chrono::Utc;
use futures_util::future::try_join_all;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::correlation::Reply;
use crate::diff::OBJ_LIST_KEY;
use crate::error::CoreError;
use crate::model::{
    AttributeChanges, DeviceAttributes, DeviceId, DeviceStatus, MacAddress, ObjectList,
    ResourcePath, ResourceTree, ShepherdEvent, StatusCode,
};
use crate::node::DeviceNode;
use crate::shepherd::ShepherdInner;
use crate::transport::InboundMessage;
use crate::wire::{
    self, Command, Interface, NotifyMessage, RegisterMessage, ReplyMessage, ResponseMessage,
    UpdateMessage,
};

/// Work left for after the reply has been published.
enum FollowUp {
    Nothing,
    Joined(DeviceId),
    Updated {
        node: Arc<DeviceNode>,
        diff: Map<String, Value>,
        sweep: bool,
    },
    Departed(DeviceId),
    Notified {
        device_id: DeviceId,
        path: ResourcePath,
        data: Value,
        changed: Option<(ResourcePath, Value)>,
    },
}

type FlowResult = Result<(StatusCode, FollowUp), CoreError>;

impl ShepherdInner {
    pub(crate) async fn dispatch(self: &Arc<Self>, message: InboundMessage) {
        let Some((interface, device_id)) = wire::classify(&message.topic) else {
            debug!(topic = %message.topic, "unhandled topic");
            self.emit(ShepherdEvent::Unhandled {
                topic: message.topic,
                payload: message.payload,
            });
            return;
        };

        if !self.hooks.authorize_publish(device_id.as_str(), &message.topic) {
            warn!(
                device_id = %device_id,
                topic = %message.topic,
                "publish not authorized, dropped"
            );
            return;
        }

        let body = self
            .hooks
            .decrypt(device_id.as_str(), message.payload)
            .map_err(CoreError::from)
            .and_then(|payload| {
                serde_json::from_slice::<Value>(&payload).map_err(CoreError::malformed)
            });
        let body = match body {
            Ok(body) => body,
            Err(e) => {
                warn!(
                    device_id = %device_id,
                    interface = %interface,
                    error = %e,
                    "unreadable payload"
                );
                if expects_reply(interface) {
                    self.reply(interface, &device_id, None, StatusCode::BadRequest)
                        .await;
                }
                return;
            }
        };

        debug!(device_id = %device_id, interface = %interface, "dispatching");
        match interface {
            Interface::Response => self.on_response(&device_id, body).await,
            Interface::Lwt => self.on_lwt(&device_id),
            _ => {
                let trans_id = wire::trans_id_of(&body);
                let result = match interface {
                    Interface::Register => match parse::<RegisterMessage>(body) {
                        Ok(msg) => self.on_register(&device_id, msg).await,
                        Err(e) => Err(e),
                    },
                    Interface::Update => match parse::<UpdateMessage>(body) {
                        Ok(msg) => self.on_update(&device_id, msg).await,
                        Err(e) => Err(e),
                    },
                    Interface::Deregister => self.on_deregister(&device_id).await,
                    Interface::Notify => match parse::<NotifyMessage>(body) {
                        Ok(msg) => self.on_notify(&device_id, msg).await,
                        Err(e) => Err(e),
                    },
                    _ => self.on_ping(&device_id).await,
                };
                self.settle(interface, &device_id, trans_id, result).await;
            }
        }
    }

    async fn settle(
        self: &Arc<Self>,
        interface: Interface,
        device_id: &DeviceId,
        trans_id: Option<u64>,
        result: FlowResult,
    ) {
        match result {
            Ok((status, follow_up)) => {
                self.reply(interface, device_id, trans_id, status).await;
                self.follow_up(follow_up);
            }
            Err(e) => {
                warn!(device_id = %device_id, interface = %interface, error = %e, "flow failed");
                self.reply(interface, device_id, trans_id, e.status_code())
                    .await;
            }
        }
    }

    async fn reply(
        &self,
        interface: Interface,
        device_id: &DeviceId,
        trans_id: Option<u64>,
        status: StatusCode,
    ) {
        let body = ReplyMessage { trans_id, status };
        let topic = wire::reply_topic(interface, device_id);
        if let Err(e) = self.publish(device_id, &topic, &body).await {
            warn!(device_id = %device_id, topic = %topic, error = %e, "reply not published");
        }
    }

    fn follow_up(&self, follow_up: FollowUp) {
        match follow_up {
            FollowUp::Nothing => {}
            FollowUp::Joined(device_id) => {
                self.emit(ShepherdEvent::Registered {
                    device_id: device_id.clone(),
                });
                self.emit(ShepherdEvent::DeviceIncoming { device_id });
            }
            FollowUp::Updated { node, diff, sweep } => {
                if !diff.is_empty() {
                    self.emit(ShepherdEvent::DeviceUpdated {
                        device_id: node.id().clone(),
                        diff: Value::Object(diff),
                    });
                }
                if sweep {
                    tokio::spawn(async move {
                        if let Err(e) = node.maintain().await {
                            debug!(device_id = %node.id(), error = %e, "maintenance sweep skipped");
                        }
                    });
                }
            }
            FollowUp::Departed(device_id) => self.announce_departure(&device_id),
            FollowUp::Notified {
                device_id,
                path,
                data,
                changed,
            } => {
                self.emit(ShepherdEvent::DeviceNotified {
                    device_id: device_id.clone(),
                    path,
                    data,
                });
                if let Some((scope, diff)) = changed {
                    self.emit(ShepherdEvent::ResourceChanged {
                        device_id,
                        path: scope,
                        diff,
                    });
                }
            }
        }
    }

    // ── Register ─────────────────────────────────────────────────────

    async fn on_register(
        self: &Arc<Self>,
        device_id: &DeviceId,
        msg: RegisterMessage,
    ) -> FlowResult {
        let mac = MacAddress::new(&msg.mac);
        let object_list = ObjectList::from_wire(&msg.obj_list, &self.config.catalog);
        let changes = AttributeChanges {
            lifetime_secs: Some(msg.lifetime),
            ip: msg.ip.clone(),
            version: msg.version.clone(),
            object_list: Some(object_list.clone()),
        };

        if let Some(existing) = self.registry.get(device_id) {
            return self.reregister(&existing, &mac, &changes).await;
        }

        let attributes = DeviceAttributes {
            lifetime_secs: msg.lifetime,
            ip: msg.ip,
            version: msg.version,
            object_list,
        };
        let node = DeviceNode::new(
            self,
            device_id.clone(),
            mac.clone(),
            attributes,
            Utc::now(),
            DeviceStatus::Offline,
        );

        // Locked before it is visible, so a racing update waits for the saga.
        let guard = node.lock_mutation().await;
        if let Err(existing) = self
            .registry
            .insert_if_absent(device_id.clone(), Arc::clone(&node))
        {
            drop(guard);
            return self.reregister(&existing, &mac, &changes).await;
        }

        match self.join(&node).await {
            Ok(()) => {
                drop(guard);
                info!(device_id = %device_id, mac = %mac, "device registered");
                Ok((StatusCode::Created, FollowUp::Joined(device_id.clone())))
            }
            Err(e) => {
                self.roll_back_join(&node).await;
                drop(guard);
                Err(CoreError::Internal(format!(
                    "registration of {device_id} rolled back: {e}"
                )))
            }
        }
    }

    /// Register for a known id: same hardware id means a chained update.
    async fn reregister(
        self: &Arc<Self>,
        existing: &Arc<DeviceNode>,
        mac: &MacAddress,
        changes: &AttributeChanges,
    ) -> FlowResult {
        if existing.mac() != mac {
            return Err(CoreError::Conflict {
                device_id: existing.id().clone(),
                expected: existing.mac().to_string(),
                got: mac.to_string(),
            });
        }
        let follow_up = self.update(existing, changes).await?;
        Ok((StatusCode::Ok, follow_up))
    }

    async fn join(&self, node: &Arc<DeviceNode>) -> Result<(), CoreError> {
        let oids: Vec<String> = node
            .attributes()
            .await
            .object_list
            .oids()
            .map(str::to_owned)
            .collect();
        let tree = fetch_tree(node, &oids).await?;
        node.bind_tree(tree).await;
        self.store.insert(&node.record().await).await?;
        node.set_registered(true).await;
        node.prove_liveness().await;
        Ok(())
    }

    async fn roll_back_join(&self, node: &Arc<DeviceNode>) {
        node.teardown().await;
        self.registry.remove_if_same(node.id(), node);
        if let Err(e) = self.store.remove_by_device_id(node.id()).await {
            warn!(device_id = %node.id(), error = %e, "rollback could not purge record");
        }
    }

    // ── Update ───────────────────────────────────────────────────────

    async fn on_update(self: &Arc<Self>, device_id: &DeviceId, msg: UpdateMessage) -> FlowResult {
        let node = self
            .registry
            .get(device_id)
            .ok_or_else(|| CoreError::not_found(format!("device {device_id}")))?;

        if let Some(raw) = &msg.mac {
            let mac = MacAddress::new(raw);
            if mac != *node.mac() {
                return Err(CoreError::Conflict {
                    device_id: device_id.clone(),
                    expected: node.mac().to_string(),
                    got: mac.to_string(),
                });
            }
        }

        let changes = AttributeChanges {
            lifetime_secs: msg.lifetime,
            ip: msg.ip,
            version: msg.version,
            object_list: msg
                .obj_list
                .map(|list| ObjectList::from_wire(&list, &self.config.catalog)),
        };
        let follow_up = self.update(&node, &changes).await?;
        Ok((StatusCode::Changed, follow_up))
    }

    async fn update(
        &self,
        node: &Arc<DeviceNode>,
        changes: &AttributeChanges,
    ) -> Result<FollowUp, CoreError> {
        let _guard = node.lock_mutation().await;
        if !node.is_attached().await {
            return Err(CoreError::not_found(format!("device {}", node.id())));
        }
        node.prove_liveness().await;

        let before = node.attributes().await;
        let diff = before.diff(changes)?;

        if !diff.contains_key(OBJ_LIST_KEY) {
            if !diff.is_empty() {
                node.apply_attributes(changes).await;
                let patch = Value::Object(diff.clone());
                if let Err(e) = self.store.patch_at_path(node.id(), "", &patch).await {
                    node.restore_attributes(before).await;
                    return Err(e.into());
                }
                node.arm_life_checker().await;
            }
            return Ok(FollowUp::Updated {
                node: Arc::clone(node),
                diff,
                sweep: true,
            });
        }

        // Object list changed: refetch and rebind the whole tree.
        let tree_before = node.tree().await;
        node.set_registered(false).await;
        let rebound = async {
            let oids: Vec<String> = changes
                .object_list
                .iter()
                .flat_map(|list| list.oids())
                .map(str::to_owned)
                .collect();
            let tree = fetch_tree(node, &oids).await?;
            node.apply_attributes(changes).await;
            node.bind_tree(tree).await;
            self.store.insert(&node.record().await).await?;
            Ok::<(), CoreError>(())
        }
        .await;

        match rebound {
            Ok(()) => {
                node.set_registered(true).await;
                node.arm_life_checker().await;
                info!(device_id = %node.id(), "object list rebound");
                Ok(FollowUp::Updated {
                    node: Arc::clone(node),
                    diff,
                    sweep: false,
                })
            }
            Err(e) => {
                node.restore(before, tree_before).await;
                Err(CoreError::Internal(format!(
                    "rebinding {} failed, previous state restored: {e}",
                    node.id()
                )))
            }
        }
    }

    // ── Deregister ───────────────────────────────────────────────────

    async fn on_deregister(&self, device_id: &DeviceId) -> FlowResult {
        let node = self
            .registry
            .get(device_id)
            .ok_or_else(|| CoreError::not_found(format!("device {device_id}")))?;
        self.retire(&node).await?;
        info!(device_id = %device_id, "device deregistered");
        Ok((StatusCode::Deleted, FollowUp::Departed(device_id.clone())))
    }

    // ── Notify ───────────────────────────────────────────────────────

    async fn on_notify(&self, device_id: &DeviceId, msg: NotifyMessage) -> FlowResult {
        let node = self
            .registry
            .get(device_id)
            .ok_or_else(|| CoreError::not_found(format!("device {device_id}")))?;
        if !node.has_tree().await {
            return Err(CoreError::not_found(format!("resource tree of {device_id}")));
        }
        node.prove_liveness().await;

        let catalog = &self.config.catalog;
        let oid = catalog.oid_key(&msg.oid.as_key());
        let path = match &msg.rid {
            Some(rid) => {
                let rid = catalog.rid_key(&oid, &rid.as_key());
                ResourcePath::resource(oid, msg.iid, rid)
            }
            None => ResourcePath::instance(oid, msg.iid),
        };

        let changed = node.apply_at(&path, &msg.data).await?;
        Ok((
            StatusCode::Changed,
            FollowUp::Notified {
                device_id: device_id.clone(),
                path,
                data: msg.data,
                changed,
            },
        ))
    }

    // ── Response / ping / lwt ────────────────────────────────────────

    async fn on_response(&self, device_id: &DeviceId, body: Value) {
        let msg = match parse::<ResponseMessage>(body) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(device_id = %device_id, error = %e, "malformed response dropped");
                return;
            }
        };
        let Some(command) = Command::from_code(msg.cmd_id) else {
            debug!(
                device_id = %device_id,
                cmd_id = msg.cmd_id,
                "response for unknown command dropped"
            );
            return;
        };

        let good = msg.status.is_good();
        let reply = Reply::new(msg.status, msg.data);
        if !self.correlator.deliver(device_id, command, msg.trans_id, reply) {
            debug!(
                device_id = %device_id,
                command = %command,
                trans_id = msg.trans_id,
                "unmatched response dropped"
            );
            return;
        }
        // Fetches of a node still joining do not count as liveness.
        if good {
            if let Some(node) = self.registry.get(device_id) {
                if node.is_registered().await {
                    node.prove_liveness().await;
                }
            }
        }
    }

    async fn on_ping(&self, device_id: &DeviceId) -> FlowResult {
        let node = self
            .registry
            .get(device_id)
            .ok_or_else(|| CoreError::not_found(format!("device {device_id}")))?;
        node.prove_liveness().await;
        Ok((StatusCode::Ok, FollowUp::Nothing))
    }

    fn on_lwt(&self, device_id: &DeviceId) {
        if let Some(node) = self.registry.get(device_id) {
            node.set_status(DeviceStatus::Offline);
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn expects_reply(interface: Interface) -> bool {
    !matches!(interface, Interface::Response | Interface::Lwt)
}

fn parse<T: DeserializeOwned>(body: Value) -> Result<T, CoreError> {
    serde_json::from_value(body).map_err(CoreError::malformed)
}

/// Fetch every object concurrently; the first failure aborts the rest.
async fn fetch_tree(node: &DeviceNode, oids: &[String]) -> Result<ResourceTree, CoreError> {
    let objects = try_join_all(oids.iter().map(|oid| node.fetch_object(oid))).await?;
    let mut tree = ResourceTree::new();
    for (oid, instances) in oids.iter().zip(objects) {
        tree.bind(oid.clone(), instances);
    }
    Ok(tree)
}
