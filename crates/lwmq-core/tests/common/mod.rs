// Shared harness for the integration tests: a scripted in-process
// transport that plays the device side of every request.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use lwmq_core::{
    Catalog, DeviceId, DeviceRecord, DocumentStore, InboundMessage, MemoryStore, Shepherd,
    ShepherdConfig, ShepherdEvent, StoreError, Transport, TransportError,
};

pub const MAC: &str = "aa:bb:cc:dd:ee:ff";

// ── Device script ───────────────────────────────────────────────────

/// What the simulated device does with one request.
pub enum Reaction {
    Answer(u16, Option<Value>),
    Ignore,
}

pub type Script = Arc<dyn Fn(&Value) -> Reaction + Send + Sync>;

/// A well-behaved device holding `objects` (`oid -> iid -> rid -> value`).
///
/// Reads and observes answer from `objects`, writes echo the written
/// value, everything else is acknowledged.
pub fn device(objects: Value) -> Script {
    Arc::new(move |req| match cmd_of(req) {
        0 | 5 => match lookup(&objects, req) {
            Some(data) => Reaction::Answer(205, Some(data)),
            None => Reaction::Answer(404, None),
        },
        1 => Reaction::Answer(204, req.get("data").cloned()),
        3 => Reaction::Answer(204, None),
        _ => Reaction::Answer(200, None),
    })
}

/// Like [`device`], but object `failing_oid` answers reads with 500.
pub fn device_failing_on(objects: Value, failing_oid: u64) -> Script {
    let inner = device(objects);
    Arc::new(move |req| {
        if cmd_of(req) == 0 && req.get("oid").and_then(Value::as_u64) == Some(failing_oid) {
            Reaction::Answer(500, None)
        } else {
            inner(req)
        }
    })
}

pub fn cmd_of(req: &Value) -> u64 {
    req.get("cmdId").and_then(Value::as_u64).unwrap_or(u64::MAX)
}

fn key_of(v: &Value) -> Option<String> {
    match v {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn lookup(objects: &Value, req: &Value) -> Option<Value> {
    let mut at = objects.get(key_of(req.get("oid")?)?)?;
    if let Some(iid) = req.get("iid") {
        at = at.get(key_of(iid)?)?;
        if let Some(rid) = req.get("rid") {
            at = at.get(key_of(rid)?)?;
        }
    }
    Some(at.clone())
}

/// The `objList` a device holding `objects` would declare.
pub fn obj_list(objects: &Value) -> Value {
    let mut list = Map::new();
    for (oid, instances) in objects.as_object().into_iter().flatten() {
        let iids: Vec<u16> = instances
            .as_object()
            .into_iter()
            .flatten()
            .filter_map(|(iid, _)| iid.parse().ok())
            .collect();
        list.insert(oid.clone(), json!(iids));
    }
    Value::Object(list)
}

// ── Scripted transport ──────────────────────────────────────────────

pub struct ScriptedTransport {
    script: Mutex<Script>,
    inbound: mpsc::Sender<InboundMessage>,
    requests: Mutex<Vec<(String, Value)>>,
    replies: mpsc::UnboundedSender<(String, Value)>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        let body: Value =
            serde_json::from_slice(&payload).map_err(|e| TransportError::Publish {
                topic: topic.to_owned(),
                message: e.to_string(),
            })?;

        let Some(device_id) = topic.strip_prefix("request/") else {
            let _ = self.replies.send((topic.to_owned(), body));
            return Ok(());
        };

        self.requests
            .lock()
            .unwrap()
            .push((device_id.to_owned(), body.clone()));
        let script = Arc::clone(&self.script.lock().unwrap());
        if let Reaction::Answer(status, data) = script(&body) {
            let mut response = json!({
                "transId": body["transId"],
                "cmdId": body["cmdId"],
                "status": status,
            });
            if let Some(data) = data {
                response["data"] = data;
            }
            let message = InboundMessage::new(
                format!("response/{device_id}"),
                serde_json::to_vec(&response).unwrap(),
            );
            self.inbound
                .send(message)
                .await
                .map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }
}

// ── Failing store ───────────────────────────────────────────────────

/// A [`MemoryStore`] whose writes can be switched to fail one kind at a time.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: Arc<MemoryStore>,
    pub fail_insert: AtomicBool,
    pub fail_replace: AtomicBool,
    pub fail_patch: AtomicBool,
}

impl FlakyStore {
    fn check(flag: &AtomicBool, op: &str) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::Backend(format!("{op} refused")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn insert(&self, record: &DeviceRecord) -> Result<(), StoreError> {
        Self::check(&self.fail_insert, "insert")?;
        self.inner.insert(record).await
    }

    async fn find_by_device_id(
        &self,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceRecord>, StoreError> {
        self.inner.find_by_device_id(device_id).await
    }

    async fn remove_by_device_id(&self, device_id: &DeviceId) -> Result<bool, StoreError> {
        self.inner.remove_by_device_id(device_id).await
    }

    async fn replace_at_path(
        &self,
        device_id: &DeviceId,
        path: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        Self::check(&self.fail_replace, "replace")?;
        self.inner.replace_at_path(device_id, path, value).await
    }

    async fn patch_at_path(
        &self,
        device_id: &DeviceId,
        path: &str,
        value: &Value,
    ) -> Result<Map<String, Value>, StoreError> {
        Self::check(&self.fail_patch, "patch")?;
        self.inner.patch_at_path(device_id, path, value).await
    }

    async fn export_all_device_ids(&self) -> Result<Vec<DeviceId>, StoreError> {
        self.inner.export_all_device_ids().await
    }
}

// ── Harness ─────────────────────────────────────────────────────────

/// Test config: the empty catalog, so tree keys are the raw ids.
pub fn config() -> ShepherdConfig {
    ShepherdConfig {
        catalog: Catalog::new(),
        ..ShepherdConfig::default()
    }
}

pub struct Harness {
    pub shepherd: Shepherd,
    pub store: Arc<MemoryStore>,
    transport: Arc<ScriptedTransport>,
    inbound: mpsc::Sender<InboundMessage>,
    replies: mpsc::UnboundedReceiver<(String, Value)>,
    _pump: JoinHandle<()>,
}

impl Harness {
    pub fn new(script: Script) -> Self {
        Self::build(config(), Arc::new(MemoryStore::new()), script)
    }

    pub fn build(config: ShepherdConfig, store: Arc<MemoryStore>, script: Script) -> Self {
        Self::build_with(config, Arc::clone(&store), store, script)
    }

    /// Harness backed by a [`FlakyStore`]; `store` still inspects its contents.
    pub fn flaky(script: Script) -> (Self, Arc<FlakyStore>) {
        let flaky = Arc::new(FlakyStore::default());
        let harness = Self::build_with(config(), Arc::clone(&flaky.inner), flaky.clone(), script);
        (harness, flaky)
    }

    fn build_with(
        config: ShepherdConfig,
        store: Arc<MemoryStore>,
        backend: Arc<dyn DocumentStore>,
        script: Script,
    ) -> Self {
        let (inbound, rx) = mpsc::channel(256);
        let (replies_tx, replies) = mpsc::unbounded_channel();
        let transport = Arc::new(ScriptedTransport {
            script: Mutex::new(script),
            inbound: inbound.clone(),
            requests: Mutex::new(Vec::new()),
            replies: replies_tx,
        });
        let shepherd = Shepherd::new(config, transport.clone(), backend);
        let pump = shepherd.spawn_dispatcher(rx);
        Self {
            shepherd,
            store,
            transport,
            inbound,
            replies,
            _pump: pump,
        }
    }

    pub fn set_script(&self, script: Script) {
        *self.transport.script.lock().unwrap() = script;
    }

    /// Feed one inbound message through the dispatcher.
    pub async fn send(&self, topic: &str, body: Value) {
        self.send_raw(topic, serde_json::to_vec(&body).unwrap())
            .await;
    }

    pub async fn send_raw(&self, topic: &str, payload: Vec<u8>) {
        self.inbound
            .send(InboundMessage::new(topic, payload))
            .await
            .unwrap();
    }

    /// Next reply published by the shepherd, as `(topic, body)`.
    pub async fn next_reply(&mut self) -> (String, Value) {
        tokio::time::timeout(Duration::from_secs(30), self.replies.recv())
            .await
            .expect("no reply within deadline")
            .expect("reply channel closed")
    }

    /// Send and wait for the terminal reply.
    pub async fn exchange(&mut self, topic: &str, body: Value) -> (String, Value) {
        self.send(topic, body).await;
        self.next_reply().await
    }

    /// Register `id` as a device holding `objects`; returns the reply body.
    pub async fn register(&mut self, id: &str, objects: &Value, lifetime: u64) -> Value {
        let body = json!({
            "transId": 1,
            "mac": MAC,
            "lifetime": lifetime,
            "objList": obj_list(objects),
        });
        let (topic, reply) = self.exchange(&format!("register/{id}"), body).await;
        assert_eq!(topic, format!("register/response/{id}"));
        reply
    }

    /// Every request published so far, as `(device id, body)`.
    pub fn requests(&self) -> Vec<(String, Value)> {
        self.transport.requests.lock().unwrap().clone()
    }

    pub fn requests_with_cmd(&self, cmd: u64) -> Vec<Value> {
        self.requests()
            .into_iter()
            .map(|(_, body)| body)
            .filter(|body| cmd_of(body) == cmd)
            .collect()
    }
}

// ── Event helpers ───────────────────────────────────────────────────

pub fn id(raw: &str) -> DeviceId {
    DeviceId::from(raw)
}

pub async fn next_event(rx: &mut broadcast::Receiver<Arc<ShepherdEvent>>) -> Arc<ShepherdEvent> {
    tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("no event within deadline")
        .expect("event stream closed")
}

/// Everything already queued on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<Arc<ShepherdEvent>>) -> Vec<Arc<ShepherdEvent>> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Poll `check` until it holds, yielding to background tasks in between.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

pub fn device_objects() -> Value {
    json!({ "3": { "0": { "manuf": "x", "model": "y" } } })
}
