//! Topic layout and JSON message bodies.
//!
//! Devices publish on `<interface>/<deviceId>`; the shepherd answers on
//! `<interface>/response/<deviceId>` and sends requests on `request/<deviceId>`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};

use crate::model::{Catalog, DeviceId, ResourcePath, StatusCode};

// ── Interfaces ───────────────────────────────────────────────────────

/// Topic interface of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Interface {
    Register,
    Update,
    Deregister,
    Notify,
    Response,
    Ping,
    Lwt,
    Request,
}

impl Interface {
    /// Interfaces a device publishes on.
    pub fn is_inbound(self) -> bool {
        !matches!(self, Self::Request)
    }
}

/// Split an inbound topic into interface and device id.
///
/// Returns `None` for anything that is not `<inbound interface>/<deviceId>`.
pub fn classify(topic: &str) -> Option<(Interface, DeviceId)> {
    let (head, rest) = topic.split_once('/')?;
    let interface: Interface = head.parse().ok()?;
    if !interface.is_inbound() || rest.is_empty() || rest.starts_with("response/") {
        return None;
    }
    Some((interface, DeviceId::from(rest)))
}

pub fn reply_topic(interface: Interface, device_id: &DeviceId) -> String {
    format!("{interface}/response/{device_id}")
}

pub fn request_topic(device_id: &DeviceId) -> String {
    format!("{}/{device_id}", Interface::Request)
}

// ── Commands ─────────────────────────────────────────────────────────

/// Remote operation carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "camelCase")]
pub enum Command {
    Read,
    Write,
    Discover,
    WriteAttrs,
    Execute,
    Observe,
    Ping,
    Identify,
}

impl Command {
    pub fn code(self) -> u8 {
        match self {
            Self::Read => 0,
            Self::Write => 1,
            Self::Discover => 2,
            Self::WriteAttrs => 3,
            Self::Execute => 4,
            Self::Observe => 5,
            Self::Ping => 7,
            Self::Identify => 8,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Read,
            1 => Self::Write,
            2 => Self::Discover,
            3 => Self::WriteAttrs,
            4 => Self::Execute,
            5 => Self::Observe,
            7 => Self::Ping,
            8 => Self::Identify,
            _ => return None,
        })
    }
}

// ── Ids on the wire ──────────────────────────────────────────────────

/// An object or resource id as sent by a device: numeric or symbolic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireId {
    Num(u16),
    Name(String),
}

impl WireId {
    pub fn as_key(&self) -> String {
        match self {
            Self::Num(n) => n.to_string(),
            Self::Name(s) => s.clone(),
        }
    }

    fn for_object(catalog: &Catalog, oid_key: &str) -> Self {
        catalog
            .oid_number(oid_key)
            .map_or_else(|| Self::Name(oid_key.to_owned()), Self::Num)
    }

    fn for_resource(catalog: &Catalog, oid_key: &str, rid_key: &str) -> Self {
        catalog
            .rid_number(oid_key, rid_key)
            .map_or_else(|| Self::Name(rid_key.to_owned()), Self::Num)
    }
}

// ── Inbound bodies ───────────────────────────────────────────────────

/// Transaction id of an inbound body, extracted before strict parsing so
/// that rejections can still be correlated by the device.
pub fn trans_id_of(body: &Value) -> Option<u64> {
    body.get("transId").and_then(Value::as_u64)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RegisterMessage {
    pub trans_id: u64,
    pub mac: String,
    pub lifetime: u64,
    pub obj_list: BTreeMap<String, Vec<u16>>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateMessage {
    pub trans_id: u64,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub lifetime: Option<u64>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub obj_list: Option<BTreeMap<String, Vec<u16>>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyMessage {
    pub trans_id: u64,
    pub oid: WireId,
    pub iid: u16,
    #[serde(default)]
    pub rid: Option<WireId>,
    pub data: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    pub trans_id: u64,
    pub cmd_id: u8,
    pub status: StatusCode,
    #[serde(default)]
    pub data: Option<Value>,
}

// ── Outbound bodies ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMessage {
    pub trans_id: u8,
    pub cmd_id: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oid: Option<WireId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rid: Option<WireId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RequestMessage {
    pub fn new(
        catalog: &Catalog,
        trans_id: u8,
        command: Command,
        path: Option<&ResourcePath>,
        data: Option<Value>,
    ) -> Self {
        Self {
            trans_id,
            cmd_id: command.code(),
            oid: path.map(|p| WireId::for_object(catalog, &p.oid)),
            iid: path.and_then(|p| p.iid),
            rid: path.and_then(|p| {
                p.rid
                    .as_deref()
                    .map(|rid| WireId::for_resource(catalog, &p.oid, rid))
            }),
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trans_id: Option<u64>,
    pub status: StatusCode,
}
