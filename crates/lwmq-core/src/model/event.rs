// ── Domain events ──
//
// Everything the shepherd tells its subscribers, as one closed union.
// Delivered through a `broadcast` channel; see `Shepherd::events()`.

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use super::catalog::ResourcePath;
use super::ids::DeviceId;
use super::status::DeviceStatus;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShepherdEvent {
    /// Registration completed and the device record is persisted.
    Registered { device_id: DeviceId },
    /// A new device joined the network.
    DeviceIncoming { device_id: DeviceId },
    /// The device was removed from the registry and the store.
    Deregistered { device_id: DeviceId },
    /// A device left the network (deregister, lifetime expiry, or removal).
    DeviceLeaving { device_id: DeviceId },
    /// Device attributes changed through an update; `diff` is sparse.
    DeviceUpdated { device_id: DeviceId, diff: Value },
    /// The device pushed a notification for `path`.
    DeviceNotified {
        device_id: DeviceId,
        #[serde(serialize_with = "display_path")]
        path: ResourcePath,
        data: Value,
    },
    /// Mirrored resources under `path` changed; `diff` is sparse.
    ResourceChanged {
        device_id: DeviceId,
        #[serde(serialize_with = "display_path")]
        path: ResourcePath,
        diff: Value,
    },
    /// Liveness status moved to `status`.
    StatusChanged {
        device_id: DeviceId,
        status: DeviceStatus,
    },
    /// An inbound message on a topic this system does not handle.
    Unhandled {
        topic: String,
        #[serde(skip)]
        payload: Bytes,
    },
}

impl ShepherdEvent {
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            Self::Registered { device_id }
            | Self::DeviceIncoming { device_id }
            | Self::Deregistered { device_id }
            | Self::DeviceLeaving { device_id }
            | Self::DeviceUpdated { device_id, .. }
            | Self::DeviceNotified { device_id, .. }
            | Self::ResourceChanged { device_id, .. }
            | Self::StatusChanged { device_id, .. } => Some(device_id),
            Self::Unhandled { .. } => None,
        }
    }
}

fn display_path<S: serde::Serializer>(path: &ResourcePath, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(path)
}
