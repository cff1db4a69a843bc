// ── Persisted device record ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ids::{DeviceId, MacAddress};
use super::tree::{ObjectList, ResourceTree};
use crate::diff::{self, OBJ_LIST_KEY};
use crate::error::CoreError;

/// Document stored per device; the store's source of truth for restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub device_id: DeviceId,
    #[serde(rename = "lifetime")]
    pub lifetime_secs: u64,
    pub ip: Option<String>,
    pub mac: MacAddress,
    pub version: Option<String>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub join_epoch: DateTime<Utc>,
    #[serde(rename = "objList")]
    pub object_list: ObjectList,
    pub resource_tree: ResourceTree,
}

/// The update-able attribute set of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAttributes {
    #[serde(rename = "lifetime")]
    pub lifetime_secs: u64,
    pub ip: Option<String>,
    pub version: Option<String>,
    #[serde(rename = "objList")]
    pub object_list: ObjectList,
}

/// Partial attribute set carried by an update message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeChanges {
    pub lifetime_secs: Option<u64>,
    pub ip: Option<String>,
    pub version: Option<String>,
    pub object_list: Option<ObjectList>,
}

impl DeviceAttributes {
    /// Sparse diff of `changes` against `self`, in record key names.
    ///
    /// `objList` is compared whole and, when it differs, appears whole.
    pub fn diff(&self, changes: &AttributeChanges) -> Result<Map<String, Value>, CoreError> {
        let mut current = to_record(self)?;
        current.remove(OBJ_LIST_KEY);

        let mut candidate = Map::new();
        if let Some(lifetime) = changes.lifetime_secs {
            candidate.insert("lifetime".into(), Value::from(lifetime));
        }
        if let Some(ip) = &changes.ip {
            candidate.insert("ip".into(), Value::from(ip.clone()));
        }
        if let Some(version) = &changes.version {
            candidate.insert("version".into(), Value::from(version.clone()));
        }

        let mut changed = diff::diff_instance(&current, &candidate)?;
        if let Some(list) = &changes.object_list {
            if *list != self.object_list {
                let value =
                    serde_json::to_value(list).map_err(|e| CoreError::Internal(e.to_string()))?;
                changed.insert(OBJ_LIST_KEY.into(), value);
            }
        }
        Ok(changed)
    }

    /// Apply `changes`, leaving omitted attributes untouched.
    pub fn apply(&mut self, changes: &AttributeChanges) {
        if let Some(lifetime) = changes.lifetime_secs {
            self.lifetime_secs = lifetime;
        }
        if let Some(ip) = &changes.ip {
            self.ip = Some(ip.clone());
        }
        if let Some(version) = &changes.version {
            self.version = Some(version.clone());
        }
        if let Some(list) = &changes.object_list {
            self.object_list = list.clone();
        }
    }
}

fn to_record(attrs: &DeviceAttributes) -> Result<Map<String, Value>, CoreError> {
    match serde_json::to_value(attrs) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(CoreError::Internal("attributes did not serialize to a record".into())),
        Err(e) => Err(CoreError::Internal(e.to_string())),
    }
}
