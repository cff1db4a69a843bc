// ── In-memory document store ──

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};

use super::{DocumentStore, StoreError};
use crate::diff;
use crate::model::{DeviceId, DeviceRecord};

/// A [`DocumentStore`] holding each record as a JSON document.
///
/// Suitable for tests and for deployments that rebuild state from devices.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: DashMap<DeviceId, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Raw document value at a dotted `path`, for inspection.
    pub fn value_at(&self, device_id: &DeviceId, path: &str) -> Option<Value> {
        let doc = self.docs.get(device_id)?;
        lookup(&doc, path).cloned()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert(&self, record: &DeviceRecord) -> Result<(), StoreError> {
        let doc = serde_json::to_value(record)?;
        self.docs.insert(record.device_id.clone(), doc);
        Ok(())
    }

    async fn find_by_device_id(
        &self,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceRecord>, StoreError> {
        let Some(doc) = self.docs.get(device_id).map(|d| d.clone()) else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(doc)?))
    }

    async fn remove_by_device_id(&self, device_id: &DeviceId) -> Result<bool, StoreError> {
        Ok(self.docs.remove(device_id).is_some())
    }

    async fn replace_at_path(
        &self,
        device_id: &DeviceId,
        path: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        let mut doc = self.docs.get_mut(device_id).ok_or_else(|| StoreError::NotFound {
            device_id: device_id.clone(),
        })?;
        set_at(&mut doc, path, value)
    }

    async fn patch_at_path(
        &self,
        device_id: &DeviceId,
        path: &str,
        value: &Value,
    ) -> Result<Map<String, Value>, StoreError> {
        let mut doc = self.docs.get_mut(device_id).ok_or_else(|| StoreError::NotFound {
            device_id: device_id.clone(),
        })?;

        let mut changed = Map::new();
        for (leaf, new_value) in diff::build_path_value_pairs(path, value) {
            if lookup(&doc, &leaf) == Some(&new_value) {
                continue;
            }
            set_at(&mut doc, &leaf, new_value.clone())?;
            changed.insert(leaf, new_value);
        }
        Ok(changed)
    }

    async fn export_all_device_ids(&self) -> Result<Vec<DeviceId>, StoreError> {
        let mut ids: Vec<DeviceId> = self.docs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}

// ── Dotted path helpers ──────────────────────────────────────────────

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    segments(path).try_fold(doc, |node, key| node.as_object()?.get(key))
}

/// Write `value` at `path`, creating intermediate records as needed.
fn set_at(doc: &mut Value, path: &str, value: Value) -> Result<(), StoreError> {
    let keys: Vec<&str> = segments(path).collect();
    let Some((last, parents)) = keys.split_last() else {
        *doc = value;
        return Ok(());
    };

    let mut node = doc;
    for key in parents {
        let map = node.as_object_mut().ok_or_else(|| StoreError::InvalidPath {
            path: path.to_owned(),
        })?;
        node = map
            .entry((*key).to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let map = node.as_object_mut().ok_or_else(|| StoreError::InvalidPath {
        path: path.to_owned(),
    })?;
    map.insert((*last).to_owned(), value);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{MacAddress, ObjectList, ResourceTree};
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record() -> DeviceRecord {
        let tree: ResourceTree =
            serde_json::from_value(json!({ "3": { "0": { "manuf": "x", "model": "y" } } }))
                .unwrap();
        DeviceRecord {
            device_id: DeviceId::from("d1"),
            lifetime_secs: 60,
            ip: None,
            mac: MacAddress::new("aa:bb:cc:dd:ee:ff"),
            version: None,
            join_epoch: Utc::now(),
            object_list: ObjectList::from([("3", &[0][..])]),
            resource_tree: tree,
        }
    }

    #[tokio::test]
    async fn patch_reports_only_changed_leaves() {
        let store = MemoryStore::new();
        let id = DeviceId::from("d1");
        store.insert(&record()).await.unwrap();

        let changed = store
            .patch_at_path(&id, "resourceTree.3.0", &json!({ "manuf": "z", "model": "y" }))
            .await
            .unwrap();
        assert_eq!(Value::Object(changed), json!({ "resourceTree.3.0.manuf": "z" }));
        assert_eq!(
            store.value_at(&id, "resourceTree.3.0.manuf"),
            Some(json!("z"))
        );
    }

    #[tokio::test]
    async fn patch_at_root_keeps_obj_list_whole() {
        let store = MemoryStore::new();
        let id = DeviceId::from("d1");
        store.insert(&record()).await.unwrap();

        let changed = store
            .patch_at_path(&id, "", &json!({ "lifetime": 90, "objList": { "3": [0, 1] } }))
            .await
            .unwrap();
        assert_eq!(
            Value::Object(changed),
            json!({ "lifetime": 90, "objList": { "3": [0, 1] } })
        );
        let back = store.find_by_device_id(&id).await.unwrap().unwrap();
        assert_eq!(back.lifetime_secs, 90);
        assert_eq!(back.object_list, ObjectList::from([("3", &[0, 1][..])]));
    }

    #[tokio::test]
    async fn replace_and_remove() {
        let store = MemoryStore::new();
        let id = DeviceId::from("d1");
        store.insert(&record()).await.unwrap();

        store
            .replace_at_path(&id, "resourceTree.3", json!({ "0": { "manuf": "q" } }))
            .await
            .unwrap();
        assert_eq!(
            store.value_at(&id, "resourceTree.3"),
            Some(json!({ "0": { "manuf": "q" } }))
        );

        assert_eq!(store.export_all_device_ids().await.unwrap(), vec![id.clone()]);
        assert!(store.remove_by_device_id(&id).await.unwrap());
        assert!(!store.remove_by_device_id(&id).await.unwrap());
        assert!(store.find_by_device_id(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn writes_to_missing_record_fail() {
        let store = MemoryStore::new();
        let err = store
            .replace_at_path(&DeviceId::from("ghost"), "ip", json!("1.2.3.4"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
