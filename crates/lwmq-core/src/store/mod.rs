// ── Persistence collaborator ──
//
// Document store keyed by device id. The store is the source of truth for
// restart recovery and is written through after every successful mutation.
// Paths are dotted (`resourceTree.device.0.manuf`); the empty path is the
// document root.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::{DeviceId, DeviceRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no record for device {device_id}")]
    NotFound { device_id: DeviceId },

    #[error("invalid document path: {path}")]
    InvalidPath { path: String },

    #[error("record (de)serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store backend failure: {0}")]
    Backend(String),
}

#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Write a full record, replacing any existing one for the same device.
    async fn insert(&self, record: &DeviceRecord) -> Result<(), StoreError>;

    async fn find_by_device_id(
        &self,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceRecord>, StoreError>;

    /// Returns `true` if a record was removed.
    async fn remove_by_device_id(&self, device_id: &DeviceId) -> Result<bool, StoreError>;

    /// Overwrite whatever lives at `path` with `value`.
    async fn replace_at_path(
        &self,
        device_id: &DeviceId,
        path: &str,
        value: Value,
    ) -> Result<(), StoreError>;

    /// Merge a sparse `value` into the document at `path`.
    ///
    /// Returns the dotted leaf paths that actually changed, with their new values.
    async fn patch_at_path(
        &self,
        device_id: &DeviceId,
        path: &str,
        value: &Value,
    ) -> Result<Map<String, Value>, StoreError>;

    async fn export_all_device_ids(&self) -> Result<Vec<DeviceId>, StoreError>;
}
