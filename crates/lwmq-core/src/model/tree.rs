// ── Resource tree ──
//
// Per-device mirror of the remote resource surface: oid -> iid -> rid -> value.
// Mutations go through the diff engine and are all-or-nothing: every
// instance diff is computed before anything is written.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::diff::{self, Delta, DiffError};
use crate::error::CoreError;
use crate::model::catalog::{Catalog, ResourcePath};

/// Resources of one object instance, keyed by canonical resource key.
pub type Instance = Map<String, Value>;

/// Instances of one object, keyed by instance id.
pub type ObjectInstances = BTreeMap<u16, Instance>;

// ── ObjectList ───────────────────────────────────────────────────────

/// Declared object structure of a device: oid -> set of instance ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectList(BTreeMap<String, BTreeSet<u16>>);

impl ObjectList {
    /// Build from the wire form, canonicalizing object keys.
    pub fn from_wire(raw: &BTreeMap<String, Vec<u16>>, catalog: &Catalog) -> Self {
        Self(
            raw.iter()
                .map(|(oid, iids)| (catalog.oid_key(oid), iids.iter().copied().collect()))
                .collect(),
        )
    }

    pub fn oids(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn instances(&self, oid: &str) -> Option<&BTreeSet<u16>> {
        self.0.get(oid)
    }

    /// Every declared `(oid, iid)` pair, in key order.
    pub fn pairs(&self) -> Vec<(String, u16)> {
        self.0
            .iter()
            .flat_map(|(oid, iids)| iids.iter().map(move |iid| (oid.clone(), *iid)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<const N: usize> From<[(&str, &[u16]); N]> for ObjectList {
    fn from(entries: [(&str, &[u16]); N]) -> Self {
        Self(
            entries
                .into_iter()
                .map(|(oid, iids)| (oid.to_owned(), iids.iter().copied().collect()))
                .collect(),
        )
    }
}

// ── ResourceTree ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceTree {
    objects: BTreeMap<String, ObjectInstances>,
}

impl ResourceTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, oid: &str) -> Option<&ObjectInstances> {
        self.objects.get(oid)
    }

    pub fn instance(&self, oid: &str, iid: u16) -> Option<&Instance> {
        self.objects.get(oid)?.get(&iid)
    }

    pub fn resource(&self, oid: &str, iid: u16, rid: &str) -> Option<&Value> {
        self.instance(oid, iid)?.get(rid)
    }

    /// Look up whatever `path` addresses, as a JSON value.
    pub fn get(&self, path: &ResourcePath) -> Option<Value> {
        match (path.iid, path.rid.as_deref()) {
            (Some(iid), Some(rid)) => self.resource(&path.oid, iid, rid).cloned(),
            (Some(iid), None) => self
                .instance(&path.oid, iid)
                .map(|inst| Value::Object(inst.clone())),
            (None, _) => self
                .object(&path.oid)
                .and_then(|obj| serde_json::to_value(obj).ok()),
        }
    }

    pub fn object_keys(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }

    /// `true` when the tree holds exactly the objects `list` declares.
    pub fn mirrors(&self, list: &ObjectList) -> bool {
        self.object_keys().eq(list.oids())
    }

    /// Install (or replace) an object subtree.
    pub fn bind(&mut self, oid: impl Into<String>, instances: ObjectInstances) {
        self.objects.insert(oid.into(), instances);
    }

    pub fn unbind(&mut self, oid: &str) -> Option<ObjectInstances> {
        self.objects.remove(oid)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    // ── Patching ─────────────────────────────────────────────────────

    /// Apply a single resource value; returns what changed.
    pub fn patch_resource(
        &mut self,
        oid: &str,
        iid: u16,
        rid: &str,
        value: &Value,
    ) -> Result<Delta, CoreError> {
        let slot = self
            .instance_mut(oid, iid)?
            .get_mut(rid)
            .ok_or_else(|| CoreError::UnknownProperty {
                path: format!("{oid}/{iid}/{rid}"),
            })?;
        let delta = diff::diff_resource(slot, value)?;
        diff::apply_delta(slot, &delta);
        Ok(delta)
    }

    /// Apply a partial instance record; returns the sparse set of changes.
    pub fn patch_instance(
        &mut self,
        oid: &str,
        iid: u16,
        values: &Instance,
    ) -> Result<Instance, CoreError> {
        let instance = self.instance_mut(oid, iid)?;
        let changed = diff::diff_instance(instance, values)?;
        diff::apply_patch(instance, &changed);
        Ok(changed)
    }

    /// Apply partial records for several instances of one object.
    /// Returns the sparse changes keyed by instance id.
    pub fn patch_object(
        &mut self,
        oid: &str,
        values: &ObjectInstances,
    ) -> Result<Map<String, Value>, CoreError> {
        let object = self
            .objects
            .get_mut(oid)
            .ok_or_else(|| CoreError::not_found(format!("object {oid}")))?;

        let mut pending = Vec::with_capacity(values.len());
        for (iid, inst) in values {
            let current = object.get(iid).ok_or_else(|| DiffError::UnknownProperty {
                path: format!("{oid}/{iid}"),
            })?;
            let changed = diff::diff_instance(current, inst)?;
            if !changed.is_empty() {
                pending.push((*iid, changed));
            }
        }

        let mut out = Map::new();
        for (iid, changed) in pending {
            if let Some(current) = object.get_mut(&iid) {
                diff::apply_patch(current, &changed);
            }
            out.insert(iid.to_string(), Value::Object(changed));
        }
        Ok(out)
    }

    fn instance_mut(&mut self, oid: &str, iid: u16) -> Result<&mut Instance, CoreError> {
        self.objects
            .get_mut(oid)
            .ok_or_else(|| CoreError::not_found(format!("object {oid}")))?
            .get_mut(&iid)
            .ok_or_else(|| CoreError::not_found(format!("instance {oid}/{iid}")))
    }
}

// ── Payload canonicalization ─────────────────────────────────────────

/// Turn a device-supplied instance record into canonical resource keys.
pub(crate) fn instance_from_payload(
    catalog: &Catalog,
    oid: &str,
    data: &Value,
) -> Result<Instance, CoreError> {
    let Value::Object(raw) = data else {
        return Err(CoreError::malformed(format!(
            "instance data for {oid} must be a record"
        )));
    };
    Ok(raw
        .iter()
        .map(|(rid, v)| (catalog.rid_key(oid, rid), v.clone()))
        .collect())
}

/// Turn a device-supplied object record (`iid -> instance`) into canonical form.
pub(crate) fn object_from_payload(
    catalog: &Catalog,
    oid: &str,
    data: &Value,
) -> Result<ObjectInstances, CoreError> {
    let Value::Object(raw) = data else {
        return Err(CoreError::malformed(format!(
            "object data for {oid} must be a record"
        )));
    };
    raw.iter()
        .map(|(iid, inst)| {
            let iid = iid
                .parse::<u16>()
                .map_err(|_| CoreError::malformed(format!("bad instance id {iid:?} in {oid}")))?;
            Ok((iid, instance_from_payload(catalog, oid, inst)?))
        })
        .collect()
}
