// ── Diff / patch engine ──
//
// Pure functions over `serde_json::Value`. A record value (JSON object)
// is "structured"; everything else, arrays included, is a scalar that is
// compared and replaced whole. Diffs are partial: keys missing from the
// new value are left alone, keys missing from the old value are rejected.

use indexmap::IndexMap;
use serde_json::{Map, Value};
use thiserror::Error;

/// Key that is always replaced wholesale, never expanded into leaf paths.
pub const OBJ_LIST_KEY: &str = "objList";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffError {
    #[error("unknown property: {path}")]
    UnknownProperty { path: String },
}

/// Outcome of comparing two resource values.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    /// Values are equal.
    Unchanged,
    /// The new value replaces the old one whole (scalar change or shape change).
    Replace(Value),
    /// Sparse record of changed keys; nested records are sparse as well.
    Patch(Map<String, Value>),
}

impl Delta {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged)
    }

    /// The delta as a JSON value, `None` when unchanged.
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Unchanged => None,
            Self::Replace(v) => Some(v),
            Self::Patch(m) => Some(Value::Object(m)),
        }
    }
}

/// Diff two instance records. The result holds only the keys whose values
/// differ; an empty map means no change.
pub fn diff_instance(
    old: &Map<String, Value>,
    new: &Map<String, Value>,
) -> Result<Map<String, Value>, DiffError> {
    diff_fields(old, new, "")
}

/// Diff two resource values.
pub fn diff_resource(old: &Value, new: &Value) -> Result<Delta, DiffError> {
    diff_at(old, new, "")
}

/// Keys of `candidate` that `target` does not have.
pub fn invalid_paths_of(
    target: &Map<String, Value>,
    candidate: &Map<String, Value>,
) -> Vec<String> {
    candidate
        .keys()
        .filter(|k| !target.contains_key(*k))
        .cloned()
        .collect()
}

/// Flatten a value into dotted `path -> leaf` pairs under `root`.
///
/// Empty records are leaves. The `objList` key is kept whole.
pub fn build_path_value_pairs(root: &str, value: &Value) -> IndexMap<String, Value> {
    let mut out = IndexMap::new();
    flatten_into(root, value, &mut out);
    out
}

/// Merge a sparse patch (as produced by the diff functions) into `target`.
pub fn apply_patch(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        match (target.get_mut(key), value) {
            (Some(Value::Object(inner)), Value::Object(sub)) => apply_patch(inner, sub),
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Apply a [`Delta`] to a single value in place.
pub fn apply_delta(target: &mut Value, delta: &Delta) {
    match (target, delta) {
        (_, Delta::Unchanged) => {}
        (Value::Object(inner), Delta::Patch(patch)) => apply_patch(inner, patch),
        (slot, Delta::Replace(v)) => *slot = v.clone(),
        (slot, Delta::Patch(patch)) => *slot = Value::Object(patch.clone()),
    }
}

pub(crate) fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_owned()
    } else {
        format!("{prefix}.{key}")
    }
}

// ── Private helpers ──────────────────────────────────────────────────

fn diff_fields(
    old: &Map<String, Value>,
    new: &Map<String, Value>,
    prefix: &str,
) -> Result<Map<String, Value>, DiffError> {
    if let Some(unknown) = invalid_paths_of(old, new).first() {
        return Err(DiffError::UnknownProperty {
            path: join_path(prefix, unknown),
        });
    }

    let mut changed = Map::new();
    for (key, new_value) in new {
        let Some(old_value) = old.get(key) else {
            continue;
        };
        if let Some(v) = diff_at(old_value, new_value, &join_path(prefix, key))?.into_value() {
            changed.insert(key.clone(), v);
        }
    }
    Ok(changed)
}

fn diff_at(old: &Value, new: &Value, path: &str) -> Result<Delta, DiffError> {
    match (old, new) {
        (Value::Object(o), Value::Object(n)) => {
            let changed = diff_fields(o, n, path)?;
            if changed.is_empty() {
                Ok(Delta::Unchanged)
            } else {
                Ok(Delta::Patch(changed))
            }
        }
        _ if old == new => Ok(Delta::Unchanged),
        _ => Ok(Delta::Replace(new.clone())),
    }
}

fn flatten_into(path: &str, value: &Value, out: &mut IndexMap<String, Value>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, v) in map {
                let child = join_path(path, key);
                if key == OBJ_LIST_KEY {
                    out.insert(child, v.clone());
                } else {
                    flatten_into(&child, v, out);
                }
            }
        }
        _ => {
            out.insert(path.to_owned(), value.clone());
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            other => panic!("expected object, got {other}"),
        }
    }

    fn sample() -> Map<String, Value> {
        obj(json!({
            "manuf": "x",
            "model": "y",
            "battLevel": 80,
            "rec": { "a": 1, "b": { "c": true } },
            "list": [1, 2, 3]
        }))
    }

    #[test]
    fn diff_of_identical_instances_is_empty() {
        let old = sample();
        assert!(diff_instance(&old, &old).unwrap().is_empty());
    }

    #[test]
    fn diff_keeps_only_changed_leaves() {
        let old = sample();
        let new = obj(json!({ "manuf": "z", "model": "y", "rec": { "b": { "c": false } } }));
        let diff = diff_instance(&old, &new).unwrap();
        assert_eq!(
            Value::Object(diff),
            json!({ "manuf": "z", "rec": { "b": { "c": false } } })
        );
    }

    #[test]
    fn applying_a_diff_reproduces_the_target() {
        let old = sample();
        let new = obj(json!({
            "manuf": "q",
            "model": "y",
            "battLevel": 12,
            "rec": { "a": 2, "b": { "c": true } },
            "list": [3]
        }));
        let diff = diff_instance(&old, &new).unwrap();

        let mut patched = old.clone();
        apply_patch(&mut patched, &diff);
        assert_eq!(patched, new);
    }

    #[test]
    fn unknown_key_aborts_without_touching_old() {
        let old = sample();
        let before = old.clone();
        let err = diff_instance(&old, &obj(json!({ "manuf": "z", "bogus": 1 }))).unwrap_err();
        assert_eq!(err, DiffError::UnknownProperty { path: "bogus".into() });
        assert_eq!(old, before);
    }

    #[test]
    fn unknown_nested_key_reports_full_path() {
        let new = obj(json!({ "rec": { "b": { "d": 1 } } }));
        let err = diff_instance(&sample(), &new).unwrap_err();
        assert_eq!(err, DiffError::UnknownProperty { path: "rec.b.d".into() });
    }

    #[test]
    fn shape_change_is_a_full_replacement() {
        let delta = diff_resource(&json!(5), &json!({ "anything": 1 })).unwrap();
        assert_eq!(delta, Delta::Replace(json!({ "anything": 1 })));

        let back = diff_resource(&json!({ "a": 1 }), &json!("flat")).unwrap();
        assert_eq!(back, Delta::Replace(json!("flat")));
    }

    #[test]
    fn scalar_resource_diff() {
        assert!(diff_resource(&json!("a"), &json!("a")).unwrap().is_unchanged());
        assert_eq!(
            diff_resource(&json!("a"), &json!("b")).unwrap(),
            Delta::Replace(json!("b"))
        );
    }

    #[test]
    fn structured_resource_diff_rejects_new_keys() {
        let err = diff_resource(&json!({ "x": 1 }), &json!({ "x": 1, "y": 2 })).unwrap_err();
        assert_eq!(err, DiffError::UnknownProperty { path: "y".into() });
    }

    #[test]
    fn apply_delta_replaces_or_merges() {
        let mut v = json!({ "a": 1, "b": 2 });
        apply_delta(&mut v, &Delta::Patch(obj(json!({ "b": 3 }))));
        assert_eq!(v, json!({ "a": 1, "b": 3 }));

        apply_delta(&mut v, &Delta::Replace(json!(7)));
        assert_eq!(v, json!(7));
    }

    #[test]
    fn invalid_paths_lists_foreign_keys() {
        let target = obj(json!({ "a": 1, "b": 2 }));
        let candidate = obj(json!({ "a": 0, "c": 0, "d": 0 }));
        assert_eq!(invalid_paths_of(&target, &candidate), vec!["c", "d"]);
    }

    #[test]
    fn path_value_pairs_flatten_but_keep_obj_list() {
        let value = json!({
            "lifetime": 60,
            "objList": { "3": [0], "1": [0, 1] },
            "resourceTree": { "device": { "0": { "manuf": "x" } } },
            "empty": {}
        });
        let pairs = build_path_value_pairs("", &value);
        let mut keys: Vec<&str> = pairs.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec!["empty", "lifetime", "objList", "resourceTree.device.0.manuf"]
        );
        assert_eq!(pairs["objList"], json!({ "3": [0], "1": [0, 1] }));
    }

    #[test]
    fn path_value_pairs_under_a_root() {
        let pairs = build_path_value_pairs("resourceTree.device.0", &json!({ "manuf": "z" }));
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs["resourceTree.device.0.manuf"], json!("z"));
    }
}
