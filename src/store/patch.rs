//! Two-way JSON merge patches (RFC 7386)
//!
//! `diff` computes the patch that turns one serialized object into another;
//! `apply` applies such a patch to a document.

use serde_json::{Map, Value};

/// Compute the merge patch that transforms `old` into `new`
pub fn diff(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut patch = Map::new();
            for (key, new_value) in new_map {
                match old_map.get(key) {
                    Some(old_value) if old_value == new_value => {}
                    Some(old_value @ Value::Object(_)) if new_value.is_object() => {
                        patch.insert(key.clone(), diff(old_value, new_value));
                    }
                    _ => {
                        patch.insert(key.clone(), new_value.clone());
                    }
                }
            }
            for key in old_map.keys() {
                if !new_map.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => new.clone(),
    }
}

/// Apply a merge patch in place
pub fn apply(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                let entry = target_map.entry(key.clone()).or_insert(Value::Null);
                apply(entry, value);
            }
        }
    }
}

/// Whether a patch carries no changes
pub fn is_empty(patch: &Value) -> bool {
    matches!(patch, Value::Object(map) if map.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_diff_only_changed_fields() {
        let old = json!({
            "metadata": {"name": "vol-1", "labels": {"a": "1", "b": "2"}},
            "spec": {"desiredReplicationFactor": 3, "capacityBytes": 10}
        });
        let new = json!({
            "metadata": {"name": "vol-1", "labels": {"a": "1"}},
            "spec": {"desiredReplicationFactor": 2, "capacityBytes": 10}
        });
        assert_eq!(
            diff(&old, &new),
            json!({
                "metadata": {"labels": {"b": null}},
                "spec": {"desiredReplicationFactor": 2}
            })
        );
    }

    #[test]
    fn test_apply_reproduces_new_document() {
        let old = json!({
            "spec": {"knownReplicas": {"R1": "pool-a", "R2": "pool-b"}, "rf": 2},
            "status": {"phase": "Healthy"}
        });
        let new = json!({
            "spec": {"knownReplicas": {"R1": "pool-a"}, "rf": 2, "ip": "10.0.0.1"},
            "status": {"phase": "Healthy"}
        });
        let patch = diff(&old, &new);
        let mut patched = old.clone();
        apply(&mut patched, &patch);
        assert_eq!(patched, new);
    }

    #[test]
    fn test_identical_documents_give_empty_patch() {
        let doc = json!({"spec": {"a": [1, 2, 3]}});
        assert!(is_empty(&diff(&doc, &doc)));
    }
}
