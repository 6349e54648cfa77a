//! Flat diffing of form data snapshots.
//!
//! The save request carries the previous value of every changed leaf so the
//! backend can tell which fields the user touched.

use crate::path::flatten;
use serde_json::Value;
use std::collections::BTreeMap;

/// Map of dot-path → previous value for every leaf that changed.
pub type DiffMap = BTreeMap<String, Value>;

/// Diff two flattened snapshots.
///
/// Returns exactly the paths whose value differs between `new` and `old`
/// (compared by value). Each entry holds the old value, or `null` when the
/// path did not exist before.
pub fn diff_models(new: &BTreeMap<String, Value>, old: &BTreeMap<String, Value>) -> DiffMap {
    let mut diff = DiffMap::new();
    for (key, new_value) in new {
        match old.get(key) {
            Some(old_value) if old_value == new_value => {}
            Some(old_value) => {
                diff.insert(key.clone(), old_value.clone());
            }
            None => {
                diff.insert(key.clone(), Value::Null);
            }
        }
    }
    for (key, old_value) in old {
        if !new.contains_key(key) {
            diff.insert(key.clone(), old_value.clone());
        }
    }
    diff
}

/// Flatten both snapshots and diff them.
pub fn diff_data(new: &Value, old: &Value) -> DiffMap {
    diff_models(&flatten(new), &flatten(old))
}
