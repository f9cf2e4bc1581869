//! Dotted-path access and deep merging over dynamic JSON values.
//!
//! Attribute state is held as `serde_json` values: clones are structurally
//! deep, which is what keeps active and reference state from ever sharing
//! a mutable sub-object.

use serde_json::{Map, Value};

/// Returns the top-level attribute name of a dotted path.
pub(crate) fn root_key(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

/// Reads a value by dotted path.
pub(crate) fn get_path<'a>(map: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = map.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Writes a value by dotted path, creating intermediate objects as needed.
///
/// Returns the previous value at that path, if one was defined.
pub(crate) fn set_path(map: &mut Map<String, Value>, path: &str, value: Value) -> Option<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, intermediate) = segments.split_last().expect("split never yields empty");

    let mut current = map;
    for segment in intermediate {
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = slot.as_object_mut().expect("slot was just made an object");
    }
    current.insert(last.to_string(), value)
}

/// Deep-merges `incoming` into `target`: objects merge recursively, any
/// other value replaces the target wholesale.
pub(crate) fn deep_merge(target: &mut Value, incoming: &Value) {
    match (target, incoming) {
        (Value::Object(target_map), Value::Object(incoming_map)) => {
            for (key, value) in incoming_map {
                match target_map.get_mut(key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        target_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, incoming) => *target = incoming.clone(),
    }
}
