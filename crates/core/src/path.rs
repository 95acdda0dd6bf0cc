//! Value paths used by mapping documents.
//!
//! A path is a dot-separated walk through nested objects (`author.ename`).
//! The `[]` marker projects over an array: `images[].src` reads the `src`
//! field of every element of `images`, and `participants[]` reads the array
//! itself.

use serde_json::{Map, Value};

use crate::Row;

const ARRAY_MARKER: &str = "[]";

/// Reads the value at `path`. Returns `None` when any segment is missing;
/// an explicit JSON `null` is returned as `Some(Value::Null)`.
pub fn lookup(value: &Value, path: &str) -> Option<Value> {
    if let Some((array_path, rest)) = path.split_once(ARRAY_MARKER) {
        let array = lookup(value, array_path)?;
        let items = array.as_array()?;
        let inner = rest.strip_prefix('.').unwrap_or(rest);
        if inner.is_empty() {
            return Some(Value::Array(items.clone()));
        }
        let projected = items
            .iter()
            .map(|item| lookup(item, inner).unwrap_or(Value::Null))
            .collect();
        return Some(Value::Array(projected));
    }

    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Reads `path` from a row.
pub fn lookup_in(row: &Row, path: &str) -> Option<Value> {
    // Fast path for the common flat field.
    if !path.contains('.') && !path.contains(ARRAY_MARKER) {
        return row.get(path).cloned();
    }
    lookup(&Value::Object(row.clone()), path)
}

/// Writes `value` at `path`, creating intermediate objects as needed.
/// For `list[].field` the value must be an array; each element becomes an
/// object `{ field: element }` inside `list`.
pub fn assign(row: &mut Row, path: &str, value: Value) {
    if let Some((array_path, rest)) = path.split_once(ARRAY_MARKER) {
        let inner = rest.strip_prefix('.').unwrap_or(rest);
        let items = match value {
            Value::Array(items) => items,
            other => vec![other],
        };
        let rebuilt = if inner.is_empty() {
            items
        } else {
            items
                .into_iter()
                .map(|item| {
                    let mut object = Map::new();
                    assign(&mut object, inner, item);
                    Value::Object(object)
                })
                .collect()
        };
        assign(row, array_path, Value::Array(rebuilt));
        return;
    }

    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut current = row;
    for segment in parents {
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        let Value::Object(map) = slot else {
            return;
        };
        current = map;
    }
    current.insert(last.to_string(), value);
}
