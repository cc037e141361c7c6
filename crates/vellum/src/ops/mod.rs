//! Collection operations as free functions over a connection.
//!
//! Each function receives the connection and the collection config and
//! performs one logical operation, including its vector-table maintenance,
//! inside whatever transaction scope the caller established. The public
//! `Collection` handle routes these through the pool and wraps them with
//! hook dispatch.

pub mod read;
pub mod rebuild;
pub mod vector;
pub mod write;

use serde_json::Value;

/// Set a dotted path inside a document, creating intermediate objects.
pub(crate) fn set_path(doc: &mut Value, path: &str, value: Value) {
    let mut current = doc;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        if i == segments.len() - 1 {
            if let Some(map) = current.as_object_mut() {
                map.insert(segment.to_string(), value);
            }
            return;
        }
        if !current
            .get(*segment)
            .map(Value::is_object)
            .unwrap_or(false)
        {
            if let Some(map) = current.as_object_mut() {
                map.insert(segment.to_string(), Value::Object(Default::default()));
            }
        }
        current = match current.get_mut(*segment) {
            Some(next) => next,
            None => return,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_path_creates_intermediates() {
        let mut doc = json!({});
        set_path(&mut doc, "a.b.c", json!(1));
        assert_eq!(doc, json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn test_set_path_overwrites_leaf() {
        let mut doc = json!({"a": {"b": 1}});
        set_path(&mut doc, "a.b", json!(2));
        assert_eq!(doc, json!({"a": {"b": 2}}));
    }

    #[test]
    fn test_set_path_replaces_non_object_intermediate() {
        let mut doc = json!({"a": 5});
        set_path(&mut doc, "a.b", json!(1));
        assert_eq!(doc, json!({"a": {"b": 1}}));
    }
}
