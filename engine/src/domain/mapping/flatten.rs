//! Dot-index flattening of mapped values

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

/// Key whose value is always stored as an opaque JSON string
pub const OPAQUE_KEY: &str = "arguments";

/// Flatten `value` into `out` under `prefix`.
///
/// Arrays are renumbered densely over their non-null items, in source
/// order: `[a, null, b]` yields `prefix.0 = a` and `prefix.1 = b`. Indices are
/// positions in the event's list, not in the source array, so an indexed
/// section never has gaps. Objects use dotted keys. A segment named
/// `arguments` is stored as a JSON string and never descended into.
pub fn flatten_into(out: &mut BTreeMap<String, JsonValue>, prefix: &str, value: &JsonValue) {
    if value.is_null() {
        return;
    }
    if is_opaque(prefix) {
        out.insert(prefix.to_string(), opaque(value));
        return;
    }

    match value {
        JsonValue::Array(items) => {
            for (i, item) in items.iter().filter(|item| !item.is_null()).enumerate() {
                flatten_into(out, &format!("{prefix}.{i}"), item);
            }
        }
        JsonValue::Object(map) => {
            for (key, item) in map {
                flatten_into(out, &format!("{prefix}.{key}"), item);
            }
        }
        scalar => {
            out.insert(prefix.to_string(), scalar.clone());
        }
    }
}

fn is_opaque(key: &str) -> bool {
    key.rsplit('.').next() == Some(OPAQUE_KEY)
}

/// Strings pass through untouched; anything else is serialized compactly.
fn opaque(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::String(_) => value.clone(),
        other => JsonValue::String(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flat(prefix: &str, value: JsonValue) -> BTreeMap<String, JsonValue> {
        let mut out = BTreeMap::new();
        flatten_into(&mut out, prefix, &value);
        out
    }

    #[test]
    fn test_scalar() {
        assert_eq!(flat("model", json!("gpt-4o")), BTreeMap::from([("model".into(), json!("gpt-4o"))]));
        assert!(flat("model", JsonValue::Null).is_empty());
    }

    #[test]
    fn test_arrays_are_renumbered_without_gaps() {
        let out = flat("stop", json!(["a", null, "b"]));
        assert_eq!(out.get("stop.0"), Some(&json!("a")));
        assert_eq!(out.get("stop.1"), Some(&json!("b")));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_nested_objects() {
        let out = flat(
            "messages",
            json!([{"role": "user", "content": [{"type": "text", "text": "hi"}]}]),
        );
        assert_eq!(out.get("messages.0.role"), Some(&json!("user")));
        assert_eq!(out.get("messages.0.content.0.type"), Some(&json!("text")));
        assert_eq!(out.get("messages.0.content.0.text"), Some(&json!("hi")));
    }

    #[test]
    fn test_arguments_stay_opaque() {
        let raw = "{\"query\": \"x\",\n \"limit\": 3}";
        let out = flat(
            "tool_calls",
            json!([
                {"id": "call_1", "name": "search", "arguments": raw},
                {"id": "call_2", "name": "lookup", "arguments": {"city": "Paris"}}
            ]),
        );
        assert_eq!(out.get("tool_calls.0.arguments"), Some(&json!(raw)));
        assert_eq!(out.get("tool_calls.1.arguments"), Some(&json!("{\"city\":\"Paris\"}")));
        assert!(!out.keys().any(|k| k.contains("arguments.")));
    }

    #[test]
    fn test_empty_containers_produce_nothing() {
        assert!(flat("tool_calls", json!([])).is_empty());
        assert!(flat("params", json!({})).is_empty());
    }
}
