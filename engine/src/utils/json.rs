//! JSON value helpers

use std::borrow::Cow;

use serde_json::{Map, Value as JsonValue};

/// View a value as a JSON container.
///
/// Objects and arrays are borrowed as-is. Strings that look like a JSON
/// object or array are parsed, which is how instrumentors commonly store
/// nested payloads in span attributes. Anything else yields `None`.
pub fn as_container(value: &JsonValue) -> Option<Cow<'_, JsonValue>> {
    match value {
        JsonValue::Object(_) | JsonValue::Array(_) => Some(Cow::Borrowed(value)),
        JsonValue::String(s) => {
            let trimmed = s.trim_start();
            if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
                return None;
            }
            match serde_json::from_str::<JsonValue>(s) {
                Ok(parsed @ (JsonValue::Object(_) | JsonValue::Array(_))) => {
                    Some(Cow::Owned(parsed))
                }
                _ => None,
            }
        }
        _ => None,
    }
}

/// Insert `value` at a dotted path, creating intermediate objects.
///
/// Numeric segments stay object keys (`"0"`), so the result can be turned
/// into an ordered array later. When a path collides with an existing scalar
/// the existing value is kept.
pub fn set_nested_value(root: &mut Map<String, JsonValue>, path: &str, value: JsonValue) {
    let mut parts = path.split('.').filter(|p| !p.is_empty()).peekable();
    let mut current = root;

    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.entry(part.to_string()).or_insert(value);
            return;
        }

        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| JsonValue::Object(Map::new()));
        match entry {
            JsonValue::Object(obj) => current = obj,
            _ => return,
        }
    }
}

/// Follow dotted segments through objects (by key) and arrays (by index).
pub fn lookup_dotted<'a, S: AsRef<str>>(value: &'a JsonValue, segments: &[S]) -> Option<&'a JsonValue> {
    let mut current = value;
    for segment in segments {
        let segment = segment.as_ref();
        current = match current {
            JsonValue::Object(map) => map.get(segment)?,
            JsonValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Returns true for non-empty, all-digit strings.
pub fn is_index_segment(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Numeric view of a value, accepting numeric strings.
pub fn as_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}
