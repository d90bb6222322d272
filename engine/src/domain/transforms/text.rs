//! Scalar text transforms: finish reasons, text cleanup, string lists

use serde_json::Value as JsonValue;

use crate::utils::string::{parse_string_array, truncate_chars};

/// Canonical finish reason and the provider spellings folded into it.
/// Spellings are matched after trimming and lowercasing.
const FINISH_REASONS: &[(&str, &[&str])] = &[
    (
        "stop",
        &["stop", "end_turn", "eos", "end", "complete", "completed", "stop_sequence"],
    ),
    ("length", &["length", "max_tokens", "token_limit", "truncated"]),
    (
        "tool_use",
        &["tool_use", "tool_calls", "tool-calls", "function_call", "tool"],
    ),
    (
        "content_filter",
        &["content_filter", "safety", "recitation", "blocked", "filtered"],
    ),
    ("error", &["error", "failure", "failed"]),
];

fn canonical_finish_reason(lowered: &str) -> Option<&'static str> {
    FINISH_REASONS
        .iter()
        .find(|(_, spellings)| spellings.contains(&lowered))
        .map(|(canonical, _)| *canonical)
}

/// Map a provider finish reason to the canonical vocabulary.
///
/// Arrays (`gen_ai.response.finish_reasons`) use their first element.
/// Unknown reasons pass through lowercased rather than being dropped.
pub fn normalize_finish_reason(value: &JsonValue) -> Option<JsonValue> {
    let raw = match value {
        JsonValue::String(s) => s.as_str(),
        JsonValue::Array(items) => items.first()?.as_str()?,
        _ => return None,
    };
    if raw.trim().is_empty() {
        return None;
    }
    let lowered = raw.trim().to_lowercase();
    let normalized = canonical_finish_reason(&lowered)
        .map(str::to_string)
        .unwrap_or(lowered);
    Some(JsonValue::String(normalized))
}

/// Trim text and cap it at `max_length` characters.
pub fn normalize_text(value: &JsonValue, max_length: Option<usize>) -> Option<JsonValue> {
    let text = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        return None;
    }
    let text = match max_length {
        Some(max) => truncate_chars(&text, max),
        None => text,
    };
    Some(JsonValue::String(text))
}

/// Coerce a JSON array string, comma-separated string, or array into an
/// array of strings.
pub fn string_list(value: &JsonValue) -> Option<JsonValue> {
    let items: Vec<JsonValue> = match value {
        JsonValue::String(s) => parse_string_array(s)
            .into_iter()
            .map(JsonValue::String)
            .collect(),
        JsonValue::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                JsonValue::String(s) if !s.is_empty() => Some(item.clone()),
                JsonValue::Number(n) => Some(JsonValue::String(n.to_string())),
                _ => None,
            })
            .collect(),
        _ => return None,
    };
    if items.is_empty() {
        None
    } else {
        Some(JsonValue::Array(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_finish_reason_provider_spellings() {
        assert_eq!(normalize_finish_reason(&json!("stop")), Some(json!("stop")));
        assert_eq!(normalize_finish_reason(&json!("end_turn")), Some(json!("stop")));
        assert_eq!(normalize_finish_reason(&json!("STOP")), Some(json!("stop")));
        assert_eq!(normalize_finish_reason(&json!("MAX_TOKENS")), Some(json!("length")));
        assert_eq!(
            normalize_finish_reason(&json!("tool_calls")),
            Some(json!("tool_use"))
        );
        assert_eq!(
            normalize_finish_reason(&json!("SAFETY")),
            Some(json!("content_filter"))
        );
    }

    #[test]
    fn test_finish_reason_array_and_unknown() {
        assert_eq!(
            normalize_finish_reason(&json!(["length", "stop"])),
            Some(json!("length"))
        );
        assert_eq!(
            normalize_finish_reason(&json!("Pause_Turn")),
            Some(json!("pause_turn"))
        );
        assert_eq!(normalize_finish_reason(&json!([])), None);
        assert_eq!(normalize_finish_reason(&json!("  ")), None);
        assert_eq!(normalize_finish_reason(&json!(1)), None);
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text(&json!("  hi  "), None), Some(json!("hi")));
        assert_eq!(
            normalize_text(&json!("abcdef"), Some(3)),
            Some(json!("abc..."))
        );
        assert_eq!(normalize_text(&json!(42), None), Some(json!("42")));
        assert_eq!(normalize_text(&json!("   "), None), None);
        assert_eq!(normalize_text(&json!({"a": 1}), None), None);
    }

    #[test]
    fn test_string_list() {
        assert_eq!(
            string_list(&json!(r#"["\n\n", "END"]"#)),
            Some(json!(["\n\n", "END"]))
        );
        assert_eq!(string_list(&json!("a,b")), Some(json!(["a", "b"])));
        assert_eq!(string_list(&json!(["x", 1, null])), Some(json!(["x", "1"])));
        assert_eq!(string_list(&json!("")), None);
    }
}
