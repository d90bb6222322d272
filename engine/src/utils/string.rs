//! String helpers shared by rule compilation and transforms

/// Truncate text to `max_len` characters, appending an ellipsis when cut.
pub fn truncate_chars(text: &str, max_len: usize) -> String {
    match text.char_indices().nth(max_len) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Split a list-valued attribute into its items. `["a", "b"]` is read as
/// JSON; anything else, including a JSON array that fails to parse, is
/// split on commas with brackets and quotes stripped.
pub fn parse_string_array(value: &str) -> Vec<String> {
    let value = value.trim();
    if value.starts_with('[')
        && let Ok(items) = serde_json::from_str::<Vec<String>>(value)
    {
        return items;
    }
    value
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(|item| item.trim().trim_matches('"'))
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Rewrite every all-digit dotted segment to `*`.
///
/// Returns `None` when the key has no numeric segment, so callers only
/// allocate for indexed keys (`gen_ai.completion.0.content`).
pub fn wildcard_indices(key: &str) -> Option<String> {
    if !key.split('.').any(crate::utils::json::is_index_segment) {
        return None;
    }
    let rewritten: Vec<&str> = key
        .split('.')
        .map(|seg| {
            if crate::utils::json::is_index_segment(seg) {
                "*"
            } else {
                seg
            }
        })
        .collect();
    Some(rewritten.join("."))
}
