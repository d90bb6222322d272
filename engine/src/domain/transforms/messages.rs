//! Message-array transforms
//!
//! Instrumentors flatten message lists into indexed attributes
//! (`gen_ai.prompt.0.role`, `gen_ai.prompt.1.content`, ...). `ObjectMerge`
//! gathers those back into `{"0": {...}, "1": {...}}`; the transforms here
//! turn that into ordered arrays and pull role-specific content out.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::utils::json::{as_container, is_index_segment, lookup_dotted};

/// Parameters of `reconstruct_array`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconstructParams {
    /// Output key -> candidate dotted paths inside each element; first
    /// non-null candidate wins. Empty keeps elements unchanged.
    pub project: Vec<(String, Vec<Vec<String>>)>,
    /// Drop projected elements missing this key
    pub require: Option<String>,
}

impl ReconstructParams {
    pub fn from_params(params: &BTreeMap<String, JsonValue>) -> Result<Self, String> {
        let mut out = Self::default();
        for (key, value) in params {
            match key.as_str() {
                "project" => {
                    let map = value
                        .as_object()
                        .ok_or_else(|| "'project' must be a mapping".to_string())?;
                    for (output_key, candidates) in map {
                        let candidates: Vec<&str> = match candidates {
                            JsonValue::String(s) => vec![s.as_str()],
                            JsonValue::Array(items) => items
                                .iter()
                                .map(|c| {
                                    c.as_str().ok_or_else(|| {
                                        format!("'project.{output_key}' entries must be strings")
                                    })
                                })
                                .collect::<Result<_, _>>()?,
                            _ => {
                                return Err(format!(
                                    "'project.{output_key}' must be a path or list of paths"
                                ));
                            }
                        };
                        if candidates.is_empty() || candidates.iter().any(|c| c.is_empty()) {
                            return Err(format!("'project.{output_key}' has an empty path"));
                        }
                        let paths = candidates
                            .iter()
                            .map(|c| c.split('.').map(str::to_string).collect())
                            .collect();
                        out.project.push((output_key.clone(), paths));
                    }
                }
                "require" => {
                    let required = value
                        .as_str()
                        .ok_or_else(|| "'require' must be a string".to_string())?;
                    out.require = Some(required.to_string());
                }
                other => return Err(format!("unknown parameter '{other}'")),
            }
        }
        if let Some(required) = &out.require
            && !out.project.is_empty()
            && !out.project.iter().any(|(key, _)| key == required)
        {
            return Err(format!("'require' names '{required}', which is not projected"));
        }
        Ok(out)
    }
}

/// Elements of an indexed collection in index order.
///
/// Arrays are returned as-is. Objects keyed by indices (`{"1": .., "0": ..}`)
/// are ordered numerically and compacted; other objects count as a single
/// element. JSON strings are parsed first. Scalars yield `None`.
pub fn ordered_elements(value: &JsonValue) -> Option<Vec<JsonValue>> {
    let container = as_container(value)?;
    match container.as_ref() {
        JsonValue::Array(items) => Some(items.iter().filter(|v| !v.is_null()).cloned().collect()),
        JsonValue::Object(map) if map.keys().any(|key| is_index_segment(key)) => {
            let indexed: BTreeMap<usize, &JsonValue> = map
                .iter()
                .filter_map(|(key, v)| key.parse::<usize>().ok().map(|i| (i, v)))
                .collect();
            Some(
                indexed
                    .into_values()
                    .filter(|v| !v.is_null())
                    .cloned()
                    .collect(),
            )
        }
        JsonValue::Object(_) => Some(vec![container.as_ref().clone()]),
        _ => None,
    }
}

fn project_element(element: &JsonValue, params: &ReconstructParams) -> Option<JsonValue> {
    if params.project.is_empty() {
        return Some(element.clone());
    }

    let mut projected = Map::new();
    for (output_key, candidates) in &params.project {
        let found = candidates
            .iter()
            .filter_map(|path| lookup_dotted(element, path))
            .find(|v| !v.is_null());
        if let Some(value) = found {
            projected.insert(output_key.clone(), value.clone());
        }
    }

    if projected.is_empty() {
        return None;
    }
    if let Some(required) = &params.require
        && !projected.contains_key(required)
    {
        return None;
    }
    Some(JsonValue::Object(projected))
}

/// Rebuild an ordered array from indexed attributes, optionally projecting
/// each element onto a fixed set of keys.
///
/// Returns `Err` when the input is not a collection and `Ok(None)` when no
/// element survives.
pub fn reconstruct_array(
    value: &JsonValue,
    params: &ReconstructParams,
) -> Result<Option<JsonValue>, String> {
    let elements =
        ordered_elements(value).ok_or_else(|| "expected an array or indexed object".to_string())?;
    let items: Vec<JsonValue> = elements
        .iter()
        .filter_map(|element| project_element(element, params))
        .collect();
    Ok((!items.is_empty()).then_some(JsonValue::Array(items)))
}

/// Concatenate the content of every message with the given role.
///
/// Content may be a string or a list of parts (`[{"type": "text", "text": ..}]`).
/// Entries wrapped as `{"message": {..}}` are unwrapped first.
pub fn filter_by_role(
    value: &JsonValue,
    role: &str,
    separator: &str,
) -> Result<Option<JsonValue>, String> {
    let elements =
        ordered_elements(value).ok_or_else(|| "expected a message collection".to_string())?;

    let mut texts: Vec<String> = Vec::new();
    for element in &elements {
        // OpenInference nests each entry under `message`
        let message = element
            .get("message")
            .filter(|inner| inner.is_object())
            .unwrap_or(element);
        let matches_role = message
            .get("role")
            .and_then(JsonValue::as_str)
            .is_some_and(|r| r.eq_ignore_ascii_case(role));
        if !matches_role {
            continue;
        }
        match message.get("content") {
            Some(JsonValue::String(s)) if !s.is_empty() => texts.push(s.clone()),
            Some(JsonValue::Array(parts)) => {
                let joined: String = parts
                    .iter()
                    .filter_map(|part| match part {
                        JsonValue::String(s) => Some(s.as_str()),
                        other => other.get("text").and_then(JsonValue::as_str),
                    })
                    .collect();
                if !joined.is_empty() {
                    texts.push(joined);
                }
            }
            _ => {}
        }
    }

    if texts.is_empty() {
        Ok(None)
    } else {
        Ok(Some(JsonValue::String(texts.join(separator))))
    }
}
