//! Structure discovery for nested provider responses
//!
//! Some instrumentors record the raw provider response as one attribute
//! (an object or a JSON string). Known shapes are matched against the
//! `response` tier patterns and read with the provider's `response` rules;
//! anything else falls back to a bounded breadth-first walk that classifies
//! values by key name at low confidence.

use std::borrow::Cow;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::domain::detect::signature::literal_ids;
use crate::domain::dsl::CompiledBundle;
use crate::domain::dsl::bundle::ProviderRules;
use crate::domain::dsl::types::RESPONSE_TIER;
use crate::domain::extract::combine;
use crate::utils::json::as_container;

/// Deepest level visited by the heuristic walk
const MAX_HEURISTIC_DEPTH: usize = 4;
/// Most nodes visited by the heuristic walk
const MAX_HEURISTIC_NODES: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredField {
    pub value: JsonValue,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    /// Matched a response pattern
    Pattern,
    /// Classified by key names
    Heuristic,
    #[default]
    Unmatched,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscoveredFields {
    /// Matched response pattern id
    pub shape: Option<String>,
    pub provider: Option<String>,
    pub confidence: f64,
    pub method: DiscoveryMethod,
    pub fields: BTreeMap<String, DiscoveredField>,
}

#[derive(Debug, Clone)]
pub struct StructureDiscovery {
    bundle: Arc<CompiledBundle>,
}

impl StructureDiscovery {
    pub fn new(bundle: Arc<CompiledBundle>) -> Self {
        Self { bundle }
    }

    /// Discover semantic fields in a nested value. Never fails; an
    /// unrecognized value yields an empty result.
    pub fn discover(&self, value: &JsonValue) -> DiscoveredFields {
        let Some(container) = as_container(value) else {
            return DiscoveredFields::default();
        };
        let container = container.as_ref();

        if let JsonValue::Object(map) = container
            && let Some(found) = self.match_shape(map, container)
        {
            return found;
        }
        self.heuristic(container)
    }

    fn match_shape(&self, map: &Map<String, JsonValue>, value: &JsonValue) -> Option<DiscoveredFields> {
        let tier = self.bundle.tiers.get(RESPONSE_TIER)?;
        let thresholds = &self.bundle.thresholds;
        let signature = tier.reduce(literal_ids(&self.bundle, map.keys().map(String::as_str)));

        let (entry, mut confidence) = match tier.exact_match(&signature) {
            Some(entry) if entry.confidence >= thresholds.min_confidence => (entry, entry.confidence),
            _ => tier.subset_match(
                &signature,
                thresholds.subset_match_discount,
                thresholds.min_confidence,
            )?,
        };

        let has_unknown_keys = map.keys().any(|key| {
            self.bundle
                .field_id(key)
                .is_none_or(|id| entry.known_fields.binary_search(&id).is_err())
        });
        if has_unknown_keys {
            confidence *= thresholds.subset_match_discount;
        }

        let provider = self.bundle.providers.get(entry.provider)?;
        let fields = self.apply_response_rules(provider, value, confidence);

        tracing::trace!(
            shape = %entry.pattern_id,
            provider = %provider.name,
            confidence,
            fields = fields.len(),
            "Matched response shape"
        );

        Some(DiscoveredFields {
            shape: Some(entry.pattern_id.clone()),
            provider: Some(provider.name.clone()),
            confidence,
            method: DiscoveryMethod::Pattern,
            fields,
        })
    }

    fn apply_response_rules(
        &self,
        provider: &ProviderRules,
        value: &JsonValue,
        confidence: f64,
    ) -> BTreeMap<String, DiscoveredField> {
        let mut fields = BTreeMap::new();
        for rule in provider.response_rules() {
            let resolved = rule.sources.iter().find_map(|spec| {
                let values = spec
                    .terms()
                    .iter()
                    .flat_map(|term| term.resolve_value(value))
                    .map(Cow::Borrowed);
                combine(rule.method, &rule.separator, values)
            });
            let Some(found) = resolved.or_else(|| rule.fallback_value.clone()) else {
                continue;
            };
            if !rule.validation.check(&found) {
                continue;
            }
            if let Some(classification) = self.bundle.classification_for_field(&rule.base)
                && !classification.validation.check(&found)
            {
                continue;
            }
            fields.insert(
                rule.base.clone(),
                DiscoveredField {
                    value: found,
                    confidence,
                },
            );
        }
        fields
    }

    /// Breadth-first key-name classification. The shallowest occurrence of a
    /// field wins.
    fn heuristic(&self, root: &JsonValue) -> DiscoveredFields {
        let confidence = self.bundle.thresholds.heuristic_confidence;
        let mut fields: BTreeMap<String, DiscoveredField> = BTreeMap::new();
        let mut queue = VecDeque::from([(root, 0usize)]);
        let mut visited = 0;

        while let Some((node, depth)) = queue.pop_front() {
            visited += 1;
            if visited > MAX_HEURISTIC_NODES {
                break;
            }
            let descend = depth < MAX_HEURISTIC_DEPTH;
            match node {
                JsonValue::Object(map) => {
                    for (key, child) in map {
                        if let Some(classification) = self.bundle.classify_key(key)
                            && !fields.contains_key(&classification.field)
                            && classification.validation.check(child)
                        {
                            fields.insert(
                                classification.field.clone(),
                                DiscoveredField {
                                    value: child.clone(),
                                    confidence,
                                },
                            );
                        }
                        if descend && (child.is_object() || child.is_array()) {
                            queue.push_back((child, depth + 1));
                        }
                    }
                }
                JsonValue::Array(items) => {
                    if descend {
                        queue.extend(
                            items
                                .iter()
                                .filter(|item| item.is_object() || item.is_array())
                                .map(|item| (item, depth + 1)),
                        );
                    }
                }
                _ => {}
            }
        }

        if fields.is_empty() {
            return DiscoveredFields::default();
        }
        DiscoveredFields {
            shape: None,
            provider: None,
            confidence,
            method: DiscoveryMethod::Heuristic,
            fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::dsl::{RuleSources, compile_sources};
    use serde_json::json;

    fn discovery() -> StructureDiscovery {
        StructureDiscovery::new(Arc::new(compile_sources(&RuleSources::embedded()).unwrap()))
    }

    fn field(found: &DiscoveredFields, name: &str) -> Option<JsonValue> {
        found.fields.get(name).map(|f| f.value.clone())
    }

    #[test]
    fn test_openai_chat_completion() {
        let response = json!({
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "created": 1700000000,
            "model": "gpt-4o-2024-08-06",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hi there"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
        });
        let found = discovery().discover(&response);
        assert_eq!(found.method, DiscoveryMethod::Pattern);
        assert_eq!(found.provider.as_deref(), Some("openai"));
        assert_eq!(found.shape.as_deref(), Some("openai_chat_completion"));
        assert_eq!(found.confidence, 0.95);
        assert_eq!(field(&found, "content"), Some(json!("Hi there")));
        assert_eq!(field(&found, "finish_reason"), Some(json!("stop")));
        assert_eq!(field(&found, "total_tokens"), Some(json!(12)));
        assert_eq!(field(&found, "response_id"), Some(json!("chatcmpl-123")));
        assert_eq!(field(&found, "tool_calls"), None);
    }

    #[test]
    fn test_json_string_input() {
        let raw = json!(r#"{"id":"c1","object":"chat.completion","choices":[{"message":{"role":"assistant","content":"ok"}}]}"#);
        let found = discovery().discover(&raw);
        assert_eq!(found.provider.as_deref(), Some("openai"));
        assert_eq!(field(&found, "content"), Some(json!("ok")));
    }

    #[test]
    fn test_anthropic_message_blocks() {
        let response = json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-sonnet-20241022",
            "content": [
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"city": "Paris"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 20, "output_tokens": 8}
        });
        let found = discovery().discover(&response);
        assert_eq!(found.provider.as_deref(), Some("anthropic"));
        assert_eq!(field(&found, "content"), Some(json!("Let me check.")));
        assert_eq!(field(&found, "finish_reason"), Some(json!("tool_use")));
        assert_eq!(field(&found, "total_tokens"), Some(json!(28)));
        let tool_calls = field(&found, "tool_calls").unwrap();
        assert_eq!(tool_calls.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn test_unknown_keys_discount_confidence() {
        let response = json!({
            "id": "c1",
            "object": "chat.completion",
            "choices": [],
            "prompt_filter_results": []
        });
        let found = discovery().discover(&response);
        assert_eq!(found.provider.as_deref(), Some("openai"));
        assert!((found.confidence - 0.95 * 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_heuristic_fallback() {
        let value = json!({
            "result": {
                "output": {"text": "hello", "stop_reason": "end_turn"},
                "meta": {"model": "custom-1", "total_tokens": 7}
            }
        });
        let found = discovery().discover(&value);
        assert_eq!(found.method, DiscoveryMethod::Heuristic);
        assert_eq!(found.provider, None);
        assert_eq!(found.confidence, 0.4);
        assert_eq!(field(&found, "content"), Some(json!("hello")));
        assert_eq!(field(&found, "finish_reason"), Some(json!("end_turn")));
        assert_eq!(field(&found, "model"), Some(json!("custom-1")));
        assert_eq!(field(&found, "total_tokens"), Some(json!(7)));
    }

    #[test]
    fn test_heuristic_prefers_shallow_and_validates() {
        let value = json!([
            {"role": "", "nested": {"role": "user"}},
            {"role": "assistant"}
        ]);
        let found = discovery().discover(&value);
        assert_eq!(field(&found, "role"), Some(json!("assistant")));
    }

    #[test]
    fn test_heuristic_depth_bound() {
        let value = json!({"a": {"b": {"c": {"d": {"e": {"content": "too deep"}}}}}});
        assert_eq!(discovery().discover(&value), DiscoveredFields::default());
    }

    #[test]
    fn test_scalars_yield_nothing() {
        let d = discovery();
        assert_eq!(d.discover(&json!("plain text")), DiscoveredFields::default());
        assert_eq!(d.discover(&json!(42)), DiscoveredFields::default());
        assert_eq!(d.discover(&JsonValue::Null), DiscoveredFields::default());
    }
}
