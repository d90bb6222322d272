//! Source convention extraction
//!
//! Applies the detected provider's navigation rules for the detected
//! instrumentor. When the provider is unknown the fallback rule set is used,
//! so instrumentor conventions still apply.

pub mod path;

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::domain::detect::DetectionResult;
use crate::domain::dsl::CompiledBundle;
use crate::domain::dsl::bundle::CompiledRule;
use crate::domain::dsl::types::ExtractionMethod;
use crate::domain::{Attributes, INSTRUMENTOR_FIELD, PROVIDER_FIELD};
use crate::utils::json::{as_container, as_f64};

/// Semantic fields extracted from one span
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractedFields {
    /// Provider whose rules were applied
    pub rule_set: Option<String>,
    pub fields: BTreeMap<String, JsonValue>,
    /// Fields whose value failed rule validation
    pub rejected: Vec<String>,
}

impl ExtractedFields {
    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.fields.get(field)
    }

    /// Insert unless the field is already present. Returns whether it was
    /// inserted.
    pub fn insert_if_absent(&mut self, field: &str, value: JsonValue) -> bool {
        if self.fields.contains_key(field) {
            return false;
        }
        self.fields.insert(field.to_string(), value);
        true
    }
}

#[derive(Debug, Clone)]
pub struct Extractor {
    bundle: Arc<CompiledBundle>,
}

impl Extractor {
    pub fn new(bundle: Arc<CompiledBundle>) -> Self {
        Self { bundle }
    }

    pub fn extract(&self, attrs: &Attributes, detection: &DetectionResult) -> ExtractedFields {
        let mut out = ExtractedFields::default();
        if let Some(provider) = &detection.provider {
            out.fields
                .insert(PROVIDER_FIELD.to_string(), JsonValue::String(provider.clone()));
        }
        let Some(instrumentor) = detection.instrumentor.as_deref() else {
            return out;
        };
        out.fields.insert(
            INSTRUMENTOR_FIELD.to_string(),
            JsonValue::String(instrumentor.to_string()),
        );

        let Some(rules) = self
            .bundle
            .rule_set_for(detection.provider.as_deref())
            .and_then(|i| self.bundle.providers.get(i))
        else {
            return out;
        };
        out.rule_set = Some(rules.name.clone());

        for rule in rules.rules_for(instrumentor) {
            let Some(value) = extract_rule(attrs, rule) else {
                continue;
            };
            if rule.validation.check(&value) {
                out.fields.insert(rule.base.clone(), value);
            } else {
                tracing::debug!(rule = %rule.id, "Extracted value failed validation");
                out.rejected.push(rule.base.clone());
            }
        }
        out
    }
}

/// Resolve a rule against span attributes: each source in order, then the
/// fallback value.
pub fn extract_rule(attrs: &Attributes, rule: &CompiledRule) -> Option<JsonValue> {
    rule.sources
        .iter()
        .find_map(|spec| {
            let values = spec.terms().iter().flat_map(|term| term.resolve(attrs));
            combine(rule.method, &rule.separator, values)
        })
        .or_else(|| rule.fallback_value.clone().filter(|v| !v.is_null()))
}

/// Reduce resolved values with an extraction method. `None` when nothing
/// usable was resolved.
pub fn combine<'v>(
    method: ExtractionMethod,
    separator: &str,
    values: impl IntoIterator<Item = Cow<'v, JsonValue>>,
) -> Option<JsonValue> {
    let mut values = values.into_iter();
    match method {
        ExtractionMethod::DirectCopy => values.next().map(Cow::into_owned),
        ExtractionMethod::ArrayFlatten => {
            let mut items = Vec::new();
            for value in values {
                match value.into_owned() {
                    JsonValue::Array(inner) => items.extend(inner.into_iter().filter(|v| !v.is_null())),
                    other => items.push(other),
                }
            }
            (!items.is_empty()).then_some(JsonValue::Array(items))
        }
        ExtractionMethod::ObjectMerge => {
            let mut merged = Map::new();
            for value in values {
                if let Some(container) = as_container(&value)
                    && let JsonValue::Object(map) = container.as_ref()
                {
                    for (key, item) in map {
                        merged.entry(key.clone()).or_insert_with(|| item.clone());
                    }
                }
            }
            (!merged.is_empty()).then_some(JsonValue::Object(merged))
        }
        ExtractionMethod::StringConcat => {
            let parts: Vec<String> = values
                .filter_map(|value| match value.as_ref() {
                    JsonValue::String(s) => Some(s.clone()),
                    JsonValue::Number(n) => Some(n.to_string()),
                    JsonValue::Bool(b) => Some(b.to_string()),
                    _ => None,
                })
                .collect();
            (!parts.is_empty()).then(|| JsonValue::String(parts.join(separator)))
        }
        ExtractionMethod::NumericSum => {
            let mut float_sum = 0.0;
            // Exact running total while every term is an integer
            let mut int_sum: Option<i128> = Some(0);
            let mut any = false;
            for value in values {
                let Some(n) = as_f64(&value) else {
                    continue;
                };
                any = true;
                float_sum += n;
                int_sum = int_sum
                    .zip(integral_term(&value))
                    .and_then(|(acc, term)| acc.checked_add(term));
            }
            if !any {
                return None;
            }
            match int_sum {
                Some(total) => match i64::try_from(total) {
                    Ok(total) => Some(JsonValue::from(total)),
                    Err(_) => {
                        tracing::debug!(total = %total, "Integer sum out of range, dropping field");
                        None
                    }
                },
                None => serde_json::Number::from_f64(float_sum).map(JsonValue::Number),
            }
        }
    }
}

/// Integer value of a sum term, if it is written as one.
fn integral_term(value: &JsonValue) -> Option<i128> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .map(i128::from)
            .or_else(|| n.as_u64().map(i128::from)),
        JsonValue::String(s) => s.trim().parse::<i128>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::detect::Detector;
    use crate::domain::dsl::{RuleSources, compile_sources};
    use serde_json::json;

    fn bundle() -> Arc<CompiledBundle> {
        Arc::new(compile_sources(&RuleSources::embedded()).unwrap())
    }

    fn attrs(pairs: &[(&str, JsonValue)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn run(a: &Attributes) -> ExtractedFields {
        let bundle = bundle();
        let detection = Detector::new(bundle.clone()).detect(a);
        Extractor::new(bundle).extract(a, &detection)
    }

    fn borrowed(values: &[JsonValue]) -> Vec<Cow<'_, JsonValue>> {
        values.iter().map(Cow::Borrowed).collect()
    }

    #[test]
    fn test_combine_direct_copy() {
        let values = [json!("a"), json!("b")];
        assert_eq!(
            combine(ExtractionMethod::DirectCopy, "", borrowed(&values)),
            Some(json!("a"))
        );
        assert_eq!(combine(ExtractionMethod::DirectCopy, "", Vec::new()), None);
    }

    #[test]
    fn test_combine_array_flatten() {
        let values = [json!([1, 2]), json!(3), json!([null, 4])];
        assert_eq!(
            combine(ExtractionMethod::ArrayFlatten, "", borrowed(&values)),
            Some(json!([1, 2, 3, 4]))
        );
    }

    #[test]
    fn test_combine_object_merge_first_wins() {
        let values = [json!({"a": 1}), json!(r#"{"a": 2, "b": 3}"#), json!("plain")];
        assert_eq!(
            combine(ExtractionMethod::ObjectMerge, "", borrowed(&values)),
            Some(json!({"a": 1, "b": 3}))
        );
    }

    #[test]
    fn test_combine_string_concat() {
        let values = [json!("Hello"), json!({"skip": true}), json!(" world"), json!(2)];
        assert_eq!(
            combine(ExtractionMethod::StringConcat, "", borrowed(&values)),
            Some(json!("Hello world2"))
        );
        let values = [json!("a"), json!("b")];
        assert_eq!(
            combine(ExtractionMethod::StringConcat, "\n", borrowed(&values)),
            Some(json!("a\nb"))
        );
    }

    #[test]
    fn test_combine_numeric_sum() {
        let values = [json!(10), json!("5"), json!("n/a")];
        assert_eq!(
            combine(ExtractionMethod::NumericSum, "", borrowed(&values)),
            Some(json!(15))
        );
        let values = [json!(0.25), json!(1)];
        assert_eq!(
            combine(ExtractionMethod::NumericSum, "", borrowed(&values)),
            Some(json!(1.25))
        );
        let values = [json!("none")];
        assert_eq!(combine(ExtractionMethod::NumericSum, "", borrowed(&values)), None);
    }

    #[test]
    fn test_combine_numeric_sum_is_exact_for_large_integers() {
        // 2^53 + 1 is not representable as f64
        let values = [json!(9_007_199_254_740_992_i64), json!(1)];
        assert_eq!(
            combine(ExtractionMethod::NumericSum, "", borrowed(&values)),
            Some(json!(9_007_199_254_740_993_i64))
        );
        let values = [json!(i64::MAX), json!("1")];
        assert_eq!(combine(ExtractionMethod::NumericSum, "", borrowed(&values)), None);
        let values = [json!(u64::MAX), json!(-1)];
        assert_eq!(combine(ExtractionMethod::NumericSum, "", borrowed(&values)), None);
    }

    #[test]
    fn test_extract_traceloop_openai() {
        let a = attrs(&[
            ("gen_ai.system", json!("openai")),
            ("gen_ai.request.model", json!("gpt-4o")),
            ("gen_ai.completion.0.role", json!("assistant")),
            ("gen_ai.completion.0.content", json!("Hello")),
            ("gen_ai.completion.0.finish_reason", json!("stop")),
            ("gen_ai.usage.prompt_tokens", json!(12)),
            ("gen_ai.usage.completion_tokens", json!(3)),
        ]);
        let extracted = run(&a);
        assert_eq!(extracted.rule_set.as_deref(), Some("openai"));
        assert_eq!(extracted.get("provider"), Some(&json!("openai")));
        assert_eq!(extracted.get("instrumentor"), Some(&json!("traceloop")));
        assert_eq!(extracted.get("model"), Some(&json!("gpt-4o")));
        assert_eq!(extracted.get("role"), Some(&json!("assistant")));
        assert_eq!(extracted.get("content"), Some(&json!("Hello")));
        assert_eq!(extracted.get("prompt_tokens"), Some(&json!(12)));
        assert_eq!(extracted.get("temperature"), None);
        assert!(extracted.rejected.is_empty());
    }

    #[test]
    fn test_extract_uses_fallback_paths_and_overrides() {
        let a = attrs(&[
            ("gen_ai.system", json!("anthropic")),
            ("gen_ai.request.model", json!("claude-3-5-sonnet")),
            ("gen_ai.usage.input_tokens", json!(100)),
            ("gen_ai.usage.output_tokens", json!(20)),
        ]);
        let extracted = run(&a);
        assert_eq!(extracted.get("prompt_tokens"), Some(&json!(100)));
        assert_eq!(extracted.get("completion_tokens"), Some(&json!(20)));
        assert_eq!(extracted.get("total_tokens"), Some(&json!(120)));
    }

    #[test]
    fn test_extract_object_merge_tool_calls() {
        let a = attrs(&[
            ("gen_ai.system", json!("openai")),
            ("gen_ai.request.model", json!("gpt-4o")),
            ("gen_ai.completion.0.tool_calls.0.id", json!("call_1")),
            ("gen_ai.completion.0.tool_calls.0.name", json!("search")),
            ("gen_ai.completion.0.tool_calls.0.arguments", json!(r#"{"q":"rust"}"#)),
        ]);
        let extracted = run(&a);
        assert_eq!(
            extracted.get("tool_calls"),
            Some(&json!({"0": {"arguments": r#"{"q":"rust"}"#, "id": "call_1", "name": "search"}}))
        );
    }

    #[test]
    fn test_extract_unknown_provider_uses_fallback_rules() {
        let a = attrs(&[
            ("gen_ai.request.model", json!("mystery-1")),
            ("gen_ai.completion.0.content", json!("hi")),
        ]);
        let extracted = run(&a);
        assert_eq!(extracted.rule_set.as_deref(), Some("generic"));
        assert_eq!(extracted.get("provider"), None);
        assert_eq!(extracted.get("model"), Some(&json!("mystery-1")));
        assert_eq!(extracted.get("content"), Some(&json!("hi")));
    }

    #[test]
    fn test_extract_validation_rejects() {
        let a = attrs(&[
            ("gen_ai.system", json!("openai")),
            ("gen_ai.request.model", json!("gpt-4o")),
            ("gen_ai.request.temperature", json!("warm")),
        ]);
        let extracted = run(&a);
        assert_eq!(extracted.get("temperature"), None);
        assert_eq!(extracted.rejected, vec!["temperature".to_string()]);
    }

    #[test]
    fn test_extract_fallback_value() {
        let a = attrs(&[
            ("spanmold.provider", json!("openai")),
            ("spanmold.model", json!("gpt-4o")),
        ]);
        let extracted = run(&a);
        assert_eq!(extracted.get("instrumentor"), Some(&json!("direct")));
        assert_eq!(extracted.get("role"), Some(&json!("assistant")));
    }

    #[test]
    fn test_extract_no_instrumentor() {
        let a = attrs(&[("http.method", json!("GET"))]);
        assert_eq!(run(&a), ExtractedFields::default());
    }

    #[test]
    fn test_insert_if_absent() {
        let mut fields = ExtractedFields::default();
        assert!(fields.insert_if_absent("content", json!("a")));
        assert!(!fields.insert_if_absent("content", json!("b")));
        assert_eq!(fields.get("content"), Some(&json!("a")));
    }
}
