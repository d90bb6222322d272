//! Target schema mapping
//!
//! Projects extracted semantic fields onto the four canonical sections using
//! the rule set's field mappings. Values are flattened to dot-indexed keys.

pub mod flatten;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::domain::dsl::CompiledBundle;
use crate::domain::dsl::bundle::CompiledMapping;
use crate::domain::dsl::types::Section;
use crate::domain::extract::ExtractedFields;
use crate::domain::transforms::{TransformEngine, TransformError};

use self::flatten::flatten_into;

/// Normalized span: four flat maps of dot-indexed keys to scalars
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub inputs: BTreeMap<String, JsonValue>,
    pub outputs: BTreeMap<String, JsonValue>,
    pub config: BTreeMap<String, JsonValue>,
    pub metadata: BTreeMap<String, JsonValue>,
}

impl CanonicalEvent {
    pub fn section(&self, section: Section) -> &BTreeMap<String, JsonValue> {
        match section {
            Section::Inputs => &self.inputs,
            Section::Outputs => &self.outputs,
            Section::Config => &self.config,
            Section::Metadata => &self.metadata,
        }
    }

    pub fn section_mut(&mut self, section: Section) -> &mut BTreeMap<String, JsonValue> {
        match section {
            Section::Inputs => &mut self.inputs,
            Section::Outputs => &mut self.outputs,
            Section::Config => &mut self.config,
            Section::Metadata => &mut self.metadata,
        }
    }

    pub fn is_empty(&self) -> bool {
        Section::ALL.iter().all(|s| self.section(*s).is_empty())
    }

    pub fn field_count(&self) -> usize {
        Section::ALL.iter().map(|s| self.section(*s).len()).sum()
    }

    pub fn to_json(&self) -> JsonValue {
        let mut root = Map::new();
        for section in Section::ALL {
            let fields: Map<String, JsonValue> = self
                .section(section)
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            root.insert(section.as_str().to_string(), JsonValue::Object(fields));
        }
        JsonValue::Object(root)
    }
}

/// Mapper output with per-field outcomes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MappedEvent {
    pub event: CanonicalEvent,
    /// Required targets (`section.field`) with no value
    pub missing_required: Vec<String>,
    /// Targets skipped because their transform overran its budget
    pub timed_out: Vec<String>,
    /// Targets skipped because their transform rejected the input
    pub failed_transforms: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Mapper {
    bundle: Arc<CompiledBundle>,
    transforms: TransformEngine,
}

impl Mapper {
    pub fn new(bundle: Arc<CompiledBundle>, transforms: TransformEngine) -> Self {
        Self { bundle, transforms }
    }

    /// Map extracted fields with the rule set they were extracted with. No
    /// rule set means nothing was recognized and the event stays empty.
    pub fn map(&self, extracted: &ExtractedFields) -> MappedEvent {
        let mut mapped = MappedEvent::default();
        let Some(rules) = extracted
            .rule_set
            .as_deref()
            .and_then(|name| self.bundle.provider(name))
        else {
            return mapped;
        };

        for mapping in &rules.mappings {
            let target = format!("{}.{}", mapping.section, mapping.field);
            match self.resolve(mapping, extracted) {
                Ok(Some(value)) => {
                    flatten_into(mapped.event.section_mut(mapping.section), &mapping.field, &value);
                }
                Ok(None) => {
                    if mapping.required {
                        mapped.missing_required.push(target);
                    }
                }
                Err(TransformError::BudgetExceeded { .. }) => mapped.timed_out.push(target),
                Err(err) => {
                    tracing::debug!(field = %target, error = %err, "Transform failed, skipping field");
                    mapped.failed_transforms.push(target);
                }
            }
        }
        mapped
    }

    fn resolve(
        &self,
        mapping: &CompiledMapping,
        extracted: &ExtractedFields,
    ) -> Result<Option<JsonValue>, TransformError> {
        let Some(source) = extracted.get(&mapping.source) else {
            return Ok(None);
        };
        let value = match mapping.transform {
            None => source.clone(),
            Some(index) => {
                let inputs: Vec<Option<&JsonValue>> = std::iter::once(Some(source))
                    .chain(mapping.inputs.iter().map(|field| extracted.get(field)))
                    .collect();
                self.transforms.apply_index(index, &inputs)?
            }
        };
        Ok((!value.is_null()).then_some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Attributes;
    use crate::domain::detect::Detector;
    use crate::domain::dsl::{RuleSources, compile_sources};
    use crate::domain::extract::Extractor;
    use crate::utils::clock::SteppingClock;
    use serde_json::json;

    fn bundle() -> Arc<CompiledBundle> {
        Arc::new(compile_sources(&RuleSources::embedded()).unwrap())
    }

    fn map_attrs(pairs: &[(&str, JsonValue)]) -> MappedEvent {
        let bundle = bundle();
        let attrs: Attributes = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        let detection = Detector::new(bundle.clone()).detect(&attrs);
        let extracted = Extractor::new(bundle.clone()).extract(&attrs, &detection);
        let engine = TransformEngine::new(bundle.clone(), Arc::new(SteppingClock::new(0)));
        Mapper::new(bundle, engine).map(&extracted)
    }

    #[test]
    fn test_traceloop_tool_call_round_trip() {
        let mapped = map_attrs(&[
            ("gen_ai.system", json!("openai")),
            ("gen_ai.request.model", json!("gpt-4o")),
            ("gen_ai.prompt.0.role", json!("system")),
            ("gen_ai.prompt.0.content", json!("Be brief")),
            ("gen_ai.prompt.1.role", json!("user")),
            ("gen_ai.prompt.1.content", json!("Find x")),
            ("gen_ai.completion.0.role", json!("assistant")),
            ("gen_ai.completion.0.finish_reason", json!("tool_calls")),
            ("gen_ai.completion.0.tool_calls.0.id", json!("call_1")),
            ("gen_ai.completion.0.tool_calls.0.name", json!("search")),
            ("gen_ai.completion.0.tool_calls.0.arguments", json!("{\"query\":\"x\"}")),
            ("gen_ai.usage.prompt_tokens", json!(10)),
            ("gen_ai.usage.completion_tokens", json!(5)),
        ]);
        let event = &mapped.event;

        assert_eq!(event.inputs.get("messages.0.role"), Some(&json!("system")));
        assert_eq!(event.inputs.get("messages.1.content"), Some(&json!("Find x")));
        assert_eq!(event.inputs.get("system_prompt"), Some(&json!("Be brief")));

        assert_eq!(event.outputs.get("role"), Some(&json!("assistant")));
        assert_eq!(event.outputs.get("finish_reason"), Some(&json!("tool_use")));
        assert_eq!(event.outputs.get("tool_calls.0.id"), Some(&json!("call_1")));
        assert_eq!(event.outputs.get("tool_calls.0.name"), Some(&json!("search")));
        assert_eq!(
            event.outputs.get("tool_calls.0.arguments"),
            Some(&json!("{\"query\":\"x\"}"))
        );

        assert_eq!(event.config.get("provider"), Some(&json!("openai")));
        assert_eq!(event.config.get("model"), Some(&json!("gpt-4o")));
        assert_eq!(event.metadata.get("instrumentor"), Some(&json!("traceloop")));
        assert_eq!(event.metadata.get("prompt_tokens"), Some(&json!(10)));

        let cost = event.metadata.get("cost_usd").and_then(JsonValue::as_f64).unwrap();
        assert!((cost - 0.000075).abs() < 1e-12, "cost was {cost}");
        assert!(mapped.missing_required.is_empty());
    }

    #[test]
    fn test_missing_optional_fields_are_absent() {
        let mapped = map_attrs(&[
            ("gen_ai.system", json!("openai")),
            ("gen_ai.request.model", json!("gpt-4o-mini")),
        ]);
        assert!(!mapped.event.config.contains_key("temperature"));
        assert!(!mapped.event.outputs.values().any(JsonValue::is_null));
        // No token counts, so no cost
        assert!(!mapped.event.metadata.contains_key("cost_usd"));
        assert_eq!(mapped.event.config.get("model"), Some(&json!("gpt-4o-mini")));
    }

    #[test]
    fn test_missing_required_is_counted() {
        let mapped = map_attrs(&[("gen_ai.completion.0.content", json!("hello"))]);
        assert_eq!(mapped.event.outputs.get("content"), Some(&json!("hello")));
        assert_eq!(
            mapped.missing_required,
            vec!["config.provider".to_string(), "config.model".to_string()]
        );
    }

    #[test]
    fn test_no_rule_set_maps_nothing() {
        let mapped = map_attrs(&[("http.method", json!("GET"))]);
        assert!(mapped.event.is_empty());
        assert!(mapped.missing_required.is_empty());
    }

    #[test]
    fn test_budget_overrun_skips_only_that_field() {
        let bundle = bundle();
        let mut extracted = ExtractedFields {
            rule_set: Some("generic".to_string()),
            ..Default::default()
        };
        extracted.insert_if_absent("finish_reason", json!("stop"));
        extracted.insert_if_absent("content", json!("done"));

        let engine = TransformEngine::new(bundle.clone(), Arc::new(SteppingClock::new(10)))
            .with_default_budget(5);
        let mapped = Mapper::new(bundle, engine).map(&extracted);
        assert_eq!(mapped.timed_out, vec!["outputs.finish_reason".to_string()]);
        assert_eq!(mapped.event.outputs.get("content"), Some(&json!("done")));
        assert!(!mapped.event.outputs.contains_key("finish_reason"));
    }

    #[test]
    fn test_to_json_has_four_sections() {
        let json = CanonicalEvent::default().to_json();
        let keys: Vec<&String> = json.as_object().unwrap().keys().collect();
        assert_eq!(keys, ["inputs", "outputs", "config", "metadata"]);
    }
}
