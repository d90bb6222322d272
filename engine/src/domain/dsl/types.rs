//! Rule file schema
//!
//! Serde models for `core.yaml` and `providers/*.yaml`. These are the raw,
//! unvalidated shapes; see `validate` for the static checks and `compile` for
//! the runtime representation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::domain::transforms::pricing::ModelPricing;

/// Pseudo-instrumentor tagging patterns and rules that describe raw provider
/// response objects rather than span attributes.
pub const RESPONSE_TIER: &str = "response";

// ============================================================================
// ENUMS
// ============================================================================

/// Canonical event section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Section {
    Inputs,
    Outputs,
    Config,
    Metadata,
}

impl Section {
    pub const ALL: [Section; 4] = [
        Section::Inputs,
        Section::Outputs,
        Section::Config,
        Section::Metadata,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inputs => "inputs",
            Self::Outputs => "outputs",
            Self::Config => "config",
            Self::Metadata => "metadata",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|section| section.as_str() == s)
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a navigation rule turns resolved path values into one field value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum ExtractionMethod {
    /// Copy a single value unchanged
    #[default]
    #[serde(alias = "direct_copy")]
    DirectCopy,
    /// Collect every resolved value into one array
    #[serde(alias = "array_flatten")]
    ArrayFlatten,
    /// Merge prefixed attributes (or resolved objects) into one object
    #[serde(alias = "object_merge")]
    ObjectMerge,
    /// Join resolved scalars with the rule separator
    #[serde(alias = "string_concat")]
    StringConcat,
    /// Add up resolved numbers
    #[serde(alias = "numeric_sum")]
    NumericSum,
}

impl ExtractionMethod {
    /// Methods that combine several values accept wildcards and `+` terms.
    pub fn aggregates(self) -> bool {
        matches!(
            self,
            Self::ArrayFlatten | Self::StringConcat | Self::NumericSum
        )
    }
}

/// Declared complexity of a transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum PerformanceClass {
    O1,
    OLogN,
}

impl PerformanceClass {
    /// Parse the rule-file spelling. Anything outside constant or
    /// logarithmic time is rejected.
    pub fn parse(s: &str) -> Option<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '(' && *c != ')')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "o1" => Some(Self::O1),
            "ologn" => Some(Self::OLogN),
            _ => None,
        }
    }
}

/// Expected JSON type of an extracted value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    #[default]
    Any,
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

// ============================================================================
// VALIDATION
// ============================================================================

/// Content validator attached to navigation rules and field classifications
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Validation {
    #[serde(rename = "type", default)]
    pub value_type: ValueType,
    #[serde(default)]
    pub non_empty: bool,
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl Validation {
    /// Check a value against the validator. Null never passes.
    pub fn check(&self, value: &JsonValue) -> bool {
        let type_ok = match self.value_type {
            ValueType::Any => !value.is_null(),
            ValueType::String => value.is_string(),
            ValueType::Integer => value.is_i64() || value.is_u64(),
            ValueType::Number => value.is_number(),
            ValueType::Boolean => value.is_boolean(),
            ValueType::Array => value.is_array(),
            ValueType::Object => value.is_object(),
        };
        if !type_ok {
            return false;
        }

        let length = match value {
            JsonValue::String(s) => Some(s.chars().count()),
            JsonValue::Array(items) => Some(items.len()),
            JsonValue::Object(map) => Some(map.len()),
            _ => None,
        };
        if let Some(len) = length {
            if self.non_empty && len == 0 {
                return false;
            }
            if self.min_length.is_some_and(|min| len < min) {
                return false;
            }
            if self.max_length.is_some_and(|max| len > max) {
                return false;
            }
        }

        if let Some(n) = value.as_f64() {
            if self.min.is_some_and(|min| n < min) {
                return false;
            }
            if self.max.is_some_and(|max| n > max) {
                return false;
            }
        }

        true
    }
}

// ============================================================================
// CORE SCHEMA
// ============================================================================

/// Detection and discovery thresholds
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Thresholds {
    /// Minimum confidence for a provider match to be reported
    pub min_confidence: f64,
    /// Confidence assigned to provider-name value matches
    pub value_match_confidence: f64,
    /// Multiplier applied to pattern weights for subset matches
    pub subset_match_discount: f64,
    /// Minimum confidence for discovered fields to be merged into a span
    pub discovery_min_confidence: f64,
    /// Confidence assigned to key-name heuristic discoveries
    pub heuristic_confidence: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            value_match_confidence: 0.85,
            subset_match_discount: 0.9,
            discovery_min_confidence: 0.3,
            heuristic_confidence: 0.4,
        }
    }
}

/// Key-prefix rule identifying one instrumentation library
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InstrumentorRule {
    pub name: String,
    #[serde(default)]
    pub strong_prefixes: Vec<String>,
    #[serde(default)]
    pub weak_prefixes: Vec<String>,
}

/// Key-name classification used by structure discovery
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FieldClassification {
    pub field: String,
    pub keys: Vec<String>,
    #[serde(default)]
    pub validation: Validation,
}

/// `core.yaml`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreSchema {
    pub version: u32,
    pub sections: Vec<String>,
    #[serde(default)]
    pub fallback_provider: Option<String>,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub transform_budget_us: Option<u64>,
    pub instrumentors: Vec<InstrumentorRule>,
    #[serde(default)]
    pub provider_fields: Vec<String>,
    #[serde(default)]
    pub discovery_sources: Vec<String>,
    #[serde(default)]
    pub field_classifications: Vec<FieldClassification>,
    #[serde(default)]
    pub transforms: Vec<TransformDef>,
}

// ============================================================================
// PROVIDER FILES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StructurePatternDef {
    pub id: String,
    pub instrumentor: String,
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub optional_fields: Vec<String>,
    pub confidence_weight: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NavigationRuleDef {
    pub id: String,
    pub instrumentor: String,
    pub source_path: String,
    #[serde(default)]
    pub fallback_paths: Vec<String>,
    #[serde(default)]
    pub extraction_method: ExtractionMethod,
    #[serde(default)]
    pub separator: Option<String>,
    #[serde(default)]
    pub fallback_value: Option<JsonValue>,
    #[serde(default)]
    pub validation: Validation,
}

impl NavigationRuleDef {
    /// Semantic field name: the rule id without its `_<instrumentor>` suffix.
    pub fn base_name(&self) -> Option<&str> {
        self.id
            .strip_suffix(self.instrumentor.as_str())
            .and_then(|rest| rest.strip_suffix('_'))
            .filter(|base| !base.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldMappingDef {
    pub section: String,
    pub field: String,
    pub source: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub transform: Option<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformDef {
    pub name: String,
    pub implementation: String,
    #[serde(default)]
    pub input_type: Option<String>,
    #[serde(default)]
    pub output_type: Option<String>,
    pub performance_class: String,
    #[serde(default)]
    pub budget_us: Option<u64>,
    #[serde(default)]
    pub params: BTreeMap<String, JsonValue>,
}

/// `providers/<name>.yaml`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderFile {
    pub provider: String,
    #[serde(default)]
    pub extends: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub structure_patterns: Vec<StructurePatternDef>,
    #[serde(default)]
    pub navigation_rules: Vec<NavigationRuleDef>,
    #[serde(default)]
    pub field_mappings: Vec<FieldMappingDef>,
    #[serde(default)]
    pub transforms: Vec<TransformDef>,
    #[serde(default)]
    pub pricing: BTreeMap<String, ModelPricing>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_section_parse_and_display() {
        assert_eq!(Section::parse("outputs"), Some(Section::Outputs));
        assert_eq!(Section::parse("Outputs"), None);
        assert_eq!(Section::Metadata.to_string(), "metadata");
    }

    #[test]
    fn test_performance_class_parse() {
        assert_eq!(PerformanceClass::parse("O1"), Some(PerformanceClass::O1));
        assert_eq!(PerformanceClass::parse("O(1)"), Some(PerformanceClass::O1));
        assert_eq!(
            PerformanceClass::parse("O(log n)"),
            Some(PerformanceClass::OLogN)
        );
        assert_eq!(PerformanceClass::parse("OLogN"), Some(PerformanceClass::OLogN));
        assert_eq!(PerformanceClass::parse("O(n)"), None);
        assert_eq!(PerformanceClass::parse("O(n^2)"), None);
        assert_eq!(PerformanceClass::parse("O(n²)"), None);
    }

    #[test]
    fn test_extraction_method_aliases() {
        let method: ExtractionMethod = serde_yaml::from_str("object_merge").unwrap();
        assert_eq!(method, ExtractionMethod::ObjectMerge);
        let method: ExtractionMethod = serde_yaml::from_str("NumericSum").unwrap();
        assert_eq!(method, ExtractionMethod::NumericSum);
    }

    #[test]
    fn test_validation_types() {
        let v = Validation {
            value_type: ValueType::Integer,
            min: Some(0.0),
            ..Default::default()
        };
        assert!(v.check(&json!(12)));
        assert!(!v.check(&json!(-1)));
        assert!(!v.check(&json!(1.5)));
        assert!(!v.check(&json!("12")));
    }

    #[test]
    fn test_validation_lengths() {
        let v = Validation {
            value_type: ValueType::String,
            non_empty: true,
            max_length: Some(5),
            ..Default::default()
        };
        assert!(v.check(&json!("stop")));
        assert!(!v.check(&json!("")));
        assert!(!v.check(&json!("too long")));
    }

    #[test]
    fn test_validation_any_rejects_null() {
        let v = Validation::default();
        assert!(v.check(&json!(false)));
        assert!(!v.check(&JsonValue::Null));
    }

    #[test]
    fn test_rule_base_name() {
        let rule = NavigationRuleDef {
            id: "tool_calls_traceloop".into(),
            instrumentor: "traceloop".into(),
            source_path: "gen_ai.completion.0.tool_calls.".into(),
            fallback_paths: vec![],
            extraction_method: ExtractionMethod::ObjectMerge,
            separator: None,
            fallback_value: None,
            validation: Validation::default(),
        };
        assert_eq!(rule.base_name(), Some("tool_calls"));

        let bad = NavigationRuleDef {
            id: "traceloop".into(),
            ..rule
        };
        assert_eq!(bad.base_name(), None);
    }
}
