//! Transform engine
//!
//! Transforms are declared by name in rule files and resolved at compile time
//! into a [`TransformKind`], so invoking one is a `match` on a closed enum
//! rather than a string lookup. Every invocation is timed against a
//! microsecond budget; a transform that overruns is reported as
//! [`TransformError::BudgetExceeded`] and its field is skipped by the mapper.

pub mod messages;
pub mod pricing;
pub mod text;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::domain::dsl::CompiledBundle;
use crate::domain::dsl::types::PerformanceClass;
use crate::utils::clock::Clock;
use crate::utils::json::as_f64;

use self::messages::ReconstructParams;
use self::pricing::TokenUsage;

// ============================================================================
// ERROR TYPE
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("unknown transform '{0}'")]
    Unknown(String),

    #[error("transform '{name}' exceeded its {budget_us}us budget (took {elapsed_us}us)")]
    BudgetExceeded {
        name: String,
        elapsed_us: u64,
        budget_us: u64,
    },

    #[error("transform '{name}' rejected its input: {reason}")]
    InvalidInput { name: String, reason: String },
}

// ============================================================================
// COMPILED TRANSFORMS
// ============================================================================

/// Built-in transform family with its resolved parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransformKind {
    /// Indexed attributes or arrays -> ordered array, optionally projected
    ReconstructArray(ReconstructParams),
    /// Content of every message with a role, joined
    FilterByRole { role: String, separator: String },
    /// USD cost from the pricing table.
    /// Inputs: model, then provider, input tokens, output tokens, cache-read tokens
    EstimateCost,
    /// Provider finish reason -> stop/length/tool_use/content_filter/error
    NormalizeFinishReason,
    /// Trim and optionally truncate text
    NormalizeText { max_length: Option<usize> },
    /// JSON array or comma-separated string -> array of strings
    StringList,
}

impl TransformKind {
    /// Names accepted in the `implementation` field of a transform definition
    pub const IMPLEMENTATIONS: &'static [&'static str] = &[
        "reconstruct_array",
        "filter_by_role",
        "estimate_cost",
        "normalize_finish_reason",
        "normalize_text",
        "string_list",
    ];

    /// Resolve an implementation name and its parameters.
    pub fn resolve(implementation: &str, params: &BTreeMap<String, JsonValue>) -> Result<Self, String> {
        let no_params = |kind: Self| {
            if params.is_empty() {
                Ok(kind)
            } else {
                Err(format!("'{implementation}' takes no parameters"))
            }
        };

        match implementation {
            "reconstruct_array" => ReconstructParams::from_params(params).map(Self::ReconstructArray),
            "filter_by_role" => {
                let mut role = None;
                let mut separator = "\n".to_string();
                for (key, value) in params {
                    match (key.as_str(), value) {
                        ("role", JsonValue::String(r)) if !r.is_empty() => role = Some(r.clone()),
                        ("separator", JsonValue::String(s)) => separator = s.clone(),
                        (other, _) => return Err(format!("invalid parameter '{other}'")),
                    }
                }
                let role = role.ok_or_else(|| "'filter_by_role' requires a 'role'".to_string())?;
                Ok(Self::FilterByRole { role, separator })
            }
            "normalize_text" => {
                let mut max_length = None;
                for (key, value) in params {
                    match (key.as_str(), value.as_u64()) {
                        ("max_length", Some(n)) if n > 0 => {
                            max_length = usize::try_from(n).ok();
                        }
                        (other, _) => return Err(format!("invalid parameter '{other}'")),
                    }
                }
                Ok(Self::NormalizeText { max_length })
            }
            "estimate_cost" => no_params(Self::EstimateCost),
            "normalize_finish_reason" => no_params(Self::NormalizeFinishReason),
            "string_list" => no_params(Self::StringList),
            other => Err(format!(
                "unknown implementation '{other}' (expected one of: {})",
                Self::IMPLEMENTATIONS.join(", ")
            )),
        }
    }
}

/// A transform as stored in the bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledTransform {
    pub name: String,
    pub kind: TransformKind,
    pub performance_class: PerformanceClass,
    /// Per-transform ceiling; falls back to the engine default
    pub budget_us: Option<u64>,
}

// ============================================================================
// TRANSFORM ENGINE
// ============================================================================

/// Executes compiled transforms under a time budget
#[derive(Debug, Clone)]
pub struct TransformEngine {
    bundle: Arc<CompiledBundle>,
    clock: Arc<dyn Clock>,
    default_budget_us: u64,
}

impl TransformEngine {
    pub fn new(bundle: Arc<CompiledBundle>, clock: Arc<dyn Clock>) -> Self {
        let default_budget_us = bundle.transform_budget_us;
        Self {
            bundle,
            clock,
            default_budget_us,
        }
    }

    /// Override the budget used by transforms that do not declare their own.
    pub fn with_default_budget(mut self, budget_us: u64) -> Self {
        self.default_budget_us = budget_us;
        self
    }

    /// Apply a transform by name.
    ///
    /// `inputs[0]` is the mapped source value; further entries are the
    /// mapping's extra inputs in declaration order. A missing source yields
    /// `Null`.
    pub fn apply(&self, name: &str, inputs: &[Option<&JsonValue>]) -> Result<JsonValue, TransformError> {
        let index = self
            .bundle
            .transform_index(name)
            .ok_or_else(|| TransformError::Unknown(name.to_string()))?;
        self.apply_index(index, inputs)
    }

    /// Apply a transform resolved at compile time.
    pub fn apply_index(
        &self,
        index: usize,
        inputs: &[Option<&JsonValue>],
    ) -> Result<JsonValue, TransformError> {
        let transform = self
            .bundle
            .transforms
            .get(index)
            .ok_or_else(|| TransformError::Unknown(format!("#{index}")))?;
        let budget_us = transform.budget_us.unwrap_or(self.default_budget_us);

        let start = self.clock.now_micros();
        let result = self.run(transform, inputs);
        let elapsed_us = self.clock.now_micros().saturating_sub(start);

        if elapsed_us > budget_us {
            tracing::warn!(
                transform = %transform.name,
                elapsed_us,
                budget_us,
                "Transform exceeded time budget, skipping field"
            );
            return Err(TransformError::BudgetExceeded {
                name: transform.name.clone(),
                elapsed_us,
                budget_us,
            });
        }
        result
    }

    fn run(
        &self,
        transform: &CompiledTransform,
        inputs: &[Option<&JsonValue>],
    ) -> Result<JsonValue, TransformError> {
        let Some(primary) = inputs.first().copied().flatten() else {
            return Ok(JsonValue::Null);
        };
        let extra = inputs.get(1..).unwrap_or_default();
        let invalid = |reason: String| TransformError::InvalidInput {
            name: transform.name.clone(),
            reason,
        };

        let output = match &transform.kind {
            TransformKind::ReconstructArray(params) => {
                messages::reconstruct_array(primary, params).map_err(invalid)?
            }
            TransformKind::FilterByRole { role, separator } => {
                messages::filter_by_role(primary, role, separator).map_err(invalid)?
            }
            TransformKind::EstimateCost => self.estimate_cost(primary, extra),
            TransformKind::NormalizeFinishReason => text::normalize_finish_reason(primary),
            TransformKind::NormalizeText { max_length } => text::normalize_text(primary, *max_length),
            TransformKind::StringList => text::string_list(primary),
        };
        Ok(output.unwrap_or(JsonValue::Null))
    }

    fn estimate_cost(&self, model: &JsonValue, extra: &[Option<&JsonValue>]) -> Option<JsonValue> {
        let model = model.as_str()?;
        let provider = extra.first().copied().flatten().and_then(JsonValue::as_str);
        let tokens = |i: usize| {
            extra
                .get(i)
                .copied()
                .flatten()
                .and_then(as_f64)
                .map_or(0, |n| n as i64)
        };
        let usage = TokenUsage {
            input_tokens: tokens(1),
            output_tokens: tokens(2),
            cache_read_tokens: tokens(3),
        };
        let cost = self.bundle.pricing.estimate(provider, model, usage)?;
        serde_json::Number::from_f64(cost).map(JsonValue::Number)
    }
}

#[cfg(test)]
#[path = "transforms_tests.rs"]
mod tests;
