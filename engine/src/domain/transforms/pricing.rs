//! Per-model pricing table for cost estimation
//!
//! Prices come from the `pricing` blocks of provider rule files and are
//! compiled into the bundle. Lookup tries progressively looser strategies so
//! that dated, prefixed, and `-latest` model ids still resolve.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

// ============================================================================
// PRICE TABLE
// ============================================================================

/// Price entry for one model (USD per token)
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModelPricing {
    pub input_cost_per_token: f64,
    pub output_cost_per_token: f64,
    #[serde(default)]
    pub cache_read_input_token_cost: f64,
    #[serde(default)]
    pub cache_creation_input_token_cost: f64,
    /// "chat" (default) or "embedding"; embeddings only charge input tokens
    #[serde(default)]
    pub mode: Option<String>,
}

/// How a model id was matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// Exact key match
    Exact,
    /// Matched after stripping a `provider/` prefix
    ProviderPrefix,
    /// Matched after stripping a `-latest` suffix
    Alias,
    /// Matched the base model after stripping a date suffix
    Family,
}

/// Token counts for one span
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
}

impl TokenUsage {
    pub fn is_empty(&self) -> bool {
        self.input_tokens <= 0 && self.output_tokens <= 0 && self.cache_read_tokens <= 0
    }
}

// ============================================================================
// PRICING TABLE
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingTable {
    /// Lowercase model key -> pricing
    models: FxHashMap<String, ModelPricing>,
    /// Lowercase model key -> owning provider
    owners: FxHashMap<String, String>,
}

impl PricingTable {
    pub fn insert(&mut self, provider: &str, model: &str, pricing: ModelPricing) {
        let key = model.to_lowercase();
        self.owners.insert(key.clone(), provider.to_string());
        self.models.insert(key, pricing);
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Find pricing for a model id.
    ///
    /// Strategies, in order:
    /// 1. Exact match (case-insensitive)
    /// 2. `provider/model` with the prefix stripped
    /// 3. `-latest` suffix stripped
    /// 4. Date suffix stripped (`-20241022`, `-2024-08-06`)
    ///
    /// When `provider` is given, entries owned by a different provider are
    /// skipped so that a shared model name cannot be priced by the wrong table.
    pub fn lookup(&self, provider: Option<&str>, model: &str) -> Option<(&ModelPricing, MatchType)> {
        let model_lower = model.trim().to_lowercase();
        if model_lower.is_empty() {
            return None;
        }

        if let Some(pricing) = self.get_owned(provider, &model_lower) {
            return Some((pricing, MatchType::Exact));
        }

        let unprefixed = model_lower
            .split_once('/')
            .map(|(_, rest)| rest)
            .filter(|rest| !rest.is_empty());
        if let Some(rest) = unprefixed
            && let Some(pricing) = self.get_owned(provider, rest)
        {
            return Some((pricing, MatchType::ProviderPrefix));
        }

        let base = unprefixed.unwrap_or(model_lower.as_str());
        if let Some(stripped) = base.strip_suffix("-latest")
            && let Some(pricing) = self.get_owned(provider, stripped)
        {
            return Some((pricing, MatchType::Alias));
        }

        let family = strip_date_suffix(base);
        if family != base
            && let Some(pricing) = self.get_owned(provider, family)
        {
            return Some((pricing, MatchType::Family));
        }

        None
    }

    fn get_owned(&self, provider: Option<&str>, key: &str) -> Option<&ModelPricing> {
        let pricing = self.models.get(key)?;
        match (provider, self.owners.get(key)) {
            (Some(wanted), Some(owner)) if !owner.eq_ignore_ascii_case(wanted) => None,
            _ => Some(pricing),
        }
    }

    /// Estimated USD cost for a span, or `None` when nothing can be priced.
    pub fn estimate(&self, provider: Option<&str>, model: &str, usage: TokenUsage) -> Option<f64> {
        if usage.is_empty() {
            return None;
        }
        let Some((pricing, match_type)) = self.lookup(provider, model) else {
            tracing::trace!(
                model = model,
                provider = provider.unwrap_or("none"),
                "Model has no price entry"
            );
            return None;
        };

        let is_embedding = pricing
            .mode
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case("embedding"));

        // Clamp to avoid negative costs from corrupt counters
        let input = usage.input_tokens.max(0) as f64;
        let output = usage.output_tokens.max(0) as f64;
        let cache_read = usage.cache_read_tokens.max(0) as f64;

        let input_cost = input * pricing.input_cost_per_token;
        let output_cost = if is_embedding {
            0.0
        } else {
            output * pricing.output_cost_per_token
        };
        let cache_cost = cache_read * pricing.cache_read_input_token_cost;
        let total = input_cost + output_cost + cache_cost;

        tracing::trace!(
            model = model,
            match_type = ?match_type,
            total_cost = total,
            "Estimated cost"
        );
        Some(total)
    }
}

/// Strip a trailing date from a model id.
///
/// - "claude-3-5-sonnet-20241022" -> "claude-3-5-sonnet"
/// - "gpt-4o-2024-11-20" -> "gpt-4o"
///
/// Runs inside the timed `cost` transform, so it is plain byte matching with
/// no lazily built state.
fn strip_date_suffix(model: &str) -> &str {
    let digits =
        |part: &str, len: usize| part.len() == len && part.bytes().all(|b| b.is_ascii_digit());

    if let Some((head, date)) = model.rsplit_once('-')
        && digits(date, 8)
    {
        return head;
    }

    let mut parts = model.rsplitn(4, '-');
    if let (Some(day), Some(month), Some(year), Some(head)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
        && digits(day, 2)
        && digits(month, 2)
        && digits(year, 4)
    {
        return head;
    }
    model
}
