//! Instrumentor and provider detection
//!
//! Two tiers:
//! 1. Instrumentor, from key prefixes declared in core.yaml.
//! 2. Provider, within the instrumentor's tier: exact signature, then the
//!    provider-name attribute values, then wildcard-normalized keys, then the
//!    most specific subset.
//!
//! A miss is a normal outcome: zero confidence and no provider.

pub mod signature;

use std::sync::Arc;

use serde::Serialize;

use crate::domain::Attributes;
use crate::domain::dsl::CompiledBundle;
use crate::domain::dsl::bundle::{SignatureEntry, TierIndex};

use self::signature::{literal_ids, wildcard_ids};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    /// Present keys equal a pattern's required set
    Exact,
    /// A provider-name attribute resolved through the alias index
    ValueBased,
    /// Exact match after rewriting numeric key segments to `*`
    Wildcard,
    /// A pattern's required set is contained in the present keys
    Subset,
    /// No attribute match; the provider came from a nested response object
    Discovery,
    #[default]
    Unmatched,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionResult {
    pub instrumentor: Option<String>,
    pub provider: Option<String>,
    pub confidence: f64,
    pub method: DetectionMethod,
    /// Matched structure pattern, when detection was signature based
    pub pattern_id: Option<String>,
}

impl DetectionResult {
    pub fn is_match(&self) -> bool {
        self.provider.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Detector {
    bundle: Arc<CompiledBundle>,
}

impl Detector {
    pub fn new(bundle: Arc<CompiledBundle>) -> Self {
        Self { bundle }
    }

    pub fn detect(&self, attrs: &Attributes) -> DetectionResult {
        let instrumentor = self.detect_instrumentor(attrs);
        let mut result = self
            .detect_provider(attrs, instrumentor.as_deref())
            .unwrap_or_default();
        result.instrumentor = instrumentor;

        tracing::trace!(
            instrumentor = result.instrumentor.as_deref().unwrap_or("none"),
            provider = result.provider.as_deref().unwrap_or("none"),
            confidence = result.confidence,
            method = ?result.method,
            "Detected span source"
        );
        result
    }

    /// Tier 1: lowest-index strong prefix match, else lowest-index weak match.
    pub fn detect_instrumentor(&self, attrs: &Attributes) -> Option<String> {
        let rules = &self.bundle.instrumentors;
        let mut best_strong = usize::MAX;
        let mut best_weak = usize::MAX;

        for key in attrs.keys() {
            for (i, rule) in rules.iter().enumerate().take(best_strong) {
                if rule.strong_prefixes.iter().any(|p| key.starts_with(p.as_str())) {
                    best_strong = i;
                    break;
                }
                if i < best_weak && rule.weak_prefixes.iter().any(|p| key.starts_with(p.as_str())) {
                    best_weak = i;
                }
            }
            if best_strong == 0 {
                break;
            }
        }

        let index = if best_strong != usize::MAX {
            best_strong
        } else {
            best_weak
        };
        rules.get(index).map(|rule| rule.name.clone())
    }

    fn detect_provider(&self, attrs: &Attributes, instrumentor: Option<&str>) -> Option<DetectionResult> {
        let thresholds = &self.bundle.thresholds;
        let tier = instrumentor.and_then(|name| self.bundle.tiers.get(name));
        let keys = || attrs.keys().map(String::as_str);

        if let Some(tier) = tier {
            let signature = tier.reduce(literal_ids(&self.bundle, keys()));
            if let Some(entry) = tier.exact_match(&signature)
                && entry.confidence >= thresholds.min_confidence
            {
                return Some(self.signature_result(entry, entry.confidence, DetectionMethod::Exact));
            }
        }

        if let Some(provider) = self.value_match(attrs)
            && thresholds.value_match_confidence >= thresholds.min_confidence
        {
            return Some(DetectionResult {
                provider: self.bundle.provider_name(provider).map(str::to_string),
                confidence: thresholds.value_match_confidence,
                method: DetectionMethod::ValueBased,
                ..Default::default()
            });
        }

        let tier = tier?;
        let wildcard = self.wildcard_signature(tier, attrs);
        if let Some(signature) = &wildcard
            && let Some(entry) = tier.exact_match(signature)
            && entry.confidence >= thresholds.min_confidence
        {
            return Some(self.signature_result(entry, entry.confidence, DetectionMethod::Wildcard));
        }

        let union = match wildcard {
            Some(signature) => signature,
            None => tier.reduce(literal_ids(&self.bundle, keys())),
        };
        tier.subset_match(
            &union,
            thresholds.subset_match_discount,
            thresholds.min_confidence,
        )
        .map(|(entry, confidence)| self.signature_result(entry, confidence, DetectionMethod::Subset))
    }

    /// Literal plus wildcard-normalized ids, when the tier uses wildcards.
    fn wildcard_signature(&self, tier: &TierIndex, attrs: &Attributes) -> Option<Vec<u32>> {
        if !tier.has_wildcards {
            return None;
        }
        let keys = || attrs.keys().map(String::as_str);
        let mut ids = literal_ids(&self.bundle, keys());
        ids.extend(wildcard_ids(&self.bundle, keys()));
        Some(tier.reduce(ids))
    }

    /// First provider-name attribute whose value is a known alias.
    fn value_match(&self, attrs: &Attributes) -> Option<usize> {
        self.bundle
            .provider_fields
            .iter()
            .filter_map(|field| attrs.get(field)?.as_str())
            .find_map(|value| self.bundle.resolve_alias(value))
    }

    fn signature_result(
        &self,
        entry: &SignatureEntry,
        confidence: f64,
        method: DetectionMethod,
    ) -> DetectionResult {
        DetectionResult {
            instrumentor: None,
            provider: self.bundle.provider_name(entry.provider).map(str::to_string),
            confidence,
            method,
            pattern_id: Some(entry.pattern_id.clone()),
        }
    }
}

#[cfg(test)]
#[path = "detect_tests.rs"]
mod tests;
