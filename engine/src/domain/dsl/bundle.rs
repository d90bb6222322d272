//! Compiled rule bundle
//!
//! The bundle is the only thing the runtime reads. It is built once by
//! [`super::compile`], persisted as MessagePack, and shared read-only behind
//! an `Arc` by every detector, extractor and mapper.

use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::error::BundleCodecError;
use super::types::{
    ExtractionMethod, FieldClassification, InstrumentorRule, RESPONSE_TIER, Section, Thresholds,
    Validation,
};
use crate::domain::extract::path::PathSpec;
use crate::domain::transforms::CompiledTransform;
use crate::domain::transforms::pricing::PricingTable;

/// Bumped whenever the serialized layout changes; older artifacts are
/// treated as stale.
pub const BUNDLE_FORMAT_VERSION: u32 = 3;

// ============================================================================
// DETECTION INDEX
// ============================================================================

/// One structure pattern as stored in a tier index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureEntry {
    /// Sorted, deduplicated field ids of the required fields
    pub signature: Vec<u32>,
    /// Sorted field ids of required plus optional fields
    pub known_fields: Vec<u32>,
    /// Index into [`CompiledBundle::providers`]
    pub provider: usize,
    pub pattern_id: String,
    pub confidence: f64,
    /// Global declaration order, used as the final tie-break
    pub order: usize,
}

/// Detection index for one instrumentor tier
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierIndex {
    /// Every field id that appears in a required set of this tier
    pub universe: FxHashSet<u32>,
    /// Exact required-set signature -> pattern
    pub signature_to_provider: FxHashMap<Vec<u32>, SignatureEntry>,
    /// Signature length -> patterns, each bucket ordered by descending
    /// confidence then declaration order
    pub size_bucketed_subsets: BTreeMap<usize, Vec<SignatureEntry>>,
    /// Whether any required field uses an index wildcard
    pub has_wildcards: bool,
}

impl TierIndex {
    pub fn pattern_count(&self) -> usize {
        self.signature_to_provider.len()
    }
}

// ============================================================================
// EXTRACTION RULES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledRule {
    pub id: String,
    /// Semantic field this rule produces
    pub base: String,
    pub instrumentor: String,
    pub method: ExtractionMethod,
    /// Primary source followed by fallbacks, tried in order
    pub sources: Vec<PathSpec>,
    pub separator: String,
    pub fallback_value: Option<JsonValue>,
    pub validation: Validation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledMapping {
    pub section: Section,
    pub field: String,
    pub source: String,
    pub required: bool,
    /// Index into [`CompiledBundle::transforms`]
    pub transform: Option<usize>,
    pub inputs: Vec<String>,
}

/// Effective rule set of one provider, with inheritance already applied
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRules {
    pub name: String,
    pub rules: Vec<CompiledRule>,
    /// Instrumentor -> indices into `rules`
    pub by_instrumentor: FxHashMap<String, Vec<usize>>,
    pub mappings: Vec<CompiledMapping>,
}

impl ProviderRules {
    /// Rules for one instrumentor, in declaration order.
    pub fn rules_for<'a>(
        &'a self,
        instrumentor: &str,
    ) -> impl Iterator<Item = &'a CompiledRule> + use<'a> {
        self.by_instrumentor
            .get(instrumentor)
            .into_iter()
            .flatten()
            .filter_map(|&i| self.rules.get(i))
    }

    /// Rules that read raw provider response objects.
    pub fn response_rules(&self) -> impl Iterator<Item = &CompiledRule> + '_ {
        self.rules_for(RESPONSE_TIER)
    }
}

// ============================================================================
// BUNDLE
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledBundle {
    pub format_version: u32,
    /// `version` from core.yaml
    pub rules_version: u32,
    /// blake3 over every rule source, hex encoded
    pub source_hash: String,
    pub thresholds: Thresholds,
    pub transform_budget_us: u64,
    /// Instrumentor prefix rules in priority order
    pub instrumentors: Vec<InstrumentorRule>,
    /// Interned pattern field names
    pub field_ids: FxHashMap<String, u32>,
    /// Instrumentor (or `response`) -> detection index
    pub tiers: FxHashMap<String, TierIndex>,
    pub providers: Vec<ProviderRules>,
    pub provider_index: FxHashMap<String, usize>,
    /// Lowercase provider name or alias -> provider
    pub aliases: FxHashMap<String, usize>,
    pub fallback_provider: Option<usize>,
    /// Attributes whose values name a provider
    pub provider_fields: Vec<String>,
    /// Attributes that may carry a raw response body
    pub discovery_sources: Vec<String>,
    pub classifications: Vec<FieldClassification>,
    /// Lowercase key name -> index into `classifications`
    pub classification_keys: FxHashMap<String, usize>,
    /// Core transforms by name, provider-local ones as `provider/name`
    pub transform_index: FxHashMap<String, usize>,
    pub transforms: Vec<CompiledTransform>,
    pub pricing: PricingTable,
}

impl CompiledBundle {
    /// Serialize to MessagePack.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BundleCodecError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Deserialize from MessagePack, rejecting other format versions.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BundleCodecError> {
        let bundle: Self = rmp_serde::from_slice(bytes)?;
        if bundle.format_version != BUNDLE_FORMAT_VERSION {
            return Err(BundleCodecError::Version {
                found: bundle.format_version,
                expected: BUNDLE_FORMAT_VERSION,
            });
        }
        Ok(bundle)
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderRules> {
        self.provider_index
            .get(name)
            .and_then(|&i| self.providers.get(i))
    }

    pub fn provider_name(&self, index: usize) -> Option<&str> {
        self.providers.get(index).map(|p| p.name.as_str())
    }

    /// Resolve a provider name or alias (case-insensitive).
    pub fn resolve_alias(&self, value: &str) -> Option<usize> {
        self.aliases.get(&value.trim().to_lowercase()).copied()
    }

    /// Rule set used for a detected provider: its own, or the fallback
    /// provider's when the provider is unknown.
    pub fn rule_set_for(&self, provider: Option<&str>) -> Option<usize> {
        provider
            .and_then(|name| self.provider_index.get(name).copied())
            .or(self.fallback_provider)
    }

    pub fn field_id(&self, field: &str) -> Option<u32> {
        self.field_ids.get(field).copied()
    }

    pub fn transform_index(&self, name: &str) -> Option<usize> {
        self.transform_index.get(name).copied()
    }

    /// Classification for a key name (case-insensitive).
    pub fn classify_key(&self, key: &str) -> Option<&FieldClassification> {
        self.classification_keys
            .get(&key.to_lowercase())
            .and_then(|&i| self.classifications.get(i))
    }

    /// Classification that produces a semantic field.
    pub fn classification_for_field(&self, field: &str) -> Option<&FieldClassification> {
        self.classifications.iter().find(|c| c.field == field)
    }

    pub fn summary(&self) -> BundleSummary {
        let mut tiers: BTreeMap<String, usize> = self
            .tiers
            .iter()
            .map(|(name, tier)| (name.clone(), tier.pattern_count()))
            .collect();
        for rule in &self.instrumentors {
            tiers.entry(rule.name.clone()).or_insert(0);
        }

        BundleSummary {
            format_version: self.format_version,
            rules_version: self.rules_version,
            source_hash: self.source_hash.clone(),
            providers: self
                .providers
                .iter()
                .map(|p| ProviderSummary {
                    name: p.name.clone(),
                    rules: p.rules.len(),
                    mappings: p.mappings.len(),
                })
                .collect(),
            patterns_per_tier: tiers,
            transforms: self.transforms.iter().map(|t| t.name.clone()).collect(),
            priced_models: self.pricing.len(),
        }
    }
}

/// Human-readable overview of a bundle
#[derive(Debug, Clone, Serialize)]
pub struct BundleSummary {
    pub format_version: u32,
    pub rules_version: u32,
    pub source_hash: String,
    pub providers: Vec<ProviderSummary>,
    pub patterns_per_tier: BTreeMap<String, usize>,
    pub transforms: Vec<String>,
    pub priced_models: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderSummary {
    pub name: String,
    pub rules: usize,
    pub mappings: usize,
}
