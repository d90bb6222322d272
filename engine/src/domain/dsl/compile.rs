//! Rule compilation
//!
//! Turns validated rules into a [`CompiledBundle`]: pattern fields are
//! interned to integer ids, signatures are indexed per instrumentor tier,
//! paths are pre-parsed and transforms are resolved to their implementation.

use rustc_hash::FxHashMap;

use super::bundle::{
    BUNDLE_FORMAT_VERSION, CompiledBundle, CompiledMapping, CompiledRule, ProviderRules,
    SignatureEntry, TierIndex,
};
use super::error::CompileError;
use super::sources::RuleSources;
use super::types::{PerformanceClass, RESPONSE_TIER, Section, TransformDef};
use super::validate::{ResolvedProvider, ValidatedRules};
use crate::domain::extract::path::{PathRoot, PathSpec};
use crate::domain::transforms::pricing::PricingTable;
use crate::domain::transforms::{CompiledTransform, TransformKind};

/// Default transform budget when core.yaml does not set one
pub const DEFAULT_TRANSFORM_BUDGET_US: u64 = 250;

/// Validate and compile in one step.
pub fn compile_sources(sources: &RuleSources) -> Result<CompiledBundle, CompileError> {
    let rules = ValidatedRules::new(sources).map_err(CompileError::Invalid)?;
    compile(&rules)
}

/// Compile a validated rule set into a bundle.
pub fn compile(rules: &ValidatedRules) -> Result<CompiledBundle, CompileError> {
    let core = &rules.core;
    let mut fields = FieldInterner::default();

    let mut transforms = Vec::new();
    let mut transform_index = FxHashMap::default();
    for def in &core.transforms {
        transform_index.insert(def.name.clone(), transforms.len());
        transforms.push(compile_transform(def)?);
    }

    let mut tiers: FxHashMap<String, TierIndex> = FxHashMap::default();
    let mut providers = Vec::with_capacity(rules.providers.len());
    let mut provider_index = FxHashMap::default();
    let mut aliases = FxHashMap::default();
    let mut pricing = PricingTable::default();
    let mut order = 0usize;

    for (index, provider) in rules.providers.iter().enumerate() {
        provider_index.insert(provider.name.clone(), index);
        for alias in std::iter::once(&provider.name).chain(&provider.aliases) {
            aliases.insert(alias.trim().to_lowercase(), index);
        }

        for pattern in &provider.patterns {
            let signature = fields.intern_all(&pattern.required_fields);
            let mut known_fields = signature.clone();
            known_fields.extend(fields.intern_all(&pattern.optional_fields));
            known_fields.sort_unstable();
            known_fields.dedup();

            let tier = tiers.entry(pattern.instrumentor.clone()).or_default();
            tier.universe.extend(signature.iter().copied());
            if pattern.required_fields.iter().any(|f| f.contains('*')) {
                tier.has_wildcards = true;
            }

            let entry = SignatureEntry {
                signature: signature.clone(),
                known_fields,
                provider: index,
                pattern_id: pattern.id.clone(),
                confidence: pattern.confidence_weight,
                order,
            };
            order += 1;

            if let Some(existing) = tier.signature_to_provider.insert(signature, entry.clone()) {
                return Err(CompileError::Reference(format!(
                    "patterns '{}' and '{}' share a signature",
                    existing.pattern_id, entry.pattern_id
                )));
            }
            tier.size_bucketed_subsets
                .entry(entry.signature.len())
                .or_default()
                .push(entry);
        }

        let local_transforms =
            register_local_transforms(provider, &mut transforms, &mut transform_index)?;
        providers.push(compile_provider(provider, &local_transforms, &transform_index)?);

        for (model, price) in &provider.pricing {
            pricing.insert(&provider.name, model, price.clone());
        }
    }

    for tier in tiers.values_mut() {
        for bucket in tier.size_bucketed_subsets.values_mut() {
            bucket.sort_by(|a, b| {
                b.confidence
                    .total_cmp(&a.confidence)
                    .then(a.order.cmp(&b.order))
            });
        }
    }

    let classifications = core.field_classifications.clone();
    let mut classification_keys = FxHashMap::default();
    for (i, classification) in classifications.iter().enumerate() {
        for key in &classification.keys {
            classification_keys.insert(key.to_lowercase(), i);
        }
    }

    let fallback_provider = match &core.fallback_provider {
        Some(name) => Some(provider_index.get(name).copied().ok_or_else(|| {
            CompileError::Reference(format!("fallback provider '{name}' is not defined"))
        })?),
        None => None,
    };

    tracing::debug!(
        providers = providers.len(),
        patterns = order,
        transforms = transforms.len(),
        fields = fields.ids.len(),
        "Compiled rule bundle"
    );

    Ok(CompiledBundle {
        format_version: BUNDLE_FORMAT_VERSION,
        rules_version: core.version,
        source_hash: rules.source_hash.clone(),
        thresholds: core.thresholds,
        transform_budget_us: core
            .transform_budget_us
            .unwrap_or(DEFAULT_TRANSFORM_BUDGET_US),
        instrumentors: core.instrumentors.clone(),
        field_ids: fields.ids,
        tiers,
        providers,
        provider_index,
        aliases,
        fallback_provider,
        provider_fields: core.provider_fields.clone(),
        discovery_sources: core.discovery_sources.clone(),
        classifications,
        classification_keys,
        transform_index,
        transforms,
        pricing,
    })
}

#[derive(Default)]
struct FieldInterner {
    ids: FxHashMap<String, u32>,
}

impl FieldInterner {
    fn intern(&mut self, field: &str) -> u32 {
        let next = self.ids.len() as u32;
        *self.ids.entry(field.to_string()).or_insert(next)
    }

    /// Sorted, deduplicated ids.
    fn intern_all(&mut self, fields: &[String]) -> Vec<u32> {
        let mut ids: Vec<u32> = fields.iter().map(|f| self.intern(f)).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

fn compile_transform(def: &TransformDef) -> Result<CompiledTransform, CompileError> {
    let kind = TransformKind::resolve(&def.implementation, &def.params)
        .map_err(|e| CompileError::Reference(format!("transform '{}': {e}", def.name)))?;
    let performance_class = PerformanceClass::parse(&def.performance_class).ok_or_else(|| {
        CompileError::Reference(format!(
            "transform '{}': invalid performance class '{}'",
            def.name, def.performance_class
        ))
    })?;
    Ok(CompiledTransform {
        name: def.name.clone(),
        kind,
        performance_class,
        budget_us: def.budget_us,
    })
}

/// Register provider-declared transforms. Definitions identical to a core
/// transform reuse it; others are stored under `provider/name`.
fn register_local_transforms(
    provider: &ResolvedProvider,
    transforms: &mut Vec<CompiledTransform>,
    transform_index: &mut FxHashMap<String, usize>,
) -> Result<FxHashMap<String, usize>, CompileError> {
    let mut local = FxHashMap::default();
    for def in &provider.transforms {
        let compiled = compile_transform(def)?;
        let index = match transform_index.get(&def.name) {
            Some(&core) if transforms.get(core) == Some(&compiled) => core,
            _ => {
                transforms.push(compiled);
                let index = transforms.len() - 1;
                transform_index.insert(format!("{}/{}", provider.name, def.name), index);
                index
            }
        };
        local.insert(def.name.clone(), index);
    }
    Ok(local)
}

fn compile_provider(
    provider: &ResolvedProvider,
    local_transforms: &FxHashMap<String, usize>,
    transform_index: &FxHashMap<String, usize>,
) -> Result<ProviderRules, CompileError> {
    let mut rules = Vec::with_capacity(provider.rules.len());
    let mut by_instrumentor: FxHashMap<String, Vec<usize>> = FxHashMap::default();

    for def in &provider.rules {
        let base = def.base_name().ok_or_else(|| {
            CompileError::Reference(format!("rule '{}' has no field name", def.id))
        })?;
        let root = if def.instrumentor == RESPONSE_TIER {
            PathRoot::Value
        } else {
            PathRoot::Attributes
        };
        let sources = std::iter::once(&def.source_path)
            .chain(&def.fallback_paths)
            .map(|raw| {
                PathSpec::parse(raw, root).map_err(|e| {
                    CompileError::Reference(format!("rule '{}' path '{raw}': {e}", def.id))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let index = rules.len();
        by_instrumentor
            .entry(def.instrumentor.clone())
            .or_default()
            .push(index);
        rules.push(CompiledRule {
            id: def.id.clone(),
            base: base.to_string(),
            instrumentor: def.instrumentor.clone(),
            method: def.extraction_method,
            sources,
            separator: def.separator.clone().unwrap_or_default(),
            fallback_value: def.fallback_value.clone(),
            validation: def.validation.clone(),
        });
    }

    let mappings = provider
        .mappings
        .iter()
        .map(|def| {
            let section = Section::parse(&def.section).ok_or_else(|| {
                CompileError::Reference(format!("unknown section '{}'", def.section))
            })?;
            let transform = def
                .transform
                .as_ref()
                .map(|name| {
                    local_transforms
                        .get(name)
                        .or_else(|| transform_index.get(name))
                        .copied()
                        .ok_or_else(|| {
                            CompileError::Reference(format!(
                                "{}: transform '{name}' is not defined",
                                provider.name
                            ))
                        })
                })
                .transpose()?;
            Ok(CompiledMapping {
                section,
                field: def.field.clone(),
                source: def.source.clone(),
                required: def.required,
                transform,
                inputs: def.inputs.clone(),
            })
        })
        .collect::<Result<Vec<_>, CompileError>>()?;

    Ok(ProviderRules {
        name: provider.name.clone(),
        rules,
        by_instrumentor,
        mappings,
    })
}
