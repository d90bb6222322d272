//! Static rule validation
//!
//! Every problem is collected rather than stopping at the first one, so a
//! single run reports everything wrong with a rule set. Validation also
//! resolves `extends` inheritance; compilation only ever sees fully
//! resolved providers.

use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};

use super::error::DslError;
use super::sources::RuleSources;
use super::types::{
    CoreSchema, ExtractionMethod, FieldMappingDef, NavigationRuleDef, PerformanceClass,
    ProviderFile, RESPONSE_TIER, Section, StructurePatternDef, TransformDef,
};
use crate::domain::extract::path::{PathExpr, PathRoot, PathSpec};
use crate::domain::transforms::TransformKind;
use crate::domain::transforms::pricing::ModelPricing;
use crate::domain::{INSTRUMENTOR_FIELD, PROVIDER_FIELD};

/// Outcome of [`validate`]
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub ok: bool,
    pub errors: Vec<DslError>,
}

/// Check a rule set without compiling it.
pub fn validate(sources: &RuleSources) -> ValidationResult {
    match ValidatedRules::new(sources) {
        Ok(_) => ValidationResult {
            ok: true,
            errors: Vec::new(),
        },
        Err(errors) => ValidationResult { ok: false, errors },
    }
}

/// Provider with `extends` applied
#[derive(Debug, Clone)]
pub(super) struct ResolvedProvider {
    pub(super) name: String,
    pub(super) aliases: Vec<String>,
    pub(super) patterns: Vec<StructurePatternDef>,
    pub(super) rules: Vec<NavigationRuleDef>,
    pub(super) mappings: Vec<FieldMappingDef>,
    pub(super) transforms: Vec<TransformDef>,
    pub(super) pricing: BTreeMap<String, ModelPricing>,
}

/// A rule set that passed every static check
#[derive(Debug, Clone)]
pub struct ValidatedRules {
    pub(super) core: CoreSchema,
    pub(super) providers: Vec<ResolvedProvider>,
    pub(super) source_hash: String,
}

impl ValidatedRules {
    pub fn new(sources: &RuleSources) -> Result<Self, Vec<DslError>> {
        let mut errors = Vec::new();

        let core = match serde_yaml::from_str::<CoreSchema>(&sources.core.content) {
            Ok(core) => Some(core),
            Err(e) => {
                errors.push(DslError::Parse {
                    file: sources.core.name.clone(),
                    message: e.to_string(),
                });
                None
            }
        };

        let mut files = Vec::with_capacity(sources.providers.len());
        for source in &sources.providers {
            match serde_yaml::from_str::<ProviderFile>(&source.content) {
                Ok(file) => files.push((source.name.clone(), file)),
                Err(e) => errors.push(DslError::Parse {
                    file: source.name.clone(),
                    message: e.to_string(),
                }),
            }
        }

        let Some(core) = core else {
            return Err(errors);
        };

        let mut checker = Checker::new(&core, &sources.core.name);
        checker.check_core();
        for (name, file) in &files {
            checker.check_file(name, file);
        }
        let providers = checker.resolve(&files);
        checker.check_resolved(&files, &providers);
        errors.extend(checker.errors);

        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(Self {
            core,
            providers,
            source_hash: sources.content_hash(),
        })
    }

    pub fn source_hash(&self) -> &str {
        &self.source_hash
    }

    pub fn provider_names(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|p| p.name.as_str())
    }
}

/// Fields filled by the pipeline itself rather than by navigation rules
pub(super) fn is_builtin_source(source: &str) -> bool {
    source == PROVIDER_FIELD || source == INSTRUMENTOR_FIELD
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn is_attribute_key(key: &str) -> bool {
    !key.is_empty()
        && !key.contains(['*', '#'])
        && key.split('.').all(|segment| !segment.is_empty())
}

/// Overlay `child` onto `parent`: same key replaces in place, new keys append.
fn overlay<T: Clone>(parent: &[T], child: &[T], key: impl Fn(&T) -> String) -> Vec<T> {
    let mut merged = parent.to_vec();
    for item in child {
        let item_key = key(item);
        match merged.iter().position(|existing| key(existing) == item_key) {
            Some(i) => merged[i] = item.clone(),
            None => merged.push(item.clone()),
        }
    }
    merged
}

fn mapping_key(mapping: &FieldMappingDef) -> String {
    format!("{}.{}", mapping.section, mapping.field)
}

// ============================================================================
// CHECKER
// ============================================================================

struct Checker<'a> {
    core: &'a CoreSchema,
    core_file: &'a str,
    instrumentors: FxHashSet<&'a str>,
    /// Pattern id -> file
    pattern_ids: FxHashMap<String, String>,
    /// Tier -> sorted required fields -> pattern id
    signatures: FxHashMap<String, BTreeMap<Vec<String>, String>>,
    /// Lowercase model -> provider
    priced_models: FxHashMap<String, String>,
    errors: Vec<DslError>,
}

impl<'a> Checker<'a> {
    fn new(core: &'a CoreSchema, core_file: &'a str) -> Self {
        Self {
            core,
            core_file,
            instrumentors: core.instrumentors.iter().map(|i| i.name.as_str()).collect(),
            pattern_ids: FxHashMap::default(),
            signatures: FxHashMap::default(),
            priced_models: FxHashMap::default(),
            errors: Vec::new(),
        }
    }

    fn schema(&mut self, file: &str, message: String) {
        self.errors.push(DslError::Schema {
            file: file.to_string(),
            message,
        });
    }

    fn is_known_tier(&self, instrumentor: &str) -> bool {
        instrumentor == RESPONSE_TIER || self.instrumentors.contains(instrumentor)
    }

    // ------------------------------------------------------------------------
    // core.yaml
    // ------------------------------------------------------------------------

    fn check_core(&mut self) {
        let core = self.core;
        let file = self.core_file;

        let mut declared: Vec<&str> = core.sections.iter().map(String::as_str).collect();
        declared.sort_unstable();
        let mut canonical: Vec<&str> = Section::ALL.iter().map(Section::as_str).collect();
        canonical.sort_unstable();
        if declared != canonical {
            self.schema(
                file,
                "sections must be exactly inputs, outputs, config, metadata".to_string(),
            );
        }

        let t = &core.thresholds;
        for (name, value) in [
            ("min_confidence", t.min_confidence),
            ("value_match_confidence", t.value_match_confidence),
            ("subset_match_discount", t.subset_match_discount),
            ("discovery_min_confidence", t.discovery_min_confidence),
            ("heuristic_confidence", t.heuristic_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                self.schema(file, format!("thresholds.{name} must be within [0, 1]"));
            }
        }

        if core.transform_budget_us == Some(0) {
            self.schema(file, "transform_budget_us must be positive".to_string());
        }

        if core.instrumentors.is_empty() {
            self.schema(file, "at least one instrumentor is required".to_string());
        }
        let mut seen = FxHashSet::default();
        for rule in &core.instrumentors {
            if rule.name == RESPONSE_TIER || !is_identifier(&rule.name) {
                self.schema(
                    file,
                    format!("instrumentor name '{}' is reserved or invalid", rule.name),
                );
            }
            if !seen.insert(rule.name.as_str()) {
                self.errors.push(DslError::Duplicate {
                    file: file.to_string(),
                    kind: "instrumentor",
                    id: rule.name.clone(),
                });
            }
            if rule.strong_prefixes.is_empty() && rule.weak_prefixes.is_empty() {
                self.schema(file, format!("instrumentor '{}' has no prefixes", rule.name));
            }
            if rule
                .strong_prefixes
                .iter()
                .chain(&rule.weak_prefixes)
                .any(|p| p.is_empty())
            {
                self.schema(
                    file,
                    format!("instrumentor '{}' has an empty prefix", rule.name),
                );
            }
        }

        for key in core.provider_fields.iter().chain(&core.discovery_sources) {
            if !is_attribute_key(key) {
                self.schema(file, format!("'{key}' is not a plain attribute key"));
            }
        }

        let mut classified = FxHashSet::default();
        for classification in &core.field_classifications {
            if classification.field.is_empty() || classification.keys.is_empty() {
                self.schema(
                    file,
                    "field classifications need a field and at least one key".to_string(),
                );
            }
            for key in &classification.keys {
                if !classified.insert(key.to_lowercase()) {
                    self.errors.push(DslError::Duplicate {
                        file: file.to_string(),
                        kind: "classification key",
                        id: key.clone(),
                    });
                }
            }
        }

        let mut names = FxHashSet::default();
        for transform in &core.transforms {
            if !names.insert(transform.name.as_str()) {
                self.errors.push(DslError::Duplicate {
                    file: file.to_string(),
                    kind: "transform",
                    id: transform.name.clone(),
                });
            }
            self.check_transform(file, transform);
        }
    }

    fn check_transform(&mut self, file: &str, def: &TransformDef) {
        if PerformanceClass::parse(&def.performance_class).is_none() {
            self.errors.push(DslError::PerformanceClass {
                file: file.to_string(),
                transform: def.name.clone(),
                class: def.performance_class.clone(),
            });
        }
        if let Err(message) = TransformKind::resolve(&def.implementation, &def.params) {
            self.schema(file, format!("transform '{}': {message}", def.name));
        }
        if def.budget_us == Some(0) {
            self.schema(
                file,
                format!("transform '{}': budget_us must be positive", def.name),
            );
        }
    }

    // ------------------------------------------------------------------------
    // provider files, before inheritance
    // ------------------------------------------------------------------------

    fn check_file(&mut self, file: &str, provider: &ProviderFile) {
        if !is_identifier(&provider.provider) {
            self.schema(
                file,
                format!("provider name '{}' is invalid", provider.provider),
            );
        }

        for pattern in &provider.structure_patterns {
            self.check_pattern(file, pattern);
        }

        let mut rule_ids = FxHashSet::default();
        for rule in &provider.navigation_rules {
            if !rule_ids.insert(rule.id.as_str()) {
                self.errors.push(DslError::Duplicate {
                    file: file.to_string(),
                    kind: "navigation rule",
                    id: rule.id.clone(),
                });
            }
            self.check_rule(file, rule);
        }

        let mut targets = FxHashSet::default();
        for mapping in &provider.field_mappings {
            if !targets.insert(mapping_key(mapping)) {
                self.errors.push(DslError::Duplicate {
                    file: file.to_string(),
                    kind: "field mapping",
                    id: mapping_key(mapping),
                });
            }
            if Section::parse(&mapping.section).is_none() {
                self.schema(
                    file,
                    format!(
                        "mapping '{}' targets unknown section '{}'",
                        mapping.field, mapping.section
                    ),
                );
            }
            if !is_attribute_key(&mapping.field) {
                self.schema(
                    file,
                    format!("mapping field '{}' is not a valid dotted name", mapping.field),
                );
            }
        }

        let mut transform_names = FxHashSet::default();
        for transform in &provider.transforms {
            if !transform_names.insert(transform.name.as_str()) {
                self.errors.push(DslError::Duplicate {
                    file: file.to_string(),
                    kind: "transform",
                    id: transform.name.clone(),
                });
            }
            self.check_transform(file, transform);
            let conflicts_with_core = self
                .core
                .transforms
                .iter()
                .any(|core_def| core_def.name == transform.name && core_def != transform);
            if conflicts_with_core {
                self.schema(
                    file,
                    format!(
                        "transform '{}' conflicts with the {} definition",
                        transform.name, self.core_file
                    ),
                );
            }
        }

        for (model, pricing) in &provider.pricing {
            let key = model.to_lowercase();
            if let Some(owner) = self.priced_models.get(&key)
                && owner != &provider.provider
            {
                self.errors.push(DslError::Duplicate {
                    file: file.to_string(),
                    kind: "pricing model",
                    id: model.clone(),
                });
            }
            self.priced_models
                .insert(key, provider.provider.clone());
            let costs = [
                pricing.input_cost_per_token,
                pricing.output_cost_per_token,
                pricing.cache_read_input_token_cost,
                pricing.cache_creation_input_token_cost,
            ];
            if costs.iter().any(|c| !c.is_finite() || *c < 0.0) {
                self.schema(file, format!("pricing for '{model}' has a negative cost"));
            }
        }
    }

    fn check_pattern(&mut self, file: &str, pattern: &StructurePatternDef) {
        if let Some(first_file) = self.pattern_ids.get(&pattern.id) {
            let first_file = first_file.clone();
            self.errors.push(DslError::Duplicate {
                file: file.to_string(),
                kind: "pattern",
                id: format!("{} (first declared in {first_file})", pattern.id),
            });
        } else {
            self.pattern_ids
                .insert(pattern.id.clone(), file.to_string());
        }

        if !self.is_known_tier(&pattern.instrumentor) {
            self.errors.push(DslError::UnknownInstrumentor {
                file: file.to_string(),
                context: format!("pattern '{}'", pattern.id),
                instrumentor: pattern.instrumentor.clone(),
            });
        }
        if !(0.0..=1.0).contains(&pattern.confidence_weight) {
            self.schema(
                file,
                format!(
                    "pattern '{}': confidence_weight must be within [0, 1]",
                    pattern.id
                ),
            );
        }
        if pattern.required_fields.is_empty() {
            self.schema(
                file,
                format!("pattern '{}' has no required_fields", pattern.id),
            );
        }

        let is_response = pattern.instrumentor == RESPONSE_TIER;
        for field in pattern.required_fields.iter().chain(&pattern.optional_fields) {
            let valid = if is_response {
                !field.is_empty() && !field.contains(['.', '*', '#'])
            } else {
                PathExpr::parse(field, PathRoot::Attributes)
                    .is_ok_and(|p| !p.is_prefix() && !field.contains('#'))
            };
            if !valid {
                self.schema(
                    file,
                    format!("pattern '{}' has invalid field '{field}'", pattern.id),
                );
            }
        }
        if let Some(overlap) = pattern
            .optional_fields
            .iter()
            .find(|f| pattern.required_fields.contains(f))
        {
            self.schema(
                file,
                format!(
                    "pattern '{}' lists '{overlap}' as both required and optional",
                    pattern.id
                ),
            );
        }

        let mut signature = pattern.required_fields.clone();
        signature.sort();
        signature.dedup();
        let tier = self
            .signatures
            .entry(pattern.instrumentor.clone())
            .or_default();
        if let Some(first) = tier.get(&signature) {
            let error = DslError::DuplicateSignature {
                tier: pattern.instrumentor.clone(),
                first: first.clone(),
                second: pattern.id.clone(),
            };
            self.errors.push(error);
        } else {
            tier.insert(signature, pattern.id.clone());
        }
    }

    fn check_rule(&mut self, file: &str, rule: &NavigationRuleDef) {
        if !self.is_known_tier(&rule.instrumentor) {
            self.errors.push(DslError::UnknownInstrumentor {
                file: file.to_string(),
                context: format!("navigation rule '{}'", rule.id),
                instrumentor: rule.instrumentor.clone(),
            });
        }
        if rule.base_name().is_none() {
            self.schema(
                file,
                format!(
                    "navigation rule '{}' must be named '<field>_{}'",
                    rule.id, rule.instrumentor
                ),
            );
        }

        let root = if rule.instrumentor == RESPONSE_TIER {
            PathRoot::Value
        } else {
            PathRoot::Attributes
        };
        let method = rule.extraction_method;
        for raw in std::iter::once(&rule.source_path).chain(&rule.fallback_paths) {
            let reason = match PathSpec::parse(raw, root) {
                Err(e) => Some(e.to_string()),
                Ok(spec) if spec.is_compound() && !method.aggregates() => {
                    Some(format!("'+' terms are not supported by {method:?}"))
                }
                Ok(spec) if spec.has_prefix() && method != ExtractionMethod::ObjectMerge => {
                    Some("prefix paths require ObjectMerge".to_string())
                }
                Ok(spec) if spec.has_wildcard() && method == ExtractionMethod::DirectCopy => {
                    Some("wildcards are not supported by DirectCopy".to_string())
                }
                Ok(_) => None,
            };
            if let Some(reason) = reason {
                self.errors.push(DslError::InvalidPath {
                    file: file.to_string(),
                    rule: rule.id.clone(),
                    path: raw.clone(),
                    reason,
                });
            }
        }
    }

    // ------------------------------------------------------------------------
    // inheritance
    // ------------------------------------------------------------------------

    fn resolve(&mut self, files: &[(String, ProviderFile)]) -> Vec<ResolvedProvider> {
        let mut by_name: FxHashMap<&str, &ProviderFile> = FxHashMap::default();
        let mut unique = Vec::with_capacity(files.len());
        for (file, provider) in files {
            if by_name.insert(provider.provider.as_str(), provider).is_some() {
                self.errors.push(DslError::Duplicate {
                    file: file.clone(),
                    kind: "provider",
                    id: provider.provider.clone(),
                });
            } else {
                unique.push((file, provider));
            }
        }

        let mut resolved = Vec::with_capacity(unique.len());
        for (file, provider) in unique {
            let parent = match provider.extends.as_deref() {
                None => None,
                Some(parent) if parent == provider.provider => {
                    self.schema(file, format!("provider '{parent}' cannot extend itself"));
                    None
                }
                Some(parent) => match by_name.get(parent) {
                    None => {
                        self.errors.push(DslError::UnresolvedReference {
                            file: file.clone(),
                            context: "extends".to_string(),
                            kind: "provider",
                            name: parent.to_string(),
                        });
                        None
                    }
                    Some(p) if p.extends.is_some() => {
                        self.schema(
                            file,
                            format!(
                                "'{}' extends '{parent}', which itself extends another provider",
                                provider.provider
                            ),
                        );
                        None
                    }
                    Some(p) => Some(*p),
                },
            };

            let (rules, mappings, transforms) = match parent {
                Some(parent) => (
                    overlay(&parent.navigation_rules, &provider.navigation_rules, |r| {
                        r.id.clone()
                    }),
                    overlay(&parent.field_mappings, &provider.field_mappings, mapping_key),
                    overlay(&parent.transforms, &provider.transforms, |t| t.name.clone()),
                ),
                None => (
                    provider.navigation_rules.clone(),
                    provider.field_mappings.clone(),
                    provider.transforms.clone(),
                ),
            };

            resolved.push(ResolvedProvider {
                name: provider.provider.clone(),
                aliases: provider.aliases.clone(),
                patterns: provider.structure_patterns.clone(),
                rules,
                mappings,
                transforms,
                pricing: provider.pricing.clone(),
            });
        }
        resolved
    }

    // ------------------------------------------------------------------------
    // cross-references, after inheritance
    // ------------------------------------------------------------------------

    fn check_resolved(&mut self, files: &[(String, ProviderFile)], providers: &[ResolvedProvider]) {
        let file_of = |name: &str| {
            files
                .iter()
                .find(|(_, p)| p.provider == name)
                .map(|(file, _)| file.clone())
                .unwrap_or_default()
        };

        if let Some(fallback) = &self.core.fallback_provider
            && !providers.iter().any(|p| &p.name == fallback)
        {
            self.errors.push(DslError::UnresolvedReference {
                file: self.core_file.to_string(),
                context: "fallback_provider".to_string(),
                kind: "provider",
                name: fallback.clone(),
            });
        }

        let mut aliases: FxHashMap<String, &str> = FxHashMap::default();
        for provider in providers {
            let file = file_of(&provider.name);
            let mut own = FxHashSet::default();
            for alias in std::iter::once(&provider.name).chain(&provider.aliases) {
                let key = alias.trim().to_lowercase();
                if !own.insert(key.clone()) {
                    continue;
                }
                match aliases.get(&key) {
                    Some(owner) if *owner != provider.name => {
                        self.errors.push(DslError::Duplicate {
                            file: file.clone(),
                            kind: "alias",
                            id: alias.clone(),
                        });
                    }
                    _ => {
                        aliases.insert(key, provider.name.as_str());
                    }
                }
            }

            self.check_mappings(&file, provider);
        }
    }

    fn check_mappings(&mut self, file: &str, provider: &ResolvedProvider) {
        let has_base = |base: &str| {
            is_builtin_source(base)
                || provider
                    .rules
                    .iter()
                    .any(|rule| rule.base_name() == Some(base))
        };

        let mut tiers: Vec<&str> = provider
            .patterns
            .iter()
            .map(|p| p.instrumentor.as_str())
            .filter(|tier| *tier != RESPONSE_TIER)
            .collect();
        tiers.sort_unstable();
        tiers.dedup();

        for mapping in &provider.mappings {
            let context = format!("mapping {}", mapping_key(mapping));

            for source in std::iter::once(&mapping.source).chain(&mapping.inputs) {
                if !has_base(source) {
                    self.errors.push(DslError::UnresolvedReference {
                        file: file.to_string(),
                        context: context.clone(),
                        kind: "source field",
                        name: source.clone(),
                    });
                }
            }

            if let Some(transform) = &mapping.transform {
                let known = provider.transforms.iter().any(|t| &t.name == transform)
                    || self.core.transforms.iter().any(|t| &t.name == transform);
                if !known {
                    self.errors.push(DslError::UnresolvedReference {
                        file: file.to_string(),
                        context: context.clone(),
                        kind: "transform",
                        name: transform.clone(),
                    });
                }
            }

            if mapping.required && !is_builtin_source(&mapping.source) {
                for tier in &tiers {
                    let rule_id = format!("{}_{tier}", mapping.source);
                    if !provider.rules.iter().any(|r| r.id == rule_id) {
                        self.errors.push(DslError::UnresolvedReference {
                            file: file.to_string(),
                            context: format!("required {context}"),
                            kind: "navigation rule",
                            name: rule_id,
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "validate_tests.rs"]
mod tests;
