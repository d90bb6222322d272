//! Span normalization pipeline
//!
//! Detect -> extract -> discover -> map, against one bundle snapshot. The
//! pipeline never fails: every error and panic is caught here, logged, and
//! turned into an empty or partial event with diagnostics.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use opentelemetry_proto::tonic::common::v1::KeyValue;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::domain::detect::{DetectionMethod, DetectionResult, Detector};
use crate::domain::diagnostics::{Diagnostics, SpanDiagnostics};
use crate::domain::discovery::StructureDiscovery;
use crate::domain::dsl::{BundleHandle, BundleLoader, CompiledBundle, LoadError, LoadMode};
use crate::domain::extract::{ExtractedFields, Extractor};
use crate::domain::mapping::{CanonicalEvent, Mapper};
use crate::domain::transforms::TransformEngine;
use crate::domain::{Attributes, PROVIDER_FIELD};
use crate::utils::clock::{Clock, SystemClock};
use crate::utils::otlp::key_values_to_attributes;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to load rules: {0}")]
    Load(#[from] LoadError),

    #[error("normalization panicked: {0}")]
    Panic(String),
}

/// Event plus everything known about how it was produced
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessingResult {
    pub event: CanonicalEvent,
    pub detection: DetectionResult,
    pub diagnostics: SpanDiagnostics,
}

/// Entry point for normalizing spans. Cheap to clone; clones share the
/// bundle handle and counters.
#[derive(Debug, Clone)]
pub struct Normalizer {
    handle: Arc<BundleHandle>,
    clock: Arc<dyn Clock>,
    diagnostics: Diagnostics,
    transform_budget_us: Option<u64>,
}

impl Normalizer {
    pub fn new(bundle: Arc<CompiledBundle>) -> Self {
        Self::with_handle(Arc::new(BundleHandle::new(bundle)))
    }

    /// Share a handle that may be swapped by a reloader.
    pub fn with_handle(handle: Arc<BundleHandle>) -> Self {
        Self {
            handle,
            clock: Arc::new(SystemClock::new()),
            diagnostics: Diagnostics::new(),
            transform_budget_us: None,
        }
    }

    pub fn from_loader(loader: &BundleLoader, mode: LoadMode) -> Result<Self, PipelineError> {
        Ok(Self::new(loader.load(mode)?))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the bundle's default transform budget.
    pub fn with_transform_budget(mut self, budget_us: u64) -> Self {
        self.transform_budget_us = Some(budget_us);
        self
    }

    pub fn handle(&self) -> &Arc<BundleHandle> {
        &self.handle
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn normalize(&self, attrs: &Attributes) -> CanonicalEvent {
        self.process(attrs).event
    }

    pub fn process_otlp(&self, attrs: &[KeyValue]) -> ProcessingResult {
        self.process(&key_values_to_attributes(attrs))
    }

    pub fn process(&self, attrs: &Attributes) -> ProcessingResult {
        let bundle = self.handle.current();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run(&bundle, attrs)));

        let result = match outcome {
            Ok(result) => result,
            Err(payload) => {
                let err = PipelineError::Panic(panic_message(payload.as_ref()));
                tracing::error!(error = %err, attributes = attrs.len(), "Span normalization failed");
                ProcessingResult {
                    diagnostics: SpanDiagnostics {
                        error: Some(err.to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                }
            }
        };

        self.diagnostics.record(&result.diagnostics);
        if !result.diagnostics.timed_out.is_empty() {
            tracing::warn!(
                fields = ?result.diagnostics.timed_out,
                "Transforms exceeded their budget"
            );
        }
        result
    }

    fn run(&self, bundle: &Arc<CompiledBundle>, attrs: &Attributes) -> ProcessingResult {
        let mut detection = Detector::new(bundle.clone()).detect(attrs);
        let mut extracted = Extractor::new(bundle.clone()).extract(attrs, &detection);
        let discovered = merge_discovered(bundle, attrs, &mut detection, &mut extracted);

        let mut engine = TransformEngine::new(bundle.clone(), self.clock.clone());
        if let Some(budget_us) = self.transform_budget_us {
            engine = engine.with_default_budget(budget_us);
        }
        let mapped = Mapper::new(bundle.clone(), engine).map(&extracted);

        let diagnostics = SpanDiagnostics {
            detection_method: detection.method,
            confidence: detection.confidence,
            rule_set: extracted.rule_set,
            rejected_fields: extracted.rejected,
            discovered_fields: discovered,
            missing_required: mapped.missing_required,
            timed_out: mapped.timed_out,
            failed_transforms: mapped.failed_transforms,
            error: None,
        };

        tracing::debug!(
            provider = detection.provider.as_deref().unwrap_or("none"),
            fields = mapped.event.field_count(),
            degraded = diagnostics.is_degraded(),
            "Normalized span"
        );

        ProcessingResult {
            event: mapped.event,
            detection,
            diagnostics,
        }
    }
}

/// Run discovery on the configured source attributes and merge fields that
/// extraction did not produce. Returns the merged field names.
///
/// When detection found no provider and discovery did, `detection` is
/// updated to report the discovered provider, shape and confidence.
fn merge_discovered(
    bundle: &Arc<CompiledBundle>,
    attrs: &Attributes,
    detection: &mut DetectionResult,
    extracted: &mut ExtractedFields,
) -> Vec<String> {
    let min_confidence = bundle.thresholds.discovery_min_confidence;
    let discovery = StructureDiscovery::new(bundle.clone());
    let mut merged = Vec::new();

    for source in &bundle.discovery_sources {
        let Some(value) = attrs.get(source) else {
            continue;
        };
        let found = discovery.discover(value);
        if found.fields.is_empty() || found.confidence < min_confidence {
            continue;
        }

        if detection.provider.is_none()
            && let Some(provider) = &found.provider
            && extracted.insert_if_absent(PROVIDER_FIELD, JsonValue::String(provider.clone()))
        {
            extracted.rule_set = Some(provider.clone());
            detection.provider = Some(provider.clone());
            detection.confidence = found.confidence;
            detection.method = DetectionMethod::Discovery;
            detection.pattern_id = found.shape.clone();
        }
        if extracted.rule_set.is_none() {
            extracted.rule_set = bundle
                .rule_set_for(None)
                .and_then(|i| bundle.provider_name(i))
                .map(str::to_string);
        }

        for (field, discovered) in found.fields {
            if discovered.confidence >= min_confidence
                && extracted.insert_if_absent(&field, discovered.value)
            {
                merged.push(field);
            }
        }
    }
    merged
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
