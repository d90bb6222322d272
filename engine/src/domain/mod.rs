//! Normalization domain: rule DSL, detection, extraction, discovery,
//! mapping and transforms, wired together by the pipeline.

pub mod detect;
pub mod diagnostics;
pub mod discovery;
pub mod dsl;
pub mod extract;
pub mod mapping;
pub mod pipeline;
pub mod transforms;

use std::collections::HashMap;

use serde_json::Value as JsonValue;

/// Flat span attribute map
pub type Attributes = HashMap<String, JsonValue>;

/// Semantic field carrying the detected provider name
pub const PROVIDER_FIELD: &str = "provider";
/// Semantic field carrying the detected instrumentor name
pub const INSTRUMENTOR_FIELD: &str = "instrumentor";

pub use diagnostics::{Diagnostics, DiagnosticsSnapshot, SpanDiagnostics};
pub use mapping::CanonicalEvent;
pub use pipeline::{Normalizer, PipelineError, ProcessingResult};
