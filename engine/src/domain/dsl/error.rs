//! Rule validation and compilation errors

use thiserror::Error;

/// A single static problem found in the rule sources.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DslError {
    #[error("{file}: YAML parse error: {message}")]
    Parse { file: String, message: String },

    #[error("{file}: {message}")]
    Schema { file: String, message: String },

    #[error("{file}: duplicate {kind} '{id}'")]
    Duplicate {
        file: String,
        kind: &'static str,
        id: String,
    },

    #[error(
        "patterns '{first}' and '{second}' share the same required_fields signature in the '{tier}' tier"
    )]
    DuplicateSignature {
        tier: String,
        first: String,
        second: String,
    },

    #[error("{file}: unknown instrumentor '{instrumentor}' in {context}")]
    UnknownInstrumentor {
        file: String,
        context: String,
        instrumentor: String,
    },

    #[error("{file}: {context} references unknown {kind} '{name}'")]
    UnresolvedReference {
        file: String,
        context: String,
        kind: &'static str,
        name: String,
    },

    #[error("{file}: transform '{transform}' declares performance class '{class}' (only O1 and OLogN are allowed)")]
    PerformanceClass {
        file: String,
        transform: String,
        class: String,
    },

    #[error("{file}: rule '{rule}' has invalid path '{path}': {reason}")]
    InvalidPath {
        file: String,
        rule: String,
        path: String,
        reason: String,
    },
}

/// Failure to produce a compiled bundle.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("rule validation failed with {} error(s)", .0.len())]
    Invalid(Vec<DslError>),

    #[error("unresolved reference during compilation: {0}")]
    Reference(String),
}

impl CompileError {
    /// Individual problems, for reporting.
    pub fn errors(&self) -> Vec<String> {
        match self {
            Self::Invalid(errors) => errors.iter().map(ToString::to_string).collect(),
            Self::Reference(message) => vec![message.clone()],
        }
    }
}

/// Failure to encode or decode a bundle artifact.
#[derive(Error, Debug)]
pub enum BundleCodecError {
    #[error("failed to encode bundle: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode bundle: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("bundle format version {found} does not match expected {expected}")]
    Version { found: u32, expected: u32 },
}
