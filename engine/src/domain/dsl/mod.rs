//! Rule DSL: schema, validation, compilation and loading

pub mod bundle;
pub mod compile;
pub mod error;
pub mod loader;
pub mod sources;
pub mod types;
pub mod validate;

pub use bundle::{BundleSummary, CompiledBundle};
pub use compile::{compile, compile_sources};
pub use error::{CompileError, DslError};
pub use loader::{BundleHandle, BundleLoader, LoadError, LoadMode};
pub use sources::{RuleSources, SourceFile};
pub use validate::{ValidatedRules, ValidationResult, validate};
