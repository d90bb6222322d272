pub mod app;
pub mod core;
pub mod domain;
pub mod utils;

pub use domain::dsl::{BundleLoader, CompiledBundle, LoadMode};
pub use domain::{Attributes, CanonicalEvent, Normalizer, ProcessingResult};
