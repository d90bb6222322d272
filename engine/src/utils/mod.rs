//! Utility functions shared across the engine

pub mod clock;
pub mod file;
pub mod json;
pub mod otlp;
pub mod string;
