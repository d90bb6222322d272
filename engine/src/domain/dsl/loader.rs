//! Bundle loading
//!
//! In `dev` mode rules are read from disk and recompiled whenever their
//! content changes; a cached artifact is reused only while it matches the
//! current source hash. In `prod` mode the precompiled artifact is loaded
//! as-is, falling back to the embedded rules when it is missing or corrupt.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::bundle::CompiledBundle;
use super::compile::compile_sources;
use super::error::{BundleCodecError, CompileError};
use super::sources::{RuleSources, newest_mtime};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Compile from rule files, reusing the artifact while it is fresh
    #[default]
    Dev,
    /// Load the precompiled artifact
    Prod,
}

impl LoadMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Some(Self::Dev),
            "prod" | "production" => Some(Self::Prod),
            _ => None,
        }
    }
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dev => write!(f, "dev"),
            Self::Prod => write!(f, "prod"),
        }
    }
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to read rules from {}: {source}", path.display())]
    Rules {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to access bundle artifact {}: {source}", path.display())]
    Artifact {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Codec(#[from] BundleCodecError),
}

// ============================================================================
// LOADER
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct BundleLoader {
    /// Rule directory; embedded rules when unset
    rules_dir: Option<PathBuf>,
    /// Compiled artifact location; nothing is cached when unset
    artifact_path: Option<PathBuf>,
}

impl BundleLoader {
    pub fn new(rules_dir: Option<PathBuf>, artifact_path: Option<PathBuf>) -> Self {
        Self {
            rules_dir,
            artifact_path,
        }
    }

    pub fn load(&self, mode: LoadMode) -> Result<Arc<CompiledBundle>, LoadError> {
        match mode {
            LoadMode::Dev => self.load_dev(),
            LoadMode::Prod => self.load_prod(),
        }
    }

    /// Rule sources from the configured directory, or the embedded set.
    pub fn sources(&self) -> Result<RuleSources, LoadError> {
        match &self.rules_dir {
            Some(dir) => RuleSources::from_dir(dir).map_err(|source| LoadError::Rules {
                path: dir.clone(),
                source,
            }),
            None => Ok(RuleSources::embedded()),
        }
    }

    /// Compile the sources and write the artifact, failing on any error.
    pub fn compile_to_artifact(&self) -> Result<CompiledBundle, LoadError> {
        let bundle = compile_sources(&self.sources()?)?;
        if let Some(path) = &self.artifact_path {
            let bytes = bundle.to_bytes()?;
            write_file(path, &bytes).map_err(|source| LoadError::Artifact {
                path: path.clone(),
                source,
            })?;
            tracing::info!(
                path = %path.display(),
                bytes = bytes.len(),
                source_hash = %bundle.source_hash,
                "Wrote rule bundle"
            );
        }
        Ok(bundle)
    }

    /// Whether the sources no longer match a bundle.
    pub fn is_stale(&self, bundle: &CompiledBundle) -> Result<bool, LoadError> {
        Ok(self.sources()?.content_hash() != bundle.source_hash)
    }

    fn load_dev(&self) -> Result<Arc<CompiledBundle>, LoadError> {
        let sources = self.sources()?;
        let hash = sources.content_hash();

        if let Some(bundle) = self.read_fresh_artifact(&hash) {
            tracing::debug!(source_hash = %hash, "Reusing cached rule bundle");
            return Ok(Arc::new(bundle));
        }

        let bundle = compile_sources(&sources)?;
        self.store_artifact(&bundle);
        tracing::info!(
            providers = bundle.providers.len(),
            source_hash = %bundle.source_hash,
            "Compiled rules"
        );
        Ok(Arc::new(bundle))
    }

    fn load_prod(&self) -> Result<Arc<CompiledBundle>, LoadError> {
        let Some(path) = &self.artifact_path else {
            tracing::warn!("No bundle artifact configured, using embedded rules");
            return load_embedded();
        };

        let loaded = fs::read(path)
            .map_err(|source| LoadError::Artifact {
                path: path.clone(),
                source,
            })
            .and_then(|bytes| CompiledBundle::from_bytes(&bytes).map_err(LoadError::from));

        match loaded {
            Ok(bundle) => {
                tracing::debug!(
                    path = %path.display(),
                    source_hash = %bundle.source_hash,
                    "Loaded rule bundle"
                );
                Ok(Arc::new(bundle))
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to load rule bundle, falling back to embedded rules"
                );
                load_embedded()
            }
        }
    }

    /// Cached artifact, if it is at least as new as the rule files and was
    /// built from identical sources.
    fn read_fresh_artifact(&self, hash: &str) -> Option<CompiledBundle> {
        let path = self.artifact_path.as_ref()?;
        let artifact_mtime = fs::metadata(path).and_then(|m| m.modified()).ok()?;

        if let Some(dir) = &self.rules_dir
            && let Ok(Some(newest)) = newest_mtime(dir)
            && newest > artifact_mtime
        {
            tracing::debug!(path = %path.display(), "Rule files changed since last compile");
            return None;
        }

        let bytes = fs::read(path).ok()?;
        match CompiledBundle::from_bytes(&bytes) {
            Ok(bundle) if bundle.source_hash == hash => Some(bundle),
            Ok(_) => {
                tracing::debug!(path = %path.display(), "Rule bundle is stale");
                None
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Ignoring unreadable rule bundle"
                );
                None
            }
        }
    }

    /// Best-effort artifact write; a read-only location only costs a
    /// recompile next time.
    fn store_artifact(&self, bundle: &CompiledBundle) {
        let Some(path) = &self.artifact_path else {
            return;
        };
        let result = bundle
            .to_bytes()
            .map_err(|e| e.to_string())
            .and_then(|bytes| write_file(path, &bytes).map_err(|e| e.to_string()));
        if let Err(error) = result {
            tracing::warn!(path = %path.display(), error = %error, "Failed to write rule bundle");
        }
    }
}

fn load_embedded() -> Result<Arc<CompiledBundle>, LoadError> {
    Ok(Arc::new(compile_sources(&RuleSources::embedded())?))
}

fn write_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)
}

// ============================================================================
// HANDLE
// ============================================================================

/// Swappable reference to the active bundle.
///
/// Readers take a cheap `Arc` snapshot per span, so a swap never affects a
/// span that is already being processed.
#[derive(Debug)]
pub struct BundleHandle {
    current: RwLock<Arc<CompiledBundle>>,
}

impl BundleHandle {
    pub fn new(bundle: Arc<CompiledBundle>) -> Self {
        Self {
            current: RwLock::new(bundle),
        }
    }

    pub fn current(&self) -> Arc<CompiledBundle> {
        self.current.read().clone()
    }

    /// Replace the active bundle, returning the previous one.
    pub fn swap(&self, bundle: Arc<CompiledBundle>) -> Arc<CompiledBundle> {
        std::mem::replace(&mut *self.current.write(), bundle)
    }

    /// Recompile and swap when the loader's sources have changed.
    pub fn refresh_if_stale(&self, loader: &BundleLoader) -> Result<bool, LoadError> {
        let sources = loader.sources()?;
        if sources.content_hash() == self.current().source_hash {
            return Ok(false);
        }
        let bundle = compile_sources(&sources)?;
        loader.store_artifact(&bundle);
        tracing::info!(source_hash = %bundle.source_hash, "Reloaded rules");
        self.swap(Arc::new(bundle));
        Ok(true)
    }
}
