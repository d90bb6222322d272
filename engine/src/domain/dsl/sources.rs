//! Rule source files
//!
//! Rules live in a directory with one `core.yaml` and any number of
//! `providers/*.yaml`. The default set is embedded in the binary so the
//! engine always has something to fall back to.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const CORE_FILE_NAME: &str = "core.yaml";
pub const PROVIDERS_DIR: &str = "providers";

const EMBEDDED_CORE: &str = include_str!("../../../rules/core.yaml");
const EMBEDDED_PROVIDERS: &[(&str, &str)] = &[
    (
        "providers/anthropic.yaml",
        include_str!("../../../rules/providers/anthropic.yaml"),
    ),
    (
        "providers/gemini.yaml",
        include_str!("../../../rules/providers/gemini.yaml"),
    ),
    (
        "providers/generic.yaml",
        include_str!("../../../rules/providers/generic.yaml"),
    ),
    (
        "providers/openai.yaml",
        include_str!("../../../rules/providers/openai.yaml"),
    ),
];

/// One rule file, named relative to the rules directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub name: String,
    pub content: String,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// The full set of rule files for one compilation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSources {
    pub core: SourceFile,
    /// Sorted by name
    pub providers: Vec<SourceFile>,
}

impl RuleSources {
    pub fn new(core: SourceFile, mut providers: Vec<SourceFile>) -> Self {
        providers.sort_by(|a, b| a.name.cmp(&b.name));
        Self { core, providers }
    }

    /// Rules compiled into the binary.
    pub fn embedded() -> Self {
        Self::new(
            SourceFile::new(CORE_FILE_NAME, EMBEDDED_CORE),
            EMBEDDED_PROVIDERS
                .iter()
                .map(|(name, content)| SourceFile::new(*name, *content))
                .collect(),
        )
    }

    /// Read `core.yaml` and `providers/*.yaml` from a rules directory.
    pub fn from_dir(dir: &Path) -> io::Result<Self> {
        let core = fs::read_to_string(dir.join(CORE_FILE_NAME))?;
        let providers = provider_files(dir)?
            .into_iter()
            .map(|path| {
                let content = fs::read_to_string(&path)?;
                Ok(SourceFile::new(relative_name(&path), content))
            })
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self::new(SourceFile::new(CORE_FILE_NAME, core), providers))
    }

    /// Content hash over every file name and body, hex encoded.
    pub fn content_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for file in std::iter::once(&self.core).chain(&self.providers) {
            hasher.update(file.name.as_bytes());
            hasher.update(&[0]);
            hasher.update(file.content.as_bytes());
            hasher.update(&[0]);
        }
        hex::encode(hasher.finalize().as_bytes())
    }
}

fn provider_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let providers_dir = dir.join(PROVIDERS_DIR);
    if !providers_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = fs::read_dir(&providers_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext == "yaml" || ext == "yml")
        })
        .collect();
    files.sort();
    Ok(files)
}

fn relative_name(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{PROVIDERS_DIR}/{file_name}")
}

/// Most recent modification time across every rule file in a directory.
pub fn newest_mtime(dir: &Path) -> io::Result<Option<SystemTime>> {
    let mut newest: Option<SystemTime> = None;
    let mut paths = provider_files(dir)?;
    paths.push(dir.join(CORE_FILE_NAME));
    for path in paths {
        let modified = fs::metadata(&path)?.modified()?;
        newest = Some(newest.map_or(modified, |current| current.max(modified)));
    }
    Ok(newest)
}
