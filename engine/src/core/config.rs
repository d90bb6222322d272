use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use super::cli::CliConfig;
use super::constants::{APP_DOT_FOLDER, CONFIG_FILE_NAME};
use crate::domain::dsl::LoadMode;
use crate::utils::file::expand_path;

// =============================================================================
// spanmold.json
// =============================================================================

/// `rules` section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct RulesFileConfig {
    /// Directory holding core.yaml and providers/
    pub dir: Option<String>,
    /// Compiled bundle location
    pub bundle_path: Option<String>,
    pub mode: Option<LoadMode>,
}

/// `transforms` section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct TransformsFileConfig {
    pub budget_us: Option<u64>,
}

/// One parsed `spanmold.json`. Unrecognized top-level keys land in `extra`.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub rules: Option<RulesFileConfig>,
    pub transforms: Option<TransformsFileConfig>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        let parsed: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid JSON in {}", path.display()))?;

        if !parsed.extra.is_empty() {
            let keys: Vec<&str> = parsed.extra.keys().map(String::as_str).collect();
            tracing::warn!(
                path = %path.display(),
                keys = %keys.join(", "),
                "Ignoring unrecognized config keys"
            );
        }
        Ok(parsed)
    }

    /// Apply every value set in `top` over this config.
    fn overlay(&mut self, top: FileConfig) {
        if let Some(top_rules) = top.rules {
            let rules = self.rules.get_or_insert_with(Default::default);
            rules.dir = top_rules.dir.or(rules.dir.take());
            rules.bundle_path = top_rules.bundle_path.or(rules.bundle_path.take());
            rules.mode = top_rules.mode.or(rules.mode);
        }
        if let Some(top_transforms) = top.transforms {
            let transforms = self.transforms.get_or_insert_with(Default::default);
            transforms.budget_us = top_transforms.budget_us.or(transforms.budget_us);
        }
    }
}

/// Config files to read, lowest precedence first: the profile file, then
/// either `--config` or `./spanmold.json`.
fn config_files(cli: &CliConfig) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = dirs::home_dir()
        .map(|home| home.join(APP_DOT_FOLDER).join(CONFIG_FILE_NAME))
        .filter(|path| path.exists())
        .into_iter()
        .collect();

    match &cli.config {
        Some(explicit) => {
            let path = expand_path(&explicit.to_string_lossy());
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            files.push(path);
        }
        None => {
            let local = PathBuf::from(CONFIG_FILE_NAME);
            if local.exists() {
                files.push(local);
            }
        }
    }
    Ok(files)
}

// =============================================================================
// Resolved Config
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppConfig {
    /// External rule directory; embedded rules when unset
    pub rules_dir: Option<PathBuf>,
    /// Compiled artifact location; no artifact caching when unset
    pub bundle_path: Option<PathBuf>,
    pub mode: LoadMode,
    /// Overrides the bundle's default transform budget
    pub transform_budget_us: Option<u64>,
}

impl AppConfig {
    /// Resolve settings from defaults, config files, then CLI flags and
    /// their `SPANMOLD_*` env fallbacks, each overriding the last.
    pub fn load(cli: &CliConfig) -> Result<Self> {
        let files = config_files(cli)?;
        let mut merged = FileConfig::default();
        for path in &files {
            tracing::debug!(path = %path.display(), "Reading config file");
            merged.overlay(FileConfig::read(path)?);
        }
        Ok(Self::layer(cli, merged))
    }

    /// Layer CLI/env values over file values over defaults.
    fn layer(cli: &CliConfig, file_config: FileConfig) -> Self {
        let file_rules = file_config.rules.unwrap_or_default();
        let file_transforms = file_config.transforms.unwrap_or_default();

        let rules_dir = cli
            .rules_dir
            .clone()
            .or_else(|| file_rules.dir.as_deref().map(expand_path));
        let bundle_path = cli
            .bundle_path
            .clone()
            .or_else(|| file_rules.bundle_path.as_deref().map(expand_path));
        let mode = cli.mode.or(file_rules.mode).unwrap_or_default();
        let transform_budget_us = cli.transform_budget_us.or(file_transforms.budget_us);

        let config = Self {
            rules_dir,
            bundle_path,
            mode,
            transform_budget_us,
        };
        tracing::debug!(
            rules_dir = ?config.rules_dir,
            bundle_path = ?config.bundle_path,
            mode = %config.mode,
            transform_budget_us = ?config.transform_budget_us,
            "Configuration resolved"
        );
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_sections() {
        let json = r#"{
            "rules": { "dir": "/etc/spanmold/rules", "bundle_path": "/var/cache/spanmold.msgpack", "mode": "prod" },
            "transforms": { "budget_us": 500 }
        }"#;
        let parsed: FileConfig = serde_json::from_str(json).unwrap();
        let rules = parsed.rules.as_ref().unwrap();

        assert_eq!(rules.dir.as_deref(), Some("/etc/spanmold/rules"));
        assert_eq!(rules.mode, Some(LoadMode::Prod));
        assert_eq!(parsed.transforms.as_ref().unwrap().budget_us, Some(500));
        assert!(parsed.extra.is_empty());
    }

    #[test]
    fn test_unknown_keys_are_kept_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spanmold.json");
        fs::write(&path, r#"{ "rulez": {}, "transforms": { "budget_us": 10 } }"#).unwrap();
        let parsed = FileConfig::read(&path).unwrap();
        assert!(parsed.extra.contains_key("rulez"));
        assert_eq!(parsed.transforms.unwrap().budget_us, Some(10));
    }

    #[test]
    fn test_bad_mode_rejected() {
        let json = r#"{ "rules": { "mode": "staging" } }"#;
        assert!(serde_json::from_str::<FileConfig>(json).is_err());
    }

    #[test]
    fn test_overlay_keeps_unset_values() {
        let mut base: FileConfig = serde_json::from_str(
            r#"{ "rules": { "dir": "/a", "mode": "prod" }, "transforms": { "budget_us": 100 } }"#,
        )
        .unwrap();
        let overlay: FileConfig =
            serde_json::from_str(r#"{ "rules": { "dir": "/b" } }"#).unwrap();
        base.overlay(overlay);

        let rules = base.rules.as_ref().unwrap();
        assert_eq!(rules.dir.as_deref(), Some("/b"));
        assert_eq!(rules.mode, Some(LoadMode::Prod));
        assert_eq!(base.transforms.as_ref().unwrap().budget_us, Some(100));
    }

    #[test]
    fn test_layer_defaults() {
        let config = AppConfig::layer(&CliConfig::default(), FileConfig::default());
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.mode, LoadMode::Dev);
    }

    #[test]
    fn test_layer_cli_overrides_file() {
        let file: FileConfig = serde_json::from_str(
            r#"{ "rules": { "dir": "/from/file", "mode": "prod" }, "transforms": { "budget_us": 100 } }"#,
        )
        .unwrap();
        let cli = CliConfig {
            rules_dir: Some(PathBuf::from("/from/cli")),
            transform_budget_us: Some(42),
            ..Default::default()
        };
        let config = AppConfig::layer(&cli, file);
        assert_eq!(config.rules_dir, Some(PathBuf::from("/from/cli")));
        assert_eq!(config.mode, LoadMode::Prod);
        assert_eq!(config.transform_budget_us, Some(42));
    }

    #[test]
    fn test_load_explicit_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.json");
        fs::write(&path, r#"{ "rules": { "bundle_path": "/tmp/b.msgpack" } }"#).unwrap();

        let cli = CliConfig {
            config: Some(path),
            ..Default::default()
        };
        let config = AppConfig::load(&cli).unwrap();
        assert_eq!(config.bundle_path, Some(PathBuf::from("/tmp/b.msgpack")));
    }

    #[test]
    fn test_load_missing_config_file() {
        let cli = CliConfig {
            config: Some(PathBuf::from("/nonexistent/spanmold.json")),
            ..Default::default()
        };
        let err = AppConfig::load(&cli).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }
}
