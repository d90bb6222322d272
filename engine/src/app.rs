//! Core application

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value as JsonValue;

use crate::core::cli::{self, Commands};
use crate::core::config::AppConfig;
use crate::core::constants::{APP_NAME_LOWER, DEFAULT_BUNDLE_FILE, ENV_LOG};
use crate::domain::Attributes;
use crate::domain::dsl::{BundleLoader, CompiledBundle, validate};
use crate::domain::pipeline::Normalizer;

pub struct CoreApp {
    pub config: AppConfig,
    pub loader: BundleLoader,
}

impl CoreApp {
    /// Run the application with CLI argument parsing
    pub fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("Application starting");

        let (cli_config, command) = cli::parse();
        tracing::trace!(command = ?command, "Parsed command");

        let app = Self::init(AppConfig::load(&cli_config)?);
        match command {
            Commands::Validate => app.validate(),
            Commands::Compile { output } => app.compile(output),
            Commands::Inspect { json } => app.inspect(json),
            Commands::Normalize {
                input,
                diagnostics,
                pretty,
            } => app.normalize(&input, diagnostics, pretty),
        }
    }

    pub fn init(config: AppConfig) -> Self {
        let loader = BundleLoader::new(config.rules_dir.clone(), config.bundle_path.clone());
        Self { config, loader }
    }

    fn init_logging() {
        let default_filter = format!("info,{}=info", APP_NAME_LOWER);

        let filter = std::env::var(ENV_LOG)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or(default_filter);

        // stdout carries command output
        tracing_subscriber::fmt()
            .with_writer(io::stderr)
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_ansi(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }

    fn load_bundle(&self) -> Result<Arc<CompiledBundle>> {
        self.loader
            .load(self.config.mode)
            .with_context(|| format!("Failed to load rules ({} mode)", self.config.mode))
    }

    fn validate(&self) -> Result<()> {
        let sources = self.loader.sources()?;
        let result = validate(&sources);
        if result.ok {
            println!(
                "Rules are valid ({} provider files, source hash {})",
                sources.providers.len(),
                sources.content_hash()
            );
            return Ok(());
        }

        for error in &result.errors {
            println!("  {}", error);
        }
        anyhow::bail!("{} rule error(s)", result.errors.len())
    }

    fn compile(&self, output: Option<PathBuf>) -> Result<()> {
        let output = output
            .or_else(|| self.config.bundle_path.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BUNDLE_FILE));
        let loader = BundleLoader::new(self.config.rules_dir.clone(), Some(output.clone()));

        let bundle = loader
            .compile_to_artifact()
            .context("Failed to compile rules")?;
        println!(
            "Compiled {} providers into {} (source hash {})",
            bundle.providers.len(),
            output.display(),
            bundle.source_hash
        );
        Ok(())
    }

    fn inspect(&self, json: bool) -> Result<()> {
        let summary = self.load_bundle()?.summary();
        if json {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            return Ok(());
        }

        println!("Bundle format v{}, rules v{}", summary.format_version, summary.rules_version);
        println!("Source hash: {}", summary.source_hash);
        println!("Providers:");
        for provider in &summary.providers {
            println!(
                "  {:<12} {:>3} rules {:>3} mappings",
                provider.name, provider.rules, provider.mappings
            );
        }
        println!("Patterns per tier:");
        for (tier, count) in &summary.patterns_per_tier {
            println!("  {:<14} {}", tier, count);
        }
        println!("Transforms: {}", summary.transforms.join(", "));
        println!("Priced models: {}", summary.priced_models);
        Ok(())
    }

    fn normalize(&self, input: &Path, diagnostics: bool, pretty: bool) -> Result<()> {
        let spans = read_spans(input)?;
        let mut normalizer = Normalizer::new(self.load_bundle()?);
        if let Some(budget_us) = self.config.transform_budget_us {
            normalizer = normalizer.with_transform_budget(budget_us);
        }

        for attrs in &spans {
            let result = normalizer.process(attrs);
            let output = if diagnostics {
                serde_json::to_value(&result)?
            } else {
                result.event.to_json()
            };
            let line = if pretty {
                serde_json::to_string_pretty(&output)?
            } else {
                serde_json::to_string(&output)?
            };
            println!("{}", line);
        }

        let snapshot = normalizer.diagnostics().snapshot();
        tracing::info!(
            spans = snapshot.spans_processed,
            degraded = snapshot.spans_degraded,
            detection_misses = snapshot.detection_misses,
            transform_timeouts = snapshot.transform_timeouts,
            "Normalization finished"
        );
        Ok(())
    }
}

/// Read one attribute object, or an array of them, from a file or stdin.
fn read_spans(input: &Path) -> Result<Vec<Attributes>> {
    let content = if input == Path::new("-") {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read stdin")?;
        buf
    } else {
        fs::read_to_string(input)
            .with_context(|| format!("Failed to read input: {}", input.display()))?
    };

    let value: JsonValue = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse input: {}", input.display()))?;
    parse_spans(value)
}

fn parse_spans(value: JsonValue) -> Result<Vec<Attributes>> {
    let items = match value {
        JsonValue::Array(items) => items,
        object @ JsonValue::Object(_) => vec![object],
        _ => anyhow::bail!("Expected a JSON object of attributes or an array of them"),
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            JsonValue::Object(map) => Ok(map.into_iter().collect()),
            _ => anyhow::bail!("Span {} is not a JSON object", i),
        })
        .collect()
}
