use clap::{Parser, Subcommand};

use std::path::PathBuf;

use super::constants::{
    ENV_BUNDLE_PATH, ENV_CONFIG, ENV_MODE, ENV_RULES_DIR, ENV_TRANSFORM_BUDGET_US,
};
use crate::domain::dsl::LoadMode;

#[derive(Parser)]
#[command(name = "spanmold")]
#[command(version, about = "Normalize LLM trace spans into a canonical event", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file
    #[arg(long, short = 'c', global = true, env = ENV_CONFIG)]
    pub config: Option<PathBuf>,

    /// Rule directory (core.yaml + providers/); embedded rules when unset
    #[arg(long, short = 'r', global = true, env = ENV_RULES_DIR)]
    pub rules_dir: Option<PathBuf>,

    /// Compiled bundle path
    #[arg(long, global = true, env = ENV_BUNDLE_PATH)]
    pub bundle_path: Option<PathBuf>,

    /// Load mode (dev or prod)
    #[arg(long, global = true, env = ENV_MODE, value_parser = parse_load_mode)]
    pub mode: Option<LoadMode>,

    /// Default transform budget in microseconds
    #[arg(long, global = true, env = ENV_TRANSFORM_BUDGET_US)]
    pub transform_budget_us: Option<u64>,
}

/// Parse load mode from CLI/env string
fn parse_load_mode(s: &str) -> Result<LoadMode, String> {
    LoadMode::parse(s).ok_or_else(|| format!("Invalid mode '{}'. Valid options: dev, prod", s))
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Validate rule files and report every error
    Validate,
    /// Compile rules into a bundle artifact
    Compile {
        /// Output path (defaults to the configured bundle path)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
    /// Print a summary of the active bundle
    Inspect {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Normalize attribute maps read from a JSON file ("-" for stdin)
    Normalize {
        /// A JSON object of span attributes, or an array of them
        input: PathBuf,
        /// Include detection and diagnostics in the output
        #[arg(long)]
        diagnostics: bool,
        /// Pretty-print output
        #[arg(long)]
        pretty: bool,
    },
}

/// Configuration derived from CLI arguments
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub config: Option<PathBuf>,
    pub rules_dir: Option<PathBuf>,
    pub bundle_path: Option<PathBuf>,
    pub mode: Option<LoadMode>,
    pub transform_budget_us: Option<u64>,
}

/// Parse CLI arguments and return config with command
pub fn parse() -> (CliConfig, Commands) {
    let cli = Cli::parse();
    let config = CliConfig {
        config: cli.config,
        rules_dir: cli.rules_dir,
        bundle_path: cli.bundle_path,
        mode: cli.mode,
        transform_budget_us: cli.transform_budget_us,
    };
    (config, cli.command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_normalize_with_globals() {
        let cli = Cli::try_parse_from([
            "spanmold",
            "normalize",
            "spans.json",
            "--mode",
            "PROD",
            "--transform-budget-us",
            "500",
            "--diagnostics",
        ])
        .unwrap();
        assert_eq!(cli.mode, Some(LoadMode::Prod));
        assert_eq!(cli.transform_budget_us, Some(500));
        match cli.command {
            Commands::Normalize {
                input,
                diagnostics,
                pretty,
            } => {
                assert_eq!(input, PathBuf::from("spans.json"));
                assert!(diagnostics);
                assert!(!pretty);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_invalid_mode() {
        assert!(Cli::try_parse_from(["spanmold", "validate", "--mode", "staging"]).is_err());
        assert!(parse_load_mode("dev").is_ok());
    }
}
