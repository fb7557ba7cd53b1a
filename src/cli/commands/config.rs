//! Config CLI commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};

use super::load_config;
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::Config;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Load and validate a configuration
    Validate {
        /// File to validate (defaults to the layered lookup)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

/// Effective configuration, printed as YAML.
#[derive(Debug, Serialize)]
pub struct ConfigShowOutput {
    /// Merged configuration.
    pub config: Config,
}

impl CommandOutput for ConfigShowOutput {
    fn to_human(&self) -> String {
        serde_yaml::to_string(&self.config).unwrap_or_else(|e| format!("<unprintable config: {e}>"))
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or_default()
    }
}

/// Outcome of `config validate`.
#[derive(Debug, Serialize)]
pub struct ConfigValidateOutput {
    /// Whether loading and validation succeeded.
    pub valid: bool,
    /// File or lookup chain that was loaded.
    pub source: String,
    /// Number of safety rules loaded.
    pub safety_rules: usize,
    /// Number of emergency protocols loaded.
    pub emergency_protocols: usize,
    /// Number of providers in the static directory.
    pub providers: usize,
    /// Load or validation error, if any.
    pub error: Option<String>,
}

impl CommandOutput for ConfigValidateOutput {
    fn to_human(&self) -> String {
        match &self.error {
            None => format!(
                "Configuration from {} is valid ({} safety rules, {} emergency protocols, {} providers)",
                self.source, self.safety_rules, self.emergency_protocols, self.providers
            ),
            Some(error) => format!("Configuration from {} is invalid: {error}", self.source),
        }
    }
}

/// Run a `config` subcommand.
pub fn execute(args: ConfigArgs, config_path: Option<&Path>, json_mode: bool) -> Result<()> {
    match args.command {
        ConfigCommands::Show => {
            let config = load_config(config_path)?;
            output(&ConfigShowOutput { config }, json_mode);
            Ok(())
        }
        ConfigCommands::Validate { file } => {
            let path = file.as_deref().or(config_path);
            let result = validate(path);
            let invalid = !result.valid;
            output(&result, json_mode);
            if invalid {
                anyhow::bail!("configuration validation failed");
            }
            Ok(())
        }
    }
}

fn validate(path: Option<&Path>) -> ConfigValidateOutput {
    let source = path.map_or_else(|| ".autolab (layered)".to_string(), |p| p.display().to_string());
    match load_config(path) {
        Ok(config) => ConfigValidateOutput {
            valid: true,
            source,
            safety_rules: config.safety.rules.len(),
            emergency_protocols: config.safety.protocols.len(),
            providers: config.providers.len(),
            error: None,
        },
        Err(err) => ConfigValidateOutput {
            valid: false,
            source,
            safety_rules: 0,
            emergency_protocols: 0,
            providers: 0,
            error: Some(format!("{err:#}")),
        },
    }
}
