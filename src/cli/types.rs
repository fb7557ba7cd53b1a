//! Top-level clap definitions; each command module owns its own arguments.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use super::commands::{config::ConfigArgs, run::RunArgs, templates::TemplatesArgs};

#[derive(Parser, Debug)]
#[command(name = "autolab")]
#[command(about = "Autolab - research workflow orchestrator", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Load configuration from this file instead of .autolab/
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Inspect and validate configuration
    Config(ConfigArgs),

    /// Inspect workflow templates
    Templates(TemplatesArgs),

    /// Run one research cycle end to end
    Run(RunArgs),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "autolab",
            "run",
            "--template",
            "rapid_prototype",
            "--question",
            "Does it fold?",
            "--json",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.template, "rapid_prototype");
                assert_eq!(args.question.as_deref(), Some("Does it fold?"));
            }
            other => panic!("Expected run command, got {other:?}"),
        }
    }

    #[test]
    fn test_run_requires_template() {
        assert!(Cli::try_parse_from(["autolab", "run"]).is_err());
    }

    #[test]
    fn test_parse_config_validate_with_file() {
        let cli = Cli::try_parse_from(["autolab", "config", "validate", "--file", "lab.yaml"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(_)));
    }
}
