//! Autolab CLI entry point.

use clap::Parser;

use autolab::cli::{commands, Cli, Commands};
use autolab::infrastructure::logging::{LogConfig, LoggerImpl};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Fall back to defaults so `config validate` can still report a broken file.
    let mut log_config = commands::load_config(cli.config.as_deref())
        .ok()
        .and_then(|config| LogConfig::try_from(&config.logging).ok())
        .unwrap_or_default();
    if cli.json {
        log_config.level = "warn".to_string();
    }
    let _logger = match LoggerImpl::init(&log_config) {
        Ok(logger) => Some(logger),
        Err(err) => {
            eprintln!("Warning: logging disabled: {err:#}");
            None
        }
    };

    let config_path = cli.config.as_deref();
    let result = match cli.command {
        Commands::Config(args) => commands::config::execute(args, config_path, cli.json),
        Commands::Templates(args) => commands::templates::execute(args, cli.json),
        Commands::Run(args) => commands::run::execute(args, config_path, cli.json).await,
    };

    if let Err(err) = result {
        autolab::cli::handle_error(err, cli.json);
    }
}
