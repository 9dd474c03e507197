//! ingestd - ingest Rucio-replicated files into a Butler repository.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use ingestd_core::config::LogFormat;
use ingestd_core::Config;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable naming the configuration file.
const CONFIG_ENV: &str = "CTRL_INGESTD_CONFIG";

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
/// - 128+N: Signal N received (e.g., 130 = SIGINT)
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (missing file, invalid or incomplete config)
    ConfigError = 1,
    /// Kafka-related error (connection, consumer group, commit)
    KafkaError = 2,
    /// Butler catalog error
    CatalogError = 3,
    /// General runtime error
    RuntimeError = 10,
    /// Signal interrupt (SIGINT = 2, so 128 + 2 = 130)
    SignalInterrupt = 130,
}

impl ExitCode {
    /// Map an error to an exit code, preferring the core error variant and
    /// falling back to the message text.
    fn from_error(error: &anyhow::Error) -> Self {
        if let Some(core) = error.downcast_ref::<ingestd_core::Error>() {
            return match core {
                ingestd_core::Error::Config(_) | ingestd_core::Error::Serialization(_) => {
                    ExitCode::ConfigError
                }
                ingestd_core::Error::Kafka(_) => ExitCode::KafkaError,
                ingestd_core::Error::Catalog(_) => ExitCode::CatalogError,
                _ => ExitCode::RuntimeError,
            };
        }

        let error_str = error.to_string().to_lowercase();
        if error_str.contains("config") || error_str.contains("toml") {
            ExitCode::ConfigError
        } else if error_str.contains("kafka") || error_str.contains("consumer") {
            ExitCode::KafkaError
        } else if error_str.contains("catalog") || error_str.contains("butler") {
            ExitCode::CatalogError
        } else {
            ExitCode::RuntimeError
        }
    }
}

mod commands;

#[derive(Parser)]
#[command(name = "ingestd")]
#[command(about = "Ingest files replicated by Rucio into a Butler repository", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file
    #[arg(short, long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'D', long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingest daemon (default)
    Run,

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

/// Main CLI execution logic with proper error handling.
async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Logging settings come from the config when it can be read; errors
    // loading it are reported again once logging is up.
    let monitoring = cli
        .config
        .as_deref()
        .and_then(|path| Config::from_file(path).ok())
        .map(|config| config.monitoring);

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new(
            monitoring
                .as_ref()
                .map(|m| m.log_level.as_filter())
                .unwrap_or("info"),
        )
    };

    let log_format = monitoring
        .map(|m| m.log_format)
        .unwrap_or(LogFormat::Text);
    match log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .init();
        }
    }

    match execute_command(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

/// Execute the CLI command.
async fn execute_command(cli: Cli) -> Result<ExitCode> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let outcome = commands::run::run(config).await?;
            Ok(match outcome {
                commands::run::Stopped::Interrupted => ExitCode::SignalInterrupt,
                commands::run::Stopped::Terminated => ExitCode::Success,
            })
        }
        Commands::Validate => {
            commands::validate::run(&config);
            Ok(ExitCode::Success)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.ok_or_else(|| {
        anyhow!(
            "No configuration file given: pass --config or set {}",
            CONFIG_ENV
        )
    })?;
    Ok(Config::from_file(path)?)
}
