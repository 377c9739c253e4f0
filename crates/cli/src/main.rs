//! Ravel CLI: the main entry point.
//!
//! Commands:
//! - `replay`: Feed model transcripts through the engine and print the chain
//! - `parse`: Print the stream parser's events for a transcript
//! - `config`: Show, locate or validate configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ravel_config::RuntimeConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "ravel",
    about = "Ravel: streaming agent runtime",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use this config file instead of ~/.ravel/config.toml
    #[arg(long, global = true, env = "RAVEL_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay transcripts through the engine with demo capabilities
    Replay {
        /// Transcript file; responses are separated by `---` lines. `-` reads stdin
        transcript: PathBuf,

        /// Send this text to the `message` input before stepping
        #[arg(short, long)]
        input: Option<String>,

        /// Characters per streamed chunk
        #[arg(long, default_value_t = 8)]
        chunk_size: usize,

        /// Print run events to stderr as JSON lines
        #[arg(long)]
        events: bool,
    },

    /// Print parser events for a transcript as JSON lines
    Parse {
        /// Transcript file. `-` reads stdin
        transcript: PathBuf,

        /// Characters per pushed chunk
        #[arg(long, default_value_t = 8)]
        chunk_size: usize,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the built-in defaults as TOML
    Defaults,
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
    /// Validate the configuration
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let mut config = RuntimeConfig::load_from(path)?;
            config.apply_env(|key| std::env::var(key).ok())?;
            config.validate()?;
            config
        }
        None => RuntimeConfig::load()?,
    };

    init_tracing(&config, cli.verbose);

    match cli.command {
        Commands::Replay {
            transcript,
            input,
            chunk_size,
            events,
        } => {
            let options = commands::replay::ReplayOptions {
                input,
                chunk_size,
                events,
            };
            commands::replay::run(&config, &transcript, options).await?
        }
        Commands::Parse {
            transcript,
            chunk_size,
        } => commands::parse::run(&config, &transcript, chunk_size)?,
        Commands::Config { action } => match action.unwrap_or(ConfigAction::Defaults) {
            ConfigAction::Defaults => commands::config_cmd::defaults(),
            ConfigAction::Show => commands::config_cmd::show(&config)?,
            ConfigAction::Path => commands::config_cmd::path(cli.config.as_deref()),
            ConfigAction::Validate => commands::config_cmd::validate(&config),
        },
    }

    Ok(())
}

fn init_tracing(config: &RuntimeConfig, verbose: bool) {
    let level = if verbose { "debug" } else { config.logging.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    // Logs go to stderr; stdout carries command output.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
