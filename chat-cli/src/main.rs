//! # chatsync-cli
//!
//! CLI tool for inspecting chatsync behaviour without a live backend.
//!
//! ## Commands
//!
//! - `replay`: Apply a recorded change log to a message window and print it
//! - `check-config`: Validate an engine configuration file
//! - `demo`: Run the engine against the in-memory collaborator
//!
//! ## Example
//!
//! ```bash
//! # Print the window a change log converges to
//! chatsync replay --events changes.json
//!
//! # Only one chat, as JSON
//! chatsync replay --events changes.json --chat 6f1c... --json
//!
//! # Validate a config file
//! chatsync check-config chatsync.toml
//!
//! # Watch a scripted session with debug logging
//! RUST_LOG=chatsync_client=debug chatsync demo
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use chatsync_types::ChatId;

mod commands;

use commands::{check_config, demo, replay};

/// CLI tool for inspecting chatsync behaviour.
#[derive(Parser, Debug)]
#[command(name = "chatsync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log at debug level (overridden by RUST_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply a change log (JSON array of {op, table, record}) and print the window
    Replay {
        /// Change log file
        #[arg(long)]
        events: PathBuf,

        /// Chat to replay (default: chat of the first message)
        #[arg(long)]
        chat: Option<ChatId>,

        /// Print the window as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate an engine configuration file
    CheckConfig {
        /// TOML configuration file
        config: PathBuf,
    },

    /// Run a scripted session against the in-memory collaborator
    Demo {
        /// Engine configuration file (defaults if omitted)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Replay { events, chat, json } => {
            replay::run(&events, chat, json).await?;
        }
        Commands::CheckConfig { config } => {
            check_config::run(&config)?;
        }
        Commands::Demo { config } => {
            demo::run(config.as_deref()).await?;
        }
    }

    Ok(())
}
