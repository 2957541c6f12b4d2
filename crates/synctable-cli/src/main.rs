//! Synctable CLI
//!
//! Command-line interface for synctable - serve an in-memory changefeed
//! backend over websocket, watch live tables, and write rows.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use synctable_core::Config;

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "synctable")]
#[command(about = "Synctable - live query mirrors over one websocket")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default one
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a websocket changefeed server backed by memory
    Serve {
        /// Address to listen on (overrides config `bind`)
        #[arg(short, long)]
        bind: Option<String>,
        /// Seed rows from a JSON file: {"table": [record, ...], ...}
        #[arg(long)]
        seed: Option<PathBuf>,
    },
    /// Print a live table and every change to it
    Watch {
        /// Query, e.g. '{"tasks": [{"id": null, "done": null}]}'
        query: String,
        /// Order rows by this column (prefix with - for descending)
        #[arg(long)]
        order_by: Option<String>,
        /// Return at most this many rows
        #[arg(long)]
        limit: Option<u64>,
        /// Print the first snapshot and exit
        #[arg(long)]
        once: bool,
    },
    /// Write one record and wait for the server to acknowledge it
    Set {
        /// Table name
        table: String,
        /// Record as JSON, including its primary key
        record: String,
        /// Delete the row instead of writing it
        #[arg(short, long)]
        delete: bool,
    },
    /// Show configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config = load_config(cli.config.as_ref())?;

    init_logging(&config);

    match cli.command {
        Commands::Serve { bind, seed } => {
            commands::serve::run(&config, bind, seed, &output).await
        }
        Commands::Watch {
            query,
            order_by,
            limit,
            once,
        } => commands::watch::run(&config, &query, order_by, limit, once, &output).await,
        Commands::Set {
            table,
            record,
            delete,
        } => commands::set::run(&config, &table, &record, delete, &output).await,
        Commands::Config { command } => match command.unwrap_or(ConfigCommands::Show) {
            ConfigCommands::Show => commands::config::show(&config, cli.config.as_ref(), &output),
            ConfigCommands::Path => commands::config::path(cli.config.as_ref(), &output),
        },
    }
}

/// Load configuration, preferring `--config` over the default location
fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")
}

/// Log to stderr; RUST_LOG wins over the configured level
fn init_logging(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "synctable_core={},synctable_cli={}",
            config.log_level, config.log_level
        ))
    });

    // Ignore error if already initialized
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
