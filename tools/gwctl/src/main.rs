//! gwctl - administration tool for the Modbus TCP/RTU gateway
//!
//! Edits the mapping database the gateway reads on every request, keeps the
//! device registry, shows the audit log and probes a running gateway.

mod devices;
mod logs;
mod mappings;
mod probe;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bridge_store::SqliteStore;
use clap::{Parser, Subcommand};
use colored::*;

const DEFAULT_DB_PATH: &str = "data/modbus_mapping.db";

#[derive(Parser)]
#[command(name = "gwctl")]
#[command(about = "Modbus gateway administration")]
#[command(long_about = "Modbus gateway administration

Database:
  init        Create the mapping, device and log tables
  mapping     List, set and delete address mappings
  device      List, add and delete registered devices
  logs        Show recent gateway audit entries

Gateway:
  probe       Send one read request to a running gateway

Examples:
  gwctl init
  gwctl mapping set 10 10 41060        # unit 10 -> slave 10, register 41060
  gwctl mapping list --json
  gwctl probe 127.0.0.1:1502 --unit 10 --address 41060 --quantity 2")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite database file
    #[arg(long = "db-path", global = true, env = "GATEWAY_DATABASE__PATH", default_value = DEFAULT_DB_PATH)]
    db_path: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create tables (safe to run repeatedly)
    Init,

    /// Manage address mappings
    Mapping {
        #[command(subcommand)]
        command: mappings::MappingCommands,
    },

    /// Manage the device registry
    Device {
        #[command(subcommand)]
        command: devices::DeviceCommands,
    },

    /// Show the gateway audit log
    Logs {
        #[command(subcommand)]
        command: logs::LogCommands,
    },

    /// Send one read request to a gateway and print the answer
    Probe(probe::ProbeArgs),
}

async fn open_store(path: &Path) -> Result<SqliteStore> {
    tracing::debug!("Database: {}", path.display());
    let store = SqliteStore::connect(path)
        .await
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    store.init_schema().await?;
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Probe(args) => probe::run(args).await,
        Commands::Init => {
            let store = open_store(&cli.db_path).await?;
            println!(
                "  {} schema ready: {}",
                "✓".green(),
                cli.db_path.display().to_string().bright_cyan()
            );
            store.close().await;
            Ok(())
        },
        Commands::Mapping { command } => {
            let store = open_store(&cli.db_path).await?;
            let result = mappings::handle_command(command, &store).await;
            store.close().await;
            result
        },
        Commands::Device { command } => {
            let store = open_store(&cli.db_path).await?;
            let result = devices::handle_command(command, &store).await;
            store.close().await;
            result
        },
        Commands::Logs { command } => {
            let store = open_store(&cli.db_path).await?;
            let result = logs::handle_command(command, &store).await;
            store.close().await;
            result
        },
    }
}
