//! Address mapping commands

use anyhow::Result;
use bridge_store::{Mapping, MappingStore, SqliteStore};
use clap::Subcommand;
use colored::*;

#[derive(Subcommand, Debug)]
pub enum MappingCommands {
    /// List all mappings
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create or replace a mapping
    Set {
        /// Unit id (or start register in register key mode)
        tcp_address: u16,
        /// Serial slave id (0 = broadcast, writes only)
        rtu_id: u8,
        /// Register address on the slave
        rtu_address: u16,
    },

    /// Show one mapping
    Get { tcp_address: u16 },

    /// Delete a mapping
    Delete { tcp_address: u16 },
}

pub async fn handle_command(command: MappingCommands, store: &SqliteStore) -> Result<()> {
    match command {
        MappingCommands::List { json } => {
            let mappings = store.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&mappings)?);
                return Ok(());
            }
            if mappings.is_empty() {
                println!("{}", "No mappings configured".yellow());
                return Ok(());
            }
            println!(
                "{}",
                format!("{:>11}  {:>6}  {:>11}", "TCP ADDRESS", "RTU ID", "RTU ADDRESS").bold()
            );
            for mapping in &mappings {
                println!("{}", format_row(mapping));
            }
            println!("{} mapping(s)", mappings.len());
        },
        MappingCommands::Set {
            tcp_address,
            rtu_id,
            rtu_address,
        } => {
            let mapping = Mapping::new(tcp_address, rtu_id, rtu_address);
            store.upsert(mapping).await?;
            println!("  {} {}", "✓".green(), format_row(&mapping));
            if mapping.is_broadcast() {
                println!(
                    "  {} slave 0 is broadcast: reads through this mapping are refused",
                    "!".yellow()
                );
            }
        },
        MappingCommands::Get { tcp_address } => match store.resolve(tcp_address).await? {
            Some(mapping) => println!("{}", format_row(&mapping)),
            None => anyhow::bail!("No mapping for {}", tcp_address),
        },
        MappingCommands::Delete { tcp_address } => {
            if store.delete(tcp_address).await? {
                println!("  {} deleted mapping {}", "✓".green(), tcp_address);
            } else {
                println!("  {} no mapping for {}", "-".yellow(), tcp_address);
            }
        },
    }
    Ok(())
}

fn format_row(mapping: &Mapping) -> String {
    format!(
        "{:>11}  {:>6}  {:>11}",
        mapping.tcp_address, mapping.rtu_id, mapping.rtu_address
    )
}
