//! Audit log commands

use anyhow::Result;
use bridge_store::{repository, LogRecord, SqliteStore};
use clap::Subcommand;
use colored::*;

#[derive(Subcommand, Debug)]
pub enum LogCommands {
    /// Show the newest entries, oldest first
    Tail {
        /// Number of entries
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: u32,

        /// Only entries whose message contains this text
        #[arg(long)]
        grep: Option<String>,
    },
}

pub async fn handle_command(command: LogCommands, store: &SqliteStore) -> Result<()> {
    match command {
        LogCommands::Tail { lines, grep } => {
            let mut records = repository::recent_logs(store.pool(), lines).await?;
            records.reverse();
            let shown = filter(records, grep.as_deref());
            if shown.is_empty() {
                println!("{}", "No log entries".yellow());
            }
            for record in &shown {
                println!(
                    "{} {} {}",
                    record
                        .timestamp
                        .format("%Y-%m-%d %H:%M:%S")
                        .to_string()
                        .dimmed(),
                    format!("[{}]", record.service).bright_blue(),
                    highlight(&record.message)
                );
            }
        },
    }
    Ok(())
}

fn filter(records: Vec<LogRecord>, needle: Option<&str>) -> Vec<LogRecord> {
    match needle {
        Some(needle) => records
            .into_iter()
            .filter(|r| r.message.contains(needle))
            .collect(),
        None => records,
    }
}

fn highlight(message: &str) -> ColoredString {
    if message.contains("unavailable") {
        message.red()
    } else {
        message.normal()
    }
}
