//! Device registry commands

use anyhow::Result;
use bridge_store::{repository, Device, SqliteStore};
use clap::Subcommand;
use colored::*;

#[derive(Subcommand, Debug)]
pub enum DeviceCommands {
    /// List registered devices
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Register a device, or update it when --id is given
    Add {
        /// Device name
        name: String,
        /// IP address
        ip: String,
        /// TCP port
        #[arg(long, default_value_t = 502)]
        port: u16,
        #[arg(long)]
        model: Option<String>,
        #[arg(long = "type")]
        device_type: Option<String>,
        /// Existing device id to update
        #[arg(long)]
        id: Option<i64>,
    },

    /// Remove a device
    Delete { id: i64 },
}

pub async fn handle_command(command: DeviceCommands, store: &SqliteStore) -> Result<()> {
    let pool = store.pool();
    match command {
        DeviceCommands::List { json } => {
            let devices = repository::list_devices(pool).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
                return Ok(());
            }
            if devices.is_empty() {
                println!("{}", "No devices registered".yellow());
                return Ok(());
            }
            for device in &devices {
                println!(
                    "{:>4}  {:<20} {}:{}  {} {}",
                    device.id.unwrap_or_default(),
                    device.device_name.bright_cyan(),
                    device.ip_address,
                    device.tcp_port,
                    device.device_model.as_deref().unwrap_or("-"),
                    device.device_type.as_deref().unwrap_or("-"),
                );
            }
        },
        DeviceCommands::Add {
            name,
            ip,
            port,
            model,
            device_type,
            id,
        } => {
            if let Some(id) = id {
                // Fails with NotFound for unknown ids instead of inserting
                repository::get_device(pool, id).await?;
            }
            let device = Device {
                id,
                updated_at: None,
                ip_address: ip,
                tcp_port: port,
                device_name: name,
                device_model: model,
                device_type,
            };
            let id = repository::upsert_device(pool, &device).await?;
            println!(
                "  {} device {} saved as #{}",
                "✓".green(),
                device.device_name.bright_cyan(),
                id
            );
        },
        DeviceCommands::Delete { id } => {
            if repository::delete_device(pool, id).await? {
                println!("  {} deleted device #{}", "✓".green(), id);
            } else {
                anyhow::bail!("No device #{}", id);
            }
        },
    }
    Ok(())
}
