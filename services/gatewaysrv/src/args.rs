//! Command-line arguments

use std::path::PathBuf;

use clap::Parser;

use crate::config::GatewayConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "gatewaysrv", version, about = "Modbus TCP to RTU gateway")]
pub struct Args {
    /// Configuration file (YAML)
    #[arg(short = 'c', long, env = "GATEWAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// SQLite mapping database; overrides the config file
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Listen address as host:port; overrides the config file
    #[arg(short = 'b', long)]
    pub listen: Option<String>,

    /// Serial device; overrides the config file
    #[arg(short = 'd', long)]
    pub device: Option<String>,

    /// Validate and print the effective configuration, then exit
    #[arg(long)]
    pub validate: bool,
}

impl Args {
    /// Apply command-line overrides on top of the loaded configuration
    pub fn apply(&self, config: &mut GatewayConfig) -> crate::error::Result<()> {
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(path) = &self.db_path {
            config.database.path = path.clone();
        }
        if let Some(device) = &self.device {
            config.serial.device = device.clone();
        }
        if let Some(listen) = &self.listen {
            let (host, port) = listen.rsplit_once(':').ok_or_else(|| {
                crate::error::GatewayError::Config(format!(
                    "invalid listen address '{}', expected host:port",
                    listen
                ))
            })?;
            config.listen.port = port.parse().map_err(|_| {
                crate::error::GatewayError::Config(format!("invalid listen port '{}'", port))
            })?;
            config.listen.host = host.to_string();
        }
        config.validate()
    }
}
