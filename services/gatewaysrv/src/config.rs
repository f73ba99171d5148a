//! Gateway configuration
//!
//! Layered with figment, lowest priority first:
//! 1. Built-in defaults
//! 2. YAML file (`config/gatewaysrv.yaml` unless `--config` is given)
//! 3. `GATEWAY_` environment variables, `__` separating sections
//!    (e.g. `GATEWAY_BUS__RESPONSE_TIMEOUT_MS=1500`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "config/gatewaysrv.yaml";
pub const ENV_PREFIX: &str = "GATEWAY_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen: ListenConfig,
    pub serial: SerialConfig,
    pub bus: BusConfig,
    pub session: SessionConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
    /// Sessions served concurrently; extra connections wait for a slot
    pub max_sessions: usize,
    /// Close a session after this long without a request (0 disables)
    pub idle_timeout_secs: u64,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1502,
            max_sessions: 32,
            idle_timeout_secs: 300,
        }
    }
}

impl ListenConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub device: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// First response byte must arrive within this window
    pub response_timeout_ms: u64,
    /// Quiet time that ends a response frame
    pub silence_ms: u64,
    /// Minimum gap between consecutive frames on the line (and after a broadcast)
    pub turnaround_ms: u64,
    /// Longest a request may wait in the queue before `BusBusy`
    pub admission_timeout_ms: u64,
    pub queue_depth: usize,
    /// Wait before reopening a failed serial port
    pub reconnect_delay_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 1000,
            silence_ms: 50,
            turnaround_ms: 20,
            admission_timeout_ms: 3000,
            queue_depth: 100,
            reconnect_delay_ms: 2000,
        }
    }
}

impl BusConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn silence(&self) -> Duration {
        Duration::from_millis(self.silence_ms)
    }

    pub fn turnaround(&self) -> Duration {
        Duration::from_millis(self.turnaround_ms)
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Which TCP-side field is looked up in the mapping table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingKey {
    /// MBAP unit id
    Unit,
    /// Starting register/coil address of the request
    Register,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Extra attempts after a bus timeout or checksum failure
    pub retries: u32,
    pub resolve_timeout_ms: u64,
    pub mapping_key: MappingKey,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retries: 1,
            resolve_timeout_ms: 500,
            mapping_key: MappingKey::Unit,
        }
    }
}

impl SessionConfig {
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/modbus_mapping.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Also write daily log files here
    pub dir: Option<PathBuf>,
    /// Audit queue capacity; records beyond it are dropped
    pub audit_capacity: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            audit_capacity: 256,
        }
    }
}

impl GatewayConfig {
    /// Load from defaults, optional YAML file and environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let config: GatewayConfig = Figment::new()
            .merge(Serialized::defaults(GatewayConfig::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(GatewayError::Config(msg.to_string()));

        if self.listen.max_sessions == 0 {
            return invalid("listen.max_sessions must be at least 1");
        }
        if self.serial.device.is_empty() {
            return invalid("serial.device must not be empty");
        }
        if self.serial.baud_rate == 0 {
            return invalid("serial.baud_rate must be positive");
        }
        if !(5..=8).contains(&self.serial.data_bits) {
            return invalid("serial.data_bits must be 5..=8");
        }
        if !matches!(self.serial.stop_bits, 1 | 2) {
            return invalid("serial.stop_bits must be 1 or 2");
        }
        if self.bus.response_timeout_ms == 0 || self.bus.silence_ms == 0 {
            return invalid("bus timeouts must be positive");
        }
        if self.bus.admission_timeout_ms == 0 {
            return invalid("bus.admission_timeout_ms must be positive");
        }
        if self.bus.queue_depth == 0 {
            return invalid("bus.queue_depth must be at least 1");
        }
        if self.session.resolve_timeout_ms == 0 {
            return invalid("session.resolve_timeout_ms must be positive");
        }
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| GatewayError::Config(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_match_deployment() {
        let config = GatewayConfig::default();
        assert_eq!(config.listen.port, 1502);
        assert_eq!(config.serial.device, "/dev/ttyUSB0");
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.serial.parity, Parity::None);
        assert_eq!(config.bus.response_timeout(), Duration::from_secs(1));
        assert_eq!(config.bus.queue_depth, 100);
        assert_eq!(config.session.retries, 1);
        assert_eq!(config.session.mapping_key, MappingKey::Unit);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_and_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "gateway.yaml",
                r#"
listen:
  port: 5020
serial:
  device: /dev/ttyS1
  parity: Even
session:
  mapping_key: register
"#,
            )?;
            jail.set_env("GATEWAY_BUS__RESPONSE_TIMEOUT_MS", "1500");
            jail.set_env("GATEWAY_LISTEN__PORT", "5021");

            let config = GatewayConfig::load(Some(Path::new("gateway.yaml"))).unwrap();
            assert_eq!(config.listen.port, 5021);
            assert_eq!(config.serial.device, "/dev/ttyS1");
            assert_eq!(config.serial.parity, Parity::Even);
            assert_eq!(config.serial.baud_rate, 9600);
            assert_eq!(config.bus.response_timeout_ms, 1500);
            assert_eq!(config.session.mapping_key, MappingKey::Register);
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        Jail::expect_with(|_jail| {
            let config = GatewayConfig::load(Some(Path::new("absent.yaml"))).unwrap();
            assert_eq!(config, GatewayConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = GatewayConfig::default();
        config.bus.queue_depth = 0;
        assert!(matches!(config.validate(), Err(GatewayError::Config(_))));

        let mut config = GatewayConfig::default();
        config.listen.max_sessions = 0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.serial.stop_bits = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_idle_timeout_zero_disables() {
        let mut listen = ListenConfig::default();
        assert_eq!(listen.idle_timeout(), Some(Duration::from_secs(300)));
        listen.idle_timeout_secs = 0;
        assert_eq!(listen.idle_timeout(), None);
    }
}
