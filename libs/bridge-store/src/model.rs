//! Row types shared by the store backends

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One address-mapping entry, keyed by `tcp_address`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mapping {
    pub tcp_address: u16,
    pub rtu_id: u8,
    pub rtu_address: u16,
}

impl Mapping {
    pub fn new(tcp_address: u16, rtu_id: u8, rtu_address: u16) -> Self {
        Self {
            tcp_address,
            rtu_id,
            rtu_address,
        }
    }

    /// Slave id 0 addresses every device on the line
    pub fn is_broadcast(&self) -> bool {
        self.rtu_id == 0
    }
}

/// Registered TCP-side device (admin bookkeeping only)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// `None` when inserting a new device
    pub id: Option<i64>,
    pub updated_at: Option<DateTime<Utc>>,
    pub ip_address: String,
    pub tcp_port: u16,
    pub device_name: String,
    pub device_model: Option<String>,
    pub device_type: Option<String>,
}

/// Entry of the service audit log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub message: String,
}

impl LogRecord {
    pub fn now(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            service: service.into(),
            message: message.into(),
        }
    }
}
