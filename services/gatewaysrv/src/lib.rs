//! Modbus TCP to RTU gateway
//!
//! Accepts Modbus TCP clients, resolves each request's unit id (or start
//! address) to a serial slave and register through the SQLite mapping table,
//! and forwards it over a single shared RS-485 line.
//!
//! ```text
//! TCP clients ──► GatewayListener ──► SessionHandler (one per connection)
//!                                          │  resolve          ▲ response / exception
//!                                          ▼                   │
//!                                    MappingStore        BusArbiter ──► serial port
//!                                    (SQLite)            (single worker, FIFO)
//! ```
//!
//! - [`bus`]: the arbiter that serializes RTU transactions on the line
//! - [`session`]: per-connection state machine and exception mapping
//! - [`listener`]: accept loop with a session limit
//! - [`runtime`]: wiring and ordered shutdown

pub mod args;
pub mod bus;
pub mod config;
pub mod error;
pub mod listener;
pub mod logging;
pub mod runtime;
pub mod session;
pub mod shutdown;

pub use config::GatewayConfig;
pub use error::{BusError, GatewayError, Result};
pub use runtime::{run_gateway, Gateway};

/// Service name used for log files and audit records
pub const SERVICE_NAME: &str = "gatewaysrv";
