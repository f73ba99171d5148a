//! Serial bus access
//!
//! The RTU line is owned by a single [`BusArbiter`] worker. The physical port is
//! opened through a [`BusConnector`], so tests can substitute an in-memory pipe
//! for the serial device.

pub mod arbiter;
pub mod serial;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub use arbiter::{BusArbiter, BusReply, BusSettings, BusStatsSnapshot, BusTicket, Origin};
pub use serial::SerialConnector;

/// Opens (and reopens) the byte stream behind the bus
#[async_trait]
pub trait BusConnector: Send + 'static {
    type Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&mut self) -> std::io::Result<Self::Transport>;

    /// Name used in log lines
    fn describe(&self) -> String;
}

/// Space-separated hex for frame logging
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
