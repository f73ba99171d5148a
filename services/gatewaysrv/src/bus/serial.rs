//! Serial port connector

use async_trait::async_trait;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

use super::BusConnector;
use crate::config::{Parity, SerialConfig};

pub struct SerialConnector {
    config: SerialConfig,
}

impl SerialConnector {
    pub fn new(config: SerialConfig) -> Self {
        Self { config }
    }
}

/// Open the configured serial device in async mode
pub fn open_serial(config: &SerialConfig) -> std::io::Result<SerialStream> {
    debug!("RTU: {} @{}baud", config.device, config.baud_rate);

    let parity = match config.parity {
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::None => tokio_serial::Parity::None,
    };

    let data_bits = match config.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };

    let stop_bits = match config.stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    };

    let port = tokio_serial::new(&config.device, config.baud_rate)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .open_native_async()?;

    info!("RTU opened: {}", config.device);
    Ok(port)
}

#[async_trait]
impl BusConnector for SerialConnector {
    type Transport = SerialStream;

    async fn connect(&mut self) -> std::io::Result<SerialStream> {
        open_serial(&self.config)
    }

    fn describe(&self) -> String {
        format!(
            "{} {}-{}{}{}",
            self.config.device,
            self.config.baud_rate,
            self.config.data_bits,
            match self.config.parity {
                Parity::None => 'N',
                Parity::Even => 'E',
                Parity::Odd => 'O',
            },
            self.config.stop_bits
        )
    }
}
