//! One-shot read through a running gateway

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bridge_codec::constants::MBAP_HEADER_LEN;
use bridge_codec::{decode_tcp_response, encode_tcp_request, ResponsePayload, TcpResponse};
use clap::Args;
use colored::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Gateway address (host:port)
    #[arg(default_value = "127.0.0.1:1502")]
    pub gateway: String,

    #[arg(short, long, default_value_t = 10)]
    pub unit: u8,

    /// Function code: 3 (holding) or 4 (input registers)
    #[arg(short, long, default_value_t = 3)]
    pub function: u8,

    #[arg(short, long, default_value_t = 41060)]
    pub address: u16,

    #[arg(short, long, default_value_t = 2)]
    pub quantity: u16,

    /// Seconds to wait for the answer
    #[arg(short, long, default_value_t = 5)]
    pub timeout: u64,
}

pub fn build_read_request(transaction_id: u16, args: &ProbeArgs) -> Result<Vec<u8>> {
    if !matches!(args.function, 0x03 | 0x04) {
        anyhow::bail!("probe supports function 3 or 4, got {}", args.function);
    }
    if args.quantity == 0 || args.quantity > 125 {
        anyhow::bail!("quantity must be 1..=125");
    }

    let mut body = Vec::with_capacity(4);
    body.extend_from_slice(&args.address.to_be_bytes());
    body.extend_from_slice(&args.quantity.to_be_bytes());
    Ok(encode_tcp_request(transaction_id, args.unit, args.function, &body)?)
}

/// Register values from a read response body (`byte count` + data)
pub fn registers(body: &[u8]) -> Vec<u16> {
    body.get(1..)
        .unwrap_or_default()
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

async fn exchange(stream: &mut TcpStream, request: &[u8]) -> Result<TcpResponse> {
    stream.write_all(request).await?;

    let mut header = [0u8; MBAP_HEADER_LEN];
    stream
        .read_exact(&mut header)
        .await
        .context("Gateway closed the connection")?;
    let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
    let mut rest = vec![0u8; length];
    stream.read_exact(&mut rest).await?;

    let mut frame = header.to_vec();
    frame.extend_from_slice(&rest);
    Ok(decode_tcp_response(&frame)?)
}

pub async fn run(args: ProbeArgs) -> Result<()> {
    let transaction_id = 1;
    let request = build_read_request(transaction_id, &args)?;
    let limit = Duration::from_secs(args.timeout);

    let mut stream = timeout(limit, TcpStream::connect(&args.gateway))
        .await
        .with_context(|| format!("Timed out connecting to {}", args.gateway))?
        .with_context(|| format!("Failed to connect to {}", args.gateway))?;

    let started = Instant::now();
    let response = timeout(limit, exchange(&mut stream, &request))
        .await
        .with_context(|| format!("No answer within {}s", args.timeout))??;
    let elapsed = started.elapsed();

    if response.transaction_id != transaction_id {
        anyhow::bail!(
            "Transaction id mismatch: sent {}, got {}",
            transaction_id,
            response.transaction_id
        );
    }

    match &response.payload {
        ResponsePayload::Data(body) => {
            println!(
                "  {} unit {} FC{:02X} @{} in {:?}",
                "✓".green(),
                response.unit_id,
                response.function_code,
                args.address,
                elapsed
            );
            for (offset, value) in registers(body).iter().enumerate() {
                println!(
                    "    {:>5}: {:>5}  (0x{:04X})",
                    u32::from(args.address) + offset as u32,
                    value,
                    value
                );
            }
        },
        ResponsePayload::Exception(code) => {
            println!(
                "  {} unit {} FC{:02X} exception {} in {:?}",
                "✗".red(),
                response.unit_id,
                response.function_code,
                code.to_string().yellow(),
                elapsed
            );
        },
    }
    Ok(())
}
