//! Shared fixtures: an in-memory serial line and a scripted RTU slave
#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bridge_codec::crc16;
use gatewaysrv::bus::{BusConnector, BusSettings};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

/// Short timings so failure paths finish quickly
pub fn fast_settings() -> BusSettings {
    BusSettings {
        response_timeout: Duration::from_millis(200),
        silence: Duration::from_millis(20),
        turnaround: Duration::from_millis(5),
        admission_timeout: Duration::from_secs(2),
        queue_depth: 16,
        reconnect_delay: Duration::from_millis(100),
    }
}

/// Append the RTU checksum
pub fn rtu_frame(bytes: &[u8]) -> Vec<u8> {
    let mut frame = bytes.to_vec();
    frame.extend_from_slice(&crc16(bytes).to_le_bytes());
    frame
}

/// Connector handing out pre-plugged in-memory ports, one per successful connect
pub struct PipeConnector {
    ports: mpsc::UnboundedReceiver<DuplexStream>,
    attempts: Arc<AtomicUsize>,
}

/// Test side of a [`PipeConnector`]
#[derive(Clone)]
pub struct PipeHandle {
    ports: mpsc::UnboundedSender<DuplexStream>,
    attempts: Arc<AtomicUsize>,
}

impl PipeConnector {
    pub fn new() -> (Self, PipeHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let attempts = Arc::new(AtomicUsize::new(0));
        (
            Self {
                ports: rx,
                attempts: Arc::clone(&attempts),
            },
            PipeHandle {
                ports: tx,
                attempts,
            },
        )
    }
}

impl PipeHandle {
    /// Make the next connect succeed; returns the device end of the line
    pub fn plug(&self) -> DuplexStream {
        let (device, port) = tokio::io::duplex(1024);
        self.ports.send(port).unwrap();
        device
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BusConnector for PipeConnector {
    type Transport = DuplexStream;

    async fn connect(&mut self) -> std::io::Result<DuplexStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.ports
            .try_recv()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::NotFound, "no port plugged"))
    }

    fn describe(&self) -> String {
        "pipe".to_string()
    }
}

/// What the slave does with one request frame
pub enum Reply {
    /// Write these bytes after the delay
    After(Duration, Vec<u8>),
    /// Write these bytes immediately
    Now(Vec<u8>),
    Silent,
}

/// One request as seen by the slave
#[derive(Debug, Clone)]
pub struct Seen {
    pub frame: Vec<u8>,
    pub received_at: Instant,
    /// When the slave finished writing its reply (receipt time when silent)
    pub done_at: Instant,
}

/// Scripted RTU slave on the device end of a pipe
pub struct MockSlave {
    seen: Arc<Mutex<Vec<Seen>>>,
    task: JoinHandle<()>,
}

impl MockSlave {
    pub fn spawn<F>(mut device: DuplexStream, mut script: F) -> Self
    where
        F: FnMut(&[u8]) -> Reply + Send + 'static,
    {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);

        let task = tokio::spawn(async move {
            let mut buf = [0u8; 256];
            loop {
                let n = match device.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                let received_at = Instant::now();
                let mut frame = buf[..n].to_vec();
                // Collect the rest of the frame until the line goes quiet
                while let Ok(Ok(n)) = timeout(Duration::from_millis(5), device.read(&mut buf)).await {
                    if n == 0 {
                        break;
                    }
                    frame.extend_from_slice(&buf[..n]);
                }

                let bytes = match script(&frame) {
                    Reply::Now(bytes) => Some(bytes),
                    Reply::After(delay, bytes) => {
                        sleep(delay).await;
                        Some(bytes)
                    },
                    Reply::Silent => None,
                };
                if let Some(bytes) = bytes {
                    if device.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
                log.lock().push(Seen {
                    frame,
                    received_at,
                    done_at: Instant::now(),
                });
            }
        });

        Self { seen, task }
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.seen.lock().iter().map(|s| s.frame.clone()).collect()
    }
}

impl Drop for MockSlave {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Normal FC3 reply: one register per requested quantity, value = slave id
pub fn holding_reply(request: &[u8]) -> Vec<u8> {
    let slave = request[0];
    let quantity = u16::from_be_bytes([request[4], request[5]]) as usize;
    let mut pdu = vec![slave, 0x03, (quantity * 2) as u8];
    for _ in 0..quantity {
        pdu.extend_from_slice(&[0x00, slave]);
    }
    rtu_frame(&pdu)
}
