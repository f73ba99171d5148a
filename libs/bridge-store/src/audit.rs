//! Background audit log writer
//!
//! `record` enqueues with `try_send` and returns immediately. A single writer
//! task drains the queue into the `logs` table. Overflow and write failures
//! are dropped.

use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::model::LogRecord;
use crate::repository;
use crate::traits::AuditSink;

#[derive(Debug, Clone)]
pub struct AuditLogger {
    tx: mpsc::Sender<LogRecord>,
}

impl AuditLogger {
    /// Spawn the writer task. It exits once every `AuditLogger` clone is dropped.
    pub fn spawn(pool: SqlitePool, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<LogRecord>(capacity.max(1));

        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(e) = repository::insert_log(&pool, &record).await {
                    debug!("Audit write dropped: {}", e);
                }
            }
            debug!("Audit writer stopped");
        });

        (Self { tx }, handle)
    }
}

impl AuditSink for AuditLogger {
    fn record(&self, service: &str, message: &str) {
        if self.tx.try_send(LogRecord::now(service, message)).is_err() {
            debug!("Audit queue full or closed, dropping: {}", message);
        }
    }
}
