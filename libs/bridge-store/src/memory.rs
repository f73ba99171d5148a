//! In-memory store implementation
//!
//! Uses DashMap for concurrent access. Intended for tests and for running the
//! gateway without a database.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{Result, StoreError};
use crate::model::{LogRecord, Mapping};
use crate::traits::{AuditSink, MappingStore};

/// In-memory mapping table
#[derive(Debug, Clone, Default)]
pub struct MemoryMappingStore {
    mappings: Arc<DashMap<u16, Mapping>>,
    offline: Arc<AtomicBool>,
}

impl MemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populated store
    pub fn with_mappings(mappings: impl IntoIterator<Item = Mapping>) -> Self {
        let store = Self::new();
        for mapping in mappings {
            store.mappings.insert(mapping.tcp_address, mapping);
        }
        store
    }

    /// Simulate the backend going away (`false`) or coming back (`true`)
    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MappingStore for MemoryMappingStore {
    async fn resolve(&self, tcp_address: u16) -> Result<Option<Mapping>> {
        self.check_available()?;
        Ok(self.mappings.get(&tcp_address).map(|entry| *entry.value()))
    }

    async fn upsert(&self, mapping: Mapping) -> Result<()> {
        self.check_available()?;
        self.mappings.insert(mapping.tcp_address, mapping);
        Ok(())
    }

    async fn delete(&self, tcp_address: u16) -> Result<bool> {
        self.check_available()?;
        Ok(self.mappings.remove(&tcp_address).is_some())
    }

    async fn list(&self) -> Result<Vec<Mapping>> {
        self.check_available()?;
        let mut all: Vec<Mapping> = self.mappings.iter().map(|entry| *entry.value()).collect();
        all.sort_by_key(|m| m.tcp_address);
        Ok(all)
    }
}

/// Audit sink that keeps records in memory for inspection
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.records.lock().iter().any(|r| r.message.contains(needle))
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, service: &str, message: &str) {
        self.records.lock().push(LogRecord::now(service, message));
    }
}
