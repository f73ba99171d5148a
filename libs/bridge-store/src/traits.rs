//! Trait definitions for the persistence collaborators

use async_trait::async_trait;

use crate::error::Result;
use crate::model::Mapping;

/// Address-mapping table
///
/// `resolve` is the only call made while serving requests. It must be side
/// effect free and safe to call from many sessions at once.
#[async_trait]
pub trait MappingStore: Send + Sync + 'static {
    /// Look up the mapping for a TCP-side address.
    ///
    /// `Ok(None)` means the key is unmapped. A backend failure is
    /// `Err(StoreError::Unavailable)` and must not be confused with it.
    async fn resolve(&self, tcp_address: u16) -> Result<Option<Mapping>>;

    /// Insert or replace the mapping for `mapping.tcp_address`
    async fn upsert(&self, mapping: Mapping) -> Result<()>;

    /// Remove a mapping. Absent keys are a no-op; returns whether a row was removed.
    async fn delete(&self, tcp_address: u16) -> Result<bool>;

    /// All mappings ordered by `tcp_address`
    async fn list(&self) -> Result<Vec<Mapping>>;
}

/// Service audit log
///
/// `record` never blocks and never fails from the caller's point of view.
pub trait AuditSink: Send + Sync + 'static {
    fn record(&self, service: &str, message: &str);
}

/// Audit sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _service: &str, _message: &str) {}
}
