//! Persistence collaborators for the gateway
//!
//! The request path only ever sees two narrow traits:
//! - [`MappingStore`]: resolve a TCP-side address to a serial slave + register
//! - [`AuditSink`]: fire-and-forget service log
//!
//! Implementations:
//! - `SqliteStore` / `AuditLogger`: production SQLite backend
//! - `MemoryMappingStore` / `MemoryAuditSink`: in-memory backend for testing
//!
//! Admin-only tables (devices, log listing) are reached through the free
//! functions in [`repository`].

pub mod audit;
pub mod error;
pub mod memory;
pub mod model;
pub mod repository;
pub mod sqlite;
pub mod traits;

pub use audit::AuditLogger;
pub use error::{Result, StoreError};
pub use memory::{MemoryAuditSink, MemoryMappingStore};
pub use model::{Device, LogRecord, Mapping};
pub use sqlite::SqliteStore;
pub use traits::{AuditSink, MappingStore, NullAuditSink};
