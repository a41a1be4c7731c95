//! Privacy compliance for ConvoGuard: the append-only audit trail,
//! retention-driven purges and the right-to-erasure workflow.
//!
//! # Main types
//!
//! - [`AuditRecord`] — Immutable record of a consent, access, modification or deletion event.
//! - [`AuditStore`] — Insert-only audit storage ([`InMemoryAuditStore`], [`SqliteAuditStore`]).
//! - [`AuditLog`] — Fire-and-forget writer with background retry.
//! - [`RetentionPolicy`] — Per-category retention windows and the sweep that enforces them.
//! - [`DeletionRegistry`] — Erasure requests moving through their grace period.
//! - [`DeletionLedger`] — Where open erasure requests are kept ([`InMemoryDeletionLedger`], [`SqliteAuditStore`]).

/// Audit records and the storage trait.
pub mod audit;
/// Erasure request workflow.
pub mod deletion;
/// Retention windows and sweeps.
pub mod retention;
/// SQLite-backed audit store and erasure ledger.
pub mod sqlite;
/// Background audit writer.
pub mod writer;

pub use audit::{
    consent_status, AuditEventType, AuditRecord, AuditStore, InMemoryAuditStore, RetentionCategory,
};
pub use deletion::{
    DeletionLedger, DeletionRegistry, DeletionRequest, DeletionStatus, InMemoryDeletionLedger,
};
pub use retention::{sweep_audit, RetentionPolicy, SweepReport};
pub use sqlite::SqliteAuditStore;
pub use writer::{AuditLog, AuditLogConfig};
