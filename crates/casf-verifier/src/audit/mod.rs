//! Append-only, hash-chained audit trail.
//!
//! Every terminal decision the gateway returns is recorded here (replay
//! hits excepted; their original turn already was). Appends serialize
//! globally across all workers and all gateway instances via the
//! database's advisory lock, never a process-local mutex, so `prev_hash`
//! chaining reflects one total insertion order however the fleet scales.

mod postgres;

pub use postgres::PostgresAuditStore;

use async_trait::async_trait;
use thiserror::Error;

use casf_core::types::{AuditDraft, AuditEvent};

/// Advisory-lock key serializing all audit writers on one database.
pub const AUDIT_LOCK_KEY: i64 = 42;

/// Effective budget for one append, lock wait included.
pub const AUDIT_TIMEOUT_MS: u64 = 2_000;

/// Errors from the audit store. Whatever the cause (connection loss,
/// unique-constraint violation on `event_id`/`hash`, timeout), the
/// orchestrator surfaces it as `Audit_Unavailable` and denies.
#[derive(Debug, Error)]
pub enum AuditError {
    /// No connection could be checked out of the pool.
    #[error("audit connection unavailable: {0}")]
    Pool(String),

    /// The database rejected the transaction.
    #[error("audit database error: {0}")]
    Database(#[from] ::postgres::Error),

    /// The blocking append task was cancelled or panicked.
    #[error("audit append task failed")]
    TaskFailed,

    /// The append exceeded its effective budget.
    #[error("audit append timed out")]
    Timeout,
}

/// Seam for the audit trail.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Appends one event, assigning `event_id`, `ts`, `prev_hash`, and
    /// `hash` under the global serialization lock.
    async fn append(&self, draft: AuditDraft) -> Result<AuditEvent, AuditError>;

    /// Readiness probe for the backing database.
    async fn ping(&self) -> Result<(), AuditError>;
}
