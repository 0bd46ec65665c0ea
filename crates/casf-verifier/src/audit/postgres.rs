//! Postgres-backed audit store.
//!
//! Appends run inside one transaction: take the advisory lock, read the
//! chain tail, compute the new hash, insert, commit. The lock is
//! transaction-scoped, so commit or rollback releases it; once it is held
//! the append is driven to completion synchronously and is not cancellable
//! from the async side. A `statement_timeout` on the connection bounds how
//! long any single statement (lock wait included) may take.

use async_trait::async_trait;
use postgres::NoTls;
use r2d2::Pool;
use r2d2_postgres::PostgresConnectionManager;
use uuid::Uuid;

use casf_core::canonical::canonical_json;
use casf_core::chain::compute_hash;
use casf_core::types::{utc_now_text, AuditDraft, AuditEvent};

use super::{AuditError, AuditStore, AUDIT_LOCK_KEY, AUDIT_TIMEOUT_MS};

/// Postgres audit store with a bounded connection pool.
pub struct PostgresAuditStore {
    pool: Pool<PostgresConnectionManager<NoTls>>,
}

impl PostgresAuditStore {
    /// Connects the pool and applies the audit schema idempotently.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] when the DSN does not parse, the pool cannot
    /// be built, or the schema cannot be applied.
    pub fn connect(dsn: &str) -> Result<Self, AuditError> {
        let mut pg_config = dsn
            .parse::<postgres::Config>()
            .map_err(AuditError::Database)?;
        pg_config.connect_timeout(std::time::Duration::from_millis(AUDIT_TIMEOUT_MS));
        let options = format!("-c statement_timeout={AUDIT_TIMEOUT_MS}");
        pg_config.options(&options);

        let manager = PostgresConnectionManager::new(pg_config, NoTls);
        let pool = Pool::builder()
            .max_size(8)
            .connection_timeout(std::time::Duration::from_millis(AUDIT_TIMEOUT_MS))
            .build(manager)
            .map_err(|err| AuditError::Pool(err.to_string()))?;

        let store = Self { pool };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), AuditError> {
        let mut conn = self
            .pool
            .get()
            .map_err(|err| AuditError::Pool(err.to_string()))?;
        conn.batch_execute(include_str!("schema.sql"))?;
        Ok(())
    }

    fn append_blocking(
        pool: &Pool<PostgresConnectionManager<NoTls>>,
        draft: &AuditDraft,
    ) -> Result<AuditEvent, AuditError> {
        let mut conn = pool.get().map_err(|err| AuditError::Pool(err.to_string()))?;
        let mut tx = conn.transaction()?;

        // Serialises all audit writers fleet-wide; released on COMMIT/ROLLBACK.
        tx.execute("SELECT pg_advisory_xact_lock($1)", &[&AUDIT_LOCK_KEY])?;

        let prev_hash: String = tx
            .query_opt("SELECT hash FROM audit_events ORDER BY id DESC LIMIT 1", &[])?
            .map_or_else(String::new, |row| row.get(0));

        let event_id = Uuid::new_v4();
        let ts = utc_now_text();
        let hash = compute_hash(
            &prev_hash,
            &draft.request_id,
            &event_id,
            &ts,
            &draft.actor,
            &draft.action,
            draft.decision.as_str(),
            &draft.payload,
        );

        tx.execute(
            "INSERT INTO audit_events
               (request_id, event_id, ts, actor, action, decision, payload, prev_hash, hash)
             VALUES
               ($1::uuid, $2::uuid, $3::timestamptz, $4, $5, $6, $7::jsonb, $8, $9)",
            &[
                &draft.request_id.to_string(),
                &event_id.to_string(),
                &ts,
                &draft.actor,
                &draft.action,
                &draft.decision.as_str(),
                &canonical_json(&draft.payload),
                &prev_hash,
                &hash,
            ],
        )?;
        tx.commit()?;

        Ok(AuditEvent {
            event_id,
            request_id: draft.request_id,
            ts,
            actor: draft.actor.clone(),
            action: draft.action.clone(),
            decision: draft.decision,
            payload: draft.payload.clone(),
            prev_hash,
            hash,
        })
    }

    fn ping_blocking(pool: &Pool<PostgresConnectionManager<NoTls>>) -> Result<(), AuditError> {
        let mut conn = pool.get().map_err(|err| AuditError::Pool(err.to_string()))?;
        conn.execute("SELECT 1", &[])?;
        Ok(())
    }
}

#[async_trait]
impl AuditStore for PostgresAuditStore {
    async fn append(&self, draft: AuditDraft) -> Result<AuditEvent, AuditError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || Self::append_blocking(&pool, &draft))
            .await
            .map_err(|_| AuditError::TaskFailed)?
    }

    async fn ping(&self) -> Result<(), AuditError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || Self::ping_blocking(&pool))
            .await
            .map_err(|_| AuditError::TaskFailed)?
    }
}
