//! `PostgreSQL` outbox store.
//!
//! Implements [`OutboxStore`] on two tables:
//!
//! - `aggregates`: one JSON state document per `(aggregate_type, aggregate_id)`
//! - `outbox_events`: one row per domain event, with the relay's lease, retry
//!   and terminal-state columns
//!
//! Both are written in one transaction by [`commit`](OutboxStore::commit).
//! Relay workers lease rows with `FOR UPDATE SKIP LOCKED`, so any number of
//! workers can share the table without handing the same row to two of them.
//! A row is not claimable while an earlier row of its aggregate is backing off
//! or leased by a live worker; claims take a transaction-scoped advisory lock
//! so that check sees every lease taken before it.
//!
//! # Example
//!
//! ```ignore
//! use outbox_postgres::PostgresOutboxStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresOutboxStore::new("postgres://localhost/orders", 10).await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use outbox_core::outbox::{
    AtomicWrite, ClaimRequest, OutboxError, OutboxRecord, OutboxStore, RecordOutcome,
    ResolvedRecord,
};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

const RECORD_COLUMNS: &str = "id, aggregate_id, aggregate_type, event_type, payload, occurred_at, \
     position, published_at, dead_lettered_at, dead_letter_topic, retry_count, next_attempt_at, \
     locked_at, locked_by, error";

/// Transaction-scoped advisory lock taken by every claim.
const CLAIM_LOCK_KEY: i64 = 0x6f75_7462_6f78;

/// Row shape of `outbox_events`.
#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: Uuid,
    aggregate_id: String,
    aggregate_type: String,
    event_type: String,
    payload: serde_json::Value,
    occurred_at: DateTime<Utc>,
    position: i64,
    published_at: Option<DateTime<Utc>>,
    dead_lettered_at: Option<DateTime<Utc>>,
    dead_letter_topic: Option<String>,
    retry_count: i32,
    next_attempt_at: Option<DateTime<Utc>>,
    locked_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    error: Option<String>,
}

impl From<OutboxRow> for OutboxRecord {
    fn from(row: OutboxRow) -> Self {
        Self {
            id: row.id,
            aggregate_id: row.aggregate_id,
            aggregate_type: row.aggregate_type,
            event_type: row.event_type,
            payload: row.payload,
            occurred_at: row.occurred_at,
            position: row.position,
            published_at: row.published_at,
            dead_lettered_at: row.dead_lettered_at,
            dead_letter_topic: row.dead_letter_topic,
            retry_count: row.retry_count,
            next_attempt_at: row.next_attempt_at,
            locked_at: row.locked_at,
            locked_by: row.locked_by,
            error: row.error,
        }
    }
}

fn db_error(context: &str) -> impl FnOnce(sqlx::Error) -> OutboxError + '_ {
    move |e| OutboxError::DatabaseError(format!("{context}: {e}"))
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// PostgreSQL-backed [`OutboxStore`].
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Clone, Debug)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Connect a new pool to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the connection fails.
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self, OutboxError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(db_error("Failed to connect"))?;
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `aggregates` and `outbox_events` tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), OutboxError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| OutboxError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    async fn commit_write(&self, write: AtomicWrite) -> Result<(), OutboxError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to start transaction"))?;

        sqlx::query(
            r"
            INSERT INTO aggregates (aggregate_type, aggregate_id, state, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (aggregate_type, aggregate_id)
            DO UPDATE SET state = EXCLUDED.state, updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(&write.state.aggregate_type)
        .bind(&write.state.aggregate_id)
        .bind(&write.state.state)
        .bind(write.state.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to save aggregate state"))?;

        for record in &write.records {
            sqlx::query(
                r"
                INSERT INTO outbox_events
                    (id, aggregate_id, aggregate_type, event_type, payload, occurred_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ",
            )
            .bind(record.id)
            .bind(&record.aggregate_id)
            .bind(&record.aggregate_type)
            .bind(&record.event_type)
            .bind(&record.payload)
            .bind(record.occurred_at)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to insert outbox record"))?;
        }

        // Dropping the transaction on any error above rolls it back.
        tx.commit()
            .await
            .map_err(db_error("Failed to commit transaction"))?;

        tracing::debug!(
            aggregate_type = %write.state.aggregate_type,
            aggregate_id = %write.state.aggregate_id,
            records = write.records.len(),
            "Saved aggregate with outbox records"
        );
        Ok(())
    }

    async fn load(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Option<serde_json::Value>, OutboxError> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            "SELECT state FROM aggregates WHERE aggregate_type = $1 AND aggregate_id = $2",
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to load aggregate state"))?;
        Ok(row.map(|(state,)| state))
    }

    async fn claim(&self, request: ClaimRequest) -> Result<Vec<OutboxRecord>, OutboxError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to start transaction"))?;

        // Claims run one at a time so a row skipped while another claim holds
        // it still counts as unfinished for the ordering check below.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(CLAIM_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to serialize claim"))?;

        // A record is held back while an earlier record of its aggregate is
        // backing off or leased by a live worker.
        let query = format!(
            r"
            WITH candidates AS (
                SELECT id FROM outbox_events o
                WHERE o.published_at IS NULL
                  AND o.dead_lettered_at IS NULL
                  AND (o.next_attempt_at IS NULL OR o.next_attempt_at <= $1)
                  AND (o.locked_at IS NULL OR o.locked_at < $2)
                  AND NOT EXISTS (
                      SELECT 1 FROM outbox_events p
                      WHERE p.aggregate_type = o.aggregate_type
                        AND p.aggregate_id = o.aggregate_id
                        AND p.published_at IS NULL
                        AND p.dead_lettered_at IS NULL
                        AND (p.occurred_at, p.position) < (o.occurred_at, o.position)
                        AND (p.next_attempt_at > $1 OR p.locked_at >= $2)
                  )
                ORDER BY o.occurred_at, o.position
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_events o
            SET locked_at = $1, locked_by = $4
            FROM candidates c
            WHERE o.id = c.id
            RETURNING {RECORD_COLUMNS}
            "
        );
        let rows: Vec<OutboxRow> = sqlx::query_as(&query)
            .bind(request.now)
            .bind(request.stale_before())
            .bind(sql_limit(request.batch_size))
            .bind(&request.worker_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_error("Failed to claim outbox batch"))?;

        tx.commit()
            .await
            .map_err(db_error("Failed to commit claim"))?;

        // RETURNING does not preserve the CTE's order.
        let mut records: Vec<OutboxRecord> = rows.into_iter().map(OutboxRecord::from).collect();
        records.sort_by_key(|r| (r.occurred_at, r.position));
        Ok(records)
    }

    async fn resolve_batch(
        &self,
        worker_id: &str,
        outcomes: &[ResolvedRecord],
    ) -> Result<usize, OutboxError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to start transaction"))?;

        let mut updated = 0u64;
        for resolved in outcomes {
            updated += Self::resolve_one(&mut tx, worker_id, resolved).await?;
        }

        tx.commit()
            .await
            .map_err(db_error("Failed to commit resolutions"))?;
        Ok(usize::try_from(updated).unwrap_or(usize::MAX))
    }

    async fn resolve_one(
        tx: &mut Transaction<'_, Postgres>,
        worker_id: &str,
        resolved: &ResolvedRecord,
    ) -> Result<u64, OutboxError> {
        let query = match &resolved.outcome {
            RecordOutcome::Published => sqlx::query(
                r"
                UPDATE outbox_events
                SET published_at = $3, error = NULL, locked_at = NULL, locked_by = NULL
                WHERE id = $1 AND locked_by = $2
                  AND published_at IS NULL AND dead_lettered_at IS NULL
                ",
            )
            .bind(resolved.id)
            .bind(worker_id)
            .bind(resolved.resolved_at),
            RecordOutcome::Retry {
                next_attempt_at,
                error,
            } => sqlx::query(
                r"
                UPDATE outbox_events
                SET retry_count = retry_count + 1, next_attempt_at = $3, error = $4,
                    locked_at = NULL, locked_by = NULL
                WHERE id = $1 AND locked_by = $2
                  AND published_at IS NULL AND dead_lettered_at IS NULL
                ",
            )
            .bind(resolved.id)
            .bind(worker_id)
            .bind(*next_attempt_at)
            .bind(error.as_str()),
            RecordOutcome::DeadLettered {
                topic,
                error,
                failed_attempt,
            } => sqlx::query(
                r"
                UPDATE outbox_events
                SET retry_count = retry_count + $4, dead_lettered_at = $3, published_at = $3,
                    dead_letter_topic = $5, error = $6, locked_at = NULL, locked_by = NULL
                WHERE id = $1 AND locked_by = $2
                  AND published_at IS NULL AND dead_lettered_at IS NULL
                ",
            )
            .bind(resolved.id)
            .bind(worker_id)
            .bind(resolved.resolved_at)
            .bind(i32::from(*failed_attempt))
            .bind(topic.as_str())
            .bind(error.as_str()),
            RecordOutcome::Deferred { next_attempt_at } => sqlx::query(
                r"
                UPDATE outbox_events
                SET next_attempt_at = $3, locked_at = NULL, locked_by = NULL
                WHERE id = $1 AND locked_by = $2
                  AND published_at IS NULL AND dead_lettered_at IS NULL
                ",
            )
            .bind(resolved.id)
            .bind(worker_id)
            .bind(*next_attempt_at),
        };

        let result = query
            .execute(&mut **tx)
            .await
            .map_err(db_error("Failed to resolve outbox record"))?;
        Ok(result.rows_affected())
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<OutboxRecord>, OutboxError> {
        let query = format!("SELECT {RECORD_COLUMNS} FROM outbox_events WHERE id = $1");
        let row: Option<OutboxRow> = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to fetch outbox record"))?;
        Ok(row.map(OutboxRecord::from))
    }

    async fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM outbox_events \
             WHERE published_at IS NULL AND dead_lettered_at IS NULL \
             ORDER BY occurred_at, position LIMIT $1"
        );
        let rows: Vec<OutboxRow> = sqlx::query_as(&query)
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to list pending outbox records"))?;
        Ok(rows.into_iter().map(OutboxRecord::from).collect())
    }
}

impl OutboxStore for PostgresOutboxStore {
    fn commit(
        &self,
        write: AtomicWrite,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        Box::pin(self.commit_write(write))
    }

    fn load_state(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<serde_json::Value>, OutboxError>> + Send + '_>>
    {
        let aggregate_type = aggregate_type.to_string();
        let aggregate_id = aggregate_id.to_string();
        Box::pin(async move { self.load(&aggregate_type, &aggregate_id).await })
    }

    fn claim_batch(
        &self,
        request: ClaimRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRecord>, OutboxError>> + Send + '_>> {
        Box::pin(self.claim(request))
    }

    fn resolve(
        &self,
        worker_id: &str,
        outcomes: Vec<ResolvedRecord>,
    ) -> Pin<Box<dyn Future<Output = Result<usize, OutboxError>> + Send + '_>> {
        let worker_id = worker_id.to_string();
        Box::pin(async move { self.resolve_batch(&worker_id, &outcomes).await })
    }

    fn get(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OutboxRecord>, OutboxError>> + Send + '_>> {
        Box::pin(self.fetch(id))
    }

    fn list_pending(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRecord>, OutboxError>> + Send + '_>> {
        Box::pin(self.pending(limit))
    }
}
