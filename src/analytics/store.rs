use crate::events::Event;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use std::fmt;
use tracing::warn;

/// Sentinel `rule_id` for traffic decided by the global fallback limiter.
pub const GLOBAL_RULE_ID: &str = "_global";

#[derive(Debug)]
pub struct AnalyticsError(pub String);

impl fmt::Display for AnalyticsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "analytics store: {}", self.0)
    }
}

impl std::error::Error for AnalyticsError {}

/// Time-series destination for request events.
///
/// `write_batch` runs the whole batch in one transaction. An error means the
/// transaction could not begin or commit and the entire batch is unwritten;
/// `Ok(n)` reports the rows that made it in (individual row failures are
/// skipped, not fatal).
#[async_trait]
pub trait AnalyticsStore: Send + Sync + 'static {
    async fn write_batch(&self, events: &[Event]) -> Result<usize, AnalyticsError>;
}

fn rule_id(event: &Event) -> &str {
    if event.rule_name.is_empty() {
        GLOBAL_RULE_ID
    } else {
        &event.rule_name
    }
}

/// Postgres/TimescaleDB writer. The `request_events` table is partitioned by
/// `ts`; creating and migrating it belongs to the migration runner, not the
/// gateway.
pub struct PgAnalyticsStore {
    pool: PgPool,
}

const INSERT_EVENT: &str = "INSERT INTO request_events \
    (ts, client_id, method, path, allowed, rule_id, limit_value, remaining, status, response_ms) \
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)";

impl PgAnalyticsStore {
    /// Connect lazily: a down database does not block startup, it only makes
    /// flushes fail (and drop) until it recovers.
    pub fn connect_lazy(url: &str, max_connections: u32) -> Result<Self, AnalyticsError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)
            .map_err(|e| AnalyticsError(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl AnalyticsStore for PgAnalyticsStore {
    async fn write_batch(&self, events: &[Event]) -> Result<usize, AnalyticsError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AnalyticsError(format!("begin: {e}")))?;

        let mut inserted = 0usize;
        for event in events {
            // A failed INSERT aborts the whole Postgres transaction (25P02),
            // so each row runs under its own savepoint; rolling back to it
            // skips the row without losing the batch. Savepoint commands go
            // through the simple query protocol, they cannot be prepared.
            (&mut *tx)
                .execute("SAVEPOINT row_insert")
                .await
                .map_err(|e| AnalyticsError(format!("savepoint: {e}")))?;

            let res = sqlx::query(INSERT_EVENT)
                .bind(event.timestamp)
                .bind(&event.client_id)
                .bind(&event.method)
                .bind(&event.path)
                .bind(event.allowed)
                .bind(rule_id(event))
                .bind(event.limit)
                .bind(event.remaining)
                .bind(event.status as i32)
                .bind(event.response_ms)
                .execute(&mut *tx)
                .await;

            match res {
                Ok(_) => {
                    (&mut *tx)
                        .execute("RELEASE SAVEPOINT row_insert")
                        .await
                        .map_err(|e| AnalyticsError(format!("release savepoint: {e}")))?;
                    inserted += 1;
                }
                Err(e) => {
                    warn!(
                        "analytics: row insert failed, skipping, path={}, error={}",
                        event.path, e
                    );
                    (&mut *tx)
                        .execute("ROLLBACK TO SAVEPOINT row_insert")
                        .await
                        .map_err(|e| AnalyticsError(format!("rollback savepoint: {e}")))?;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| AnalyticsError(format!("commit: {e}")))?;
        Ok(inserted)
    }
}

/// Discards everything. Stands in for the Postgres writer when analytics is
/// disabled so the sink machinery stays identical either way.
pub struct NoopAnalyticsStore;

#[async_trait]
impl AnalyticsStore for NoopAnalyticsStore {
    async fn write_batch(&self, events: &[Event]) -> Result<usize, AnalyticsError> {
        Ok(events.len())
    }
}
