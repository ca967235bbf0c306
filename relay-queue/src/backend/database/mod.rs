//! SQLite-backed FIFO queue.
//!
//! Claiming is one `UPDATE ... RETURNING` statement that picks the oldest
//! unclaimed, eligible row and stamps its `start_time`, so concurrent workers
//! can never claim the same row. The claim timestamp doubles as the claim token:
//! acknowledgements only touch the row while it still carries that stamp.

pub mod reaper;

pub use reaper::ClaimReaper;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::{
    backend::{BoxedHandle, QueueBackend},
    handle::{tolerate_ack, HandleCore, QueueHandle},
    types::clock::{after, from_millis, to_millis},
    Clock, JobError, JobId, JobRecord, JobRegistry, QueueError, QueueResult,
};

/// Options of a `database` connection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseOptions {
    /// Used only when no shared pool was handed to the manager
    pub url: Option<String>,
    pub table: String,
    pub max_connections: u32,
    /// Seconds after which a claim is returned to the backlog by the reaper
    pub claim_timeout: Option<f64>,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            url: None,
            table: "relay_jobs".to_string(),
            max_connections: 5,
            claim_timeout: None,
        }
    }
}

impl DatabaseOptions {
    /// Open a lazily-connecting pool from `url`
    pub fn lazy_pool(&self) -> QueueResult<SqlitePool> {
        let url = self.url.as_deref().ok_or_else(|| {
            QueueError::Configuration(
                "database connection needs either a shared pool or a `url`".to_string(),
            )
        })?;

        SqlitePoolOptions::new()
            .max_connections(self.max_connections.max(1))
            .connect_lazy(url)
            .map_err(|e| QueueError::Configuration(format!("invalid database url {}: {}", url, e)))
    }

    pub fn claim_timeout(&self) -> Option<Duration> {
        self.claim_timeout
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
    }
}

pub(crate) struct DatabaseInner {
    pub(crate) pool: SqlitePool,
    pub(crate) table: String,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) claim_timeout: Option<Duration>,
    registry: Arc<JobRegistry>,
    schema: OnceCell<()>,
    connected: AtomicBool,
}

/// Queue stored in a table of a (possibly shared) SQLite pool
#[derive(Clone)]
pub struct DatabaseQueue {
    pub(crate) inner: Arc<DatabaseInner>,
}

impl DatabaseQueue {
    pub fn new(
        pool: SqlitePool,
        table: impl Into<String>,
        registry: Arc<JobRegistry>,
        clock: Arc<dyn Clock>,
    ) -> QueueResult<Self> {
        let table = table.into();
        validate_table_name(&table)?;

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                pool,
                table,
                clock,
                claim_timeout: None,
                registry,
                schema: OnceCell::new(),
                connected: AtomicBool::new(false),
            }),
        })
    }

    /// Build from connection options, preferring a shared pool
    pub fn from_options(
        options: &DatabaseOptions,
        shared_pool: Option<SqlitePool>,
        registry: Arc<JobRegistry>,
        clock: Arc<dyn Clock>,
    ) -> QueueResult<Self> {
        let pool = match shared_pool {
            Some(pool) => pool,
            None => options.lazy_pool()?,
        };

        let queue = Self::new(pool, options.table.clone(), registry, clock)?;
        Ok(match options.claim_timeout() {
            Some(timeout) => queue.with_claim_timeout(timeout),
            None => queue,
        })
    }

    /// Let [`DatabaseQueue::reap_expired_claims`] recover claims older than `timeout`
    ///
    /// Must be called before the queue is shared.
    pub fn with_claim_timeout(self, timeout: Duration) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.claim_timeout = Some(timeout);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                warn!("Claim timeout ignored: queue table {} is already shared", inner.table);
                Self { inner }
            }
        }
    }

    pub fn table(&self) -> &str {
        &self.inner.table
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.inner.pool
    }

    pub fn claim_timeout(&self) -> Option<Duration> {
        self.inner.claim_timeout
    }

    fn ensure_connected(&self) -> QueueResult<()> {
        if self.inner.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(QueueError::Connection(format!(
                "database queue {} is not connected",
                self.inner.table
            )))
        }
    }

    async fn create_schema(&self) -> QueueResult<()> {
        let table = &self.inner.table;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                payload TEXT NOT NULL,
                job_class_name TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                not_before INTEGER NOT NULL,
                created_on INTEGER NOT NULL,
                start_time INTEGER NULL
            )"
        ))
        .execute(&self.inner.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}_claim_idx ON {table} (queue, start_time, created_on)"
        ))
        .execute(&self.inner.pool)
        .await?;

        Ok(())
    }

    /// Return claims older than the claim timeout to the backlog
    ///
    /// Each recovered record counts as released back: `attempts + 1`, eligible
    /// immediately. Returns the number of recovered records.
    pub async fn reap_expired_claims(&self) -> QueueResult<u64> {
        let Some(timeout) = self.inner.claim_timeout else {
            return Ok(0);
        };
        self.ensure_connected()?;

        let now = self.inner.clock.now();
        let cutoff = to_millis(now).saturating_sub(i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX));

        let result = sqlx::query(&format!(
            "UPDATE {} SET start_time = NULL, attempts = attempts + 1, not_before = ?1
             WHERE start_time IS NOT NULL AND start_time <= ?2",
            self.inner.table
        ))
        .bind(to_millis(now))
        .bind(cutoff)
        .execute(&self.inner.pool)
        .await?;

        Ok(result.rows_affected())
    }

    fn record_from_row(row: &SqliteRow) -> QueueResult<(JobRecord, i64)> {
        let id: i64 = row.try_get("id")?;
        let raw_payload: String = row.try_get("payload")?;
        let attempts: i64 = row.try_get("attempts")?;
        let start_time: i64 = row.try_get("start_time")?;

        let payload: Value = serde_json::from_str(&raw_payload)?;
        let record = JobRecord {
            id: JobId::from(id),
            job_name: row.try_get("job_class_name")?,
            payload,
            queue: row.try_get("queue")?,
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
            not_before: from_millis(row.try_get("not_before")?),
            created_at: from_millis(row.try_get("created_on")?),
        };

        Ok((record, start_time))
    }
}

fn validate_table_name(table: &str) -> QueueResult<()> {
    let valid = !table.is_empty()
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !table.starts_with(|c: char| c.is_ascii_digit());

    if valid {
        Ok(())
    } else {
        Err(QueueError::Configuration(format!("invalid queue table name `{}`", table)))
    }
}

#[async_trait]
impl QueueBackend for DatabaseQueue {
    fn driver(&self) -> &'static str {
        "database"
    }

    async fn connect(&self) -> QueueResult<()> {
        self.inner
            .schema
            .get_or_try_init(|| async {
                self.create_schema().await?;
                info!("Database queue ready on table {}", self.inner.table);
                Ok::<(), QueueError>(())
            })
            .await?;

        self.inner.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> QueueResult<()> {
        // The pool belongs to whoever handed it over; only our bookkeeping changes.
        self.inner.connected.store(false, Ordering::Release);
        debug!("Database queue on table {} disconnected", self.inner.table);
        Ok(())
    }

    async fn push(&self, job_name: &str, payload: Value, queue: &str) -> QueueResult<JobId> {
        self.ensure_connected()?;
        let now = to_millis(self.inner.clock.now());

        let result = sqlx::query(&format!(
            "INSERT INTO {} (queue, payload, job_class_name, attempts, not_before, created_on, start_time)
             VALUES (?1, ?2, ?3, 0, ?4, ?4, NULL)",
            self.inner.table
        ))
        .bind(queue)
        .bind(serde_json::to_string(&payload)?)
        .bind(job_name)
        .bind(now)
        .execute(&self.inner.pool)
        .await?;

        Ok(JobId::from(result.last_insert_rowid()))
    }

    async fn pop(&self, queue: &str) -> QueueResult<Option<BoxedHandle>> {
        self.ensure_connected()?;
        let table = &self.inner.table;
        let now = to_millis(self.inner.clock.now());

        let row = sqlx::query(&format!(
            "UPDATE {table} SET start_time = ?1
             WHERE start_time IS NULL AND id = (
                SELECT id FROM {table}
                WHERE queue = ?2 AND start_time IS NULL AND not_before <= ?1
                ORDER BY created_on ASC, id ASC
                LIMIT 1
             )
             RETURNING id, queue, payload, job_class_name, attempts, not_before, created_on, start_time"
        ))
        .bind(now)
        .bind(queue)
        .fetch_optional(&self.inner.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        match Self::record_from_row(&row) {
            Ok((record, claimed_at)) => {
                let handle: BoxedHandle = Box::new(DatabaseJobHandle {
                    core: HandleCore::new(record, self.inner.registry.clone()),
                    queue: self.clone(),
                    claimed_at,
                });
                Ok(Some(handle))
            }
            Err(e) => {
                let id: i64 = row.try_get("id").unwrap_or_default();
                error!("Discarding unreadable job record {} from {}: {}", id, queue, e);
                sqlx::query(&format!("DELETE FROM {table} WHERE id = ?1"))
                    .bind(id)
                    .execute(&self.inner.pool)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn size(&self, queue: &str) -> QueueResult<u64> {
        self.ensure_connected()?;
        let now = to_millis(self.inner.clock.now());

        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE queue = ?1 AND start_time IS NULL AND not_before <= ?2",
            self.inner.table
        ))
        .bind(queue)
        .bind(now)
        .fetch_one(&self.inner.pool)
        .await?;

        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn clear(&self, queue: &str) -> QueueResult<()> {
        self.ensure_connected()?;

        sqlx::query(&format!("DELETE FROM {} WHERE queue = ?1", self.inner.table))
            .bind(queue)
            .execute(&self.inner.pool)
            .await?;
        Ok(())
    }
}

/// Handle for a row claimed from a [`DatabaseQueue`]
pub struct DatabaseJobHandle {
    core: HandleCore,
    queue: DatabaseQueue,
    claimed_at: i64,
}

impl DatabaseJobHandle {
    fn stale(&self) -> QueueError {
        QueueError::StaleClaim(format!(
            "row {} in {} is no longer claimed by this handle",
            self.id(),
            self.queue.inner.table
        ))
    }

    fn row_id(&self) -> QueueResult<i64> {
        self.id()
            .as_str()
            .parse()
            .map_err(|_| QueueError::Internal(format!("non-numeric database job id {}", self.id())))
    }

    async fn delete_claimed(&self) -> QueueResult<()> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE id = ?1 AND start_time = ?2",
            self.queue.inner.table
        ))
        .bind(self.row_id()?)
        .bind(self.claimed_at)
        .execute(&self.queue.inner.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.stale());
        }
        Ok(())
    }

    async fn requeue(&self, delay: Duration) -> QueueResult<()> {
        let inner = &self.queue.inner;
        let record = self.core.record();
        let now = inner.clock.now();
        let not_before = after(now, delay);

        let mut tx = inner.pool.begin().await?;

        let removed = sqlx::query(&format!(
            "DELETE FROM {} WHERE id = ?1 AND start_time = ?2",
            inner.table
        ))
        .bind(self.row_id()?)
        .bind(self.claimed_at)
        .execute(&mut *tx)
        .await?;

        if removed.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self.stale());
        }

        sqlx::query(&format!(
            "INSERT INTO {} (queue, payload, job_class_name, attempts, not_before, created_on, start_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)",
            inner.table
        ))
        .bind(&record.queue)
        .bind(serde_json::to_string(&record.payload)?)
        .bind(&record.job_name)
        .bind(i64::from(record.attempts) + 1)
        .bind(to_millis(not_before))
        .bind(to_millis(now))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl QueueHandle for DatabaseJobHandle {
    fn core(&self) -> &HandleCore {
        &self.core
    }

    async fn fire(&self) -> Result<(), JobError> {
        self.core.fire(self).await
    }

    async fn delete(&self) -> QueueResult<()> {
        if !self.core.mark_deleted() {
            return Ok(());
        }
        tolerate_ack(self.id(), "delete", self.delete_claimed().await)
    }

    async fn release_back(&self, delay: Duration) -> QueueResult<()> {
        self.core.mark_released()?;
        tolerate_ack(self.id(), "release", self.requeue(delay).await)
    }
}
