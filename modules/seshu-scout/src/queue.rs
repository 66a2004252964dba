//! Single-lane hand-off queue between pipeline stages.
//!
//! Publish appends, peek reads the head without removing it, consume drops the
//! head. There is no retry policy here: callers re-publish on failure.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use seshu_common::error::Result;
use seshu_common::SeshuError;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::OnceCell;
use tracing::info;

use crate::store::validate_table_name;

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn publish(&self, payload: &Value) -> Result<()>;

    async fn peek_top(&self) -> Result<Option<Value>>;

    /// Drop the head entry. Returns false when the queue was already empty.
    async fn consume(&self) -> Result<bool>;

    /// Drop every pending entry. Returns how many were dropped.
    async fn purge(&self) -> Result<u64>;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryQueue {
    entries: Mutex<VecDeque<Value>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, VecDeque<Value>>> {
        self.entries
            .lock()
            .map_err(|_| SeshuError::Storage("queue lock poisoned".into()))
    }
}

#[async_trait]
impl WorkQueue for InMemoryQueue {
    async fn publish(&self, payload: &Value) -> Result<()> {
        self.lock()?.push_back(payload.clone());
        Ok(())
    }

    async fn peek_top(&self) -> Result<Option<Value>> {
        Ok(self.lock()?.front().cloned())
    }

    async fn consume(&self) -> Result<bool> {
        Ok(self.lock()?.pop_front().is_some())
    }

    async fn purge(&self) -> Result<u64> {
        let mut entries = self.lock()?;
        let n = entries.len() as u64;
        entries.clear();
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

/// One subject inside a shared queue table. The table is created on first use.
pub struct PgQueue {
    pool: PgPool,
    table: String,
    subject: String,
    provisioned: OnceCell<()>,
}

impl PgQueue {
    pub fn new(pool: PgPool, table: &str, subject: &str) -> Result<Self> {
        validate_table_name("queue", table)?;
        if subject.trim().is_empty() {
            return Err(SeshuError::Config("queue subject is empty".into()));
        }
        Ok(Self {
            pool,
            table: table.to_string(),
            subject: subject.to_string(),
            provisioned: OnceCell::new(),
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        self.provisioned
            .get_or_try_init(|| async {
                sqlx::query(&format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {t} (
                        seq BIGSERIAL PRIMARY KEY,
                        subject TEXT NOT NULL,
                        payload JSONB NOT NULL,
                        published_at TIMESTAMPTZ NOT NULL DEFAULT now()
                    )
                    "#,
                    t = self.table
                ))
                .execute(&self.pool)
                .await?;

                sqlx::query(&format!(
                    "CREATE INDEX IF NOT EXISTS {t}_subject_seq_idx ON {t} (subject, seq)",
                    t = self.table
                ))
                .execute(&self.pool)
                .await?;

                info!(table = %self.table, subject = %self.subject, "Queue provisioned");
                Ok::<(), SeshuError>(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for PgQueue {
    async fn publish(&self, payload: &Value) -> Result<()> {
        self.ensure_schema().await?;
        sqlx::query(&format!(
            "INSERT INTO {} (subject, payload) VALUES ($1, $2)",
            self.table
        ))
        .bind(&self.subject)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn peek_top(&self) -> Result<Option<Value>> {
        self.ensure_schema().await?;
        sqlx::query_scalar::<_, Value>(&format!(
            "SELECT payload FROM {} WHERE subject = $1 ORDER BY seq LIMIT 1",
            self.table
        ))
        .bind(&self.subject)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn consume(&self) -> Result<bool> {
        self.ensure_schema().await?;
        let result = sqlx::query(&format!(
            r#"
            DELETE FROM {t} WHERE seq = (
                SELECT seq FROM {t} WHERE subject = $1 ORDER BY seq LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            "#,
            t = self.table
        ))
        .bind(&self.subject)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge(&self) -> Result<u64> {
        self.ensure_schema().await?;
        let result = sqlx::query(&format!("DELETE FROM {} WHERE subject = $1", self.table))
            .bind(&self.subject)
            .execute(&self.pool)
            .await?;
        info!(subject = %self.subject, purged = result.rows_affected(), "Queue purged");
        Ok(result.rows_affected())
    }
}
