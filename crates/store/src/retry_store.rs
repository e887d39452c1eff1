//! Durable retry queue persisted in SQLite.
//!
//! Each failed placement is stored as one row holding the full `RetryEntry`
//! as JSON plus the columns the admin status view projects. `drain` removes
//! the rows it returns inside one transaction, so an entry is never processed
//! twice by concurrent passes.

use anyhow::Context;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use postcards_fulfillment::retry::{
    RetryEntry, RetryEntrySummary, RetryQueue, RetryQueueStatus,
};

pub(crate) async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS retry_queue (
            id           TEXT PRIMARY KEY,
            entry        TEXT NOT NULL,
            recipient    TEXT NOT NULL,
            retry_count  INTEGER NOT NULL,
            error        TEXT NOT NULL,
            created_at   TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create retry_queue table")?;
    Ok(())
}

/// SQLite-backed `RetryQueue`. Cheap to clone; shares the pool.
#[derive(Debug, Clone)]
pub struct SqliteRetryQueue {
    pool: SqlitePool,
}

impl SqliteRetryQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RetryQueue for SqliteRetryQueue {
    async fn push(&self, entry: RetryEntry) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&entry).context("failed to serialize retry entry")?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO retry_queue
                (id, entry, recipient, retry_count, error, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(payload)
        .bind(entry.recipient.full_name())
        .bind(entry.retry_count as i64)
        .bind(&entry.error)
        .bind(entry.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to insert retry entry")?;
        Ok(())
    }

    async fn drain(&self) -> anyhow::Result<Vec<RetryEntry>> {
        let mut tx = self.pool.begin().await.context("failed to begin drain")?;

        let rows = sqlx::query("SELECT id, entry FROM retry_queue ORDER BY created_at ASC")
            .fetch_all(&mut *tx)
            .await
            .context("failed to read retry queue")?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let payload: String = row.get("entry");
            match serde_json::from_str::<RetryEntry>(&payload) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    // A corrupt row would otherwise wedge the queue forever.
                    tracing::error!(id, error = %err, "dropping unreadable retry entry");
                }
            }
        }

        sqlx::query("DELETE FROM retry_queue")
            .execute(&mut *tx)
            .await
            .context("failed to clear retry queue")?;
        tx.commit().await.context("failed to commit drain")?;

        Ok(entries)
    }

    async fn status(&self) -> anyhow::Result<RetryQueueStatus> {
        let rows = sqlx::query(
            "SELECT entry FROM retry_queue ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to read retry queue status")?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.get("entry");
            if let Ok(entry) = serde_json::from_str::<RetryEntry>(&payload) {
                entries.push(RetryEntrySummary::of(&entry));
            }
        }

        Ok(RetryQueueStatus {
            queue_size: entries.len(),
            entries,
        })
    }
}
