//! Calendar cursor store.
//!
//! The provider's subscription metadata mirrors the cursor for visibility,
//! but this table is the source of truth: renewals read `last_day` from here
//! first, and cancellation reads the recorded order ids from here even when
//! the metadata mirror was never written (e.g. the provider update failed).

use anyhow::Context;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use postcards_core::{DayOfYear, SubscriptionId};
use postcards_fulfillment::service::PlacedDay;

pub(crate) async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subscription_cursor (
            subscription_id  TEXT PRIMARY KEY,
            start_day        INTEGER NOT NULL,
            last_day         INTEGER NOT NULL,
            updated_at       TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create subscription_cursor table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subscription_order (
            order_id         TEXT PRIMARY KEY,
            subscription_id  TEXT NOT NULL,
            day              INTEGER NOT NULL,
            mail_date        TEXT NOT NULL,
            placed_at        TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create subscription_order table")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_subscription_order_sub
         ON subscription_order (subscription_id)",
    )
    .execute(pool)
    .await
    .context("failed to create subscription_order index")?;

    Ok(())
}

/// SQLite-backed cursor store. Cheap to clone; shares the pool.
#[derive(Debug, Clone)]
pub struct CursorStore {
    pool: SqlitePool,
}

impl CursorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a completed batch: advance the cursor and remember every placed
    /// order, in one transaction.
    pub async fn record_batch(
        &self,
        subscription_id: &SubscriptionId,
        start_day: DayOfYear,
        last_day: DayOfYear,
        placed: &[PlacedDay],
    ) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.context("failed to begin record_batch")?;

        sqlx::query(
            r#"
            INSERT INTO subscription_cursor (subscription_id, start_day, last_day, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (subscription_id) DO UPDATE SET
                last_day = excluded.last_day,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(subscription_id.as_str())
        .bind(start_day.get() as i64)
        .bind(last_day.get() as i64)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .context("failed to upsert subscription cursor")?;

        for order in placed {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO subscription_order
                    (order_id, subscription_id, day, mail_date, placed_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(&order.order_id)
            .bind(subscription_id.as_str())
            .bind(order.day.get() as i64)
            .bind(order.mail_date.to_string())
            .bind(&now)
            .execute(&mut *tx)
            .await
            .context("failed to insert placed order")?;
        }

        tx.commit().await.context("failed to commit record_batch")?;
        tracing::debug!(
            subscription_id = %subscription_id,
            last_day = last_day.get(),
            orders = placed.len(),
            "cursor advanced"
        );
        Ok(())
    }

    /// The last mailed slot for a subscription, if one was ever recorded.
    pub async fn last_day(
        &self,
        subscription_id: &SubscriptionId,
    ) -> anyhow::Result<Option<DayOfYear>> {
        let row = sqlx::query(
            "SELECT last_day FROM subscription_cursor WHERE subscription_id = ?1",
        )
        .bind(subscription_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("failed to read subscription cursor")?;

        match row {
            None => Ok(None),
            Some(row) => {
                let day: i64 = row.get("last_day");
                Ok(Some(DayOfYear::new(day as u16)?))
            }
        }
    }

    /// Every order id recorded for a subscription, in placement order.
    pub async fn order_ids(
        &self,
        subscription_id: &SubscriptionId,
    ) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT order_id FROM subscription_order
             WHERE subscription_id = ?1
             ORDER BY placed_at ASC, day ASC",
        )
        .bind(subscription_id.as_str())
        .fetch_all(&self.pool)
        .await
        .context("failed to read recorded orders")?;

        Ok(rows.into_iter().map(|row| row.get("order_id")).collect())
    }

    /// Drop everything recorded for a subscription; used after cancellation.
    pub async fn clear(&self, subscription_id: &SubscriptionId) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.context("failed to begin clear")?;
        sqlx::query("DELETE FROM subscription_cursor WHERE subscription_id = ?1")
            .bind(subscription_id.as_str())
            .execute(&mut *tx)
            .await
            .context("failed to delete subscription cursor")?;
        sqlx::query("DELETE FROM subscription_order WHERE subscription_id = ?1")
            .bind(subscription_id.as_str())
            .execute(&mut *tx)
            .await
            .context("failed to delete recorded orders")?;
        tx.commit().await.context("failed to commit clear")?;
        Ok(())
    }
}
