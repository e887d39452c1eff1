//! `postcards-store` — SQLite durability for the fulfillment pipeline.
//!
//! Two concerns live here: the durable retry queue (failed placements must
//! survive a restart) and the calendar cursor store (the source of truth for
//! where each subscription's walk through the 365-slot rotation stands).

use std::str::FromStr;

use anyhow::Context;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;

pub mod cursor;
pub mod retry_store;

pub use cursor::CursorStore;
pub use retry_store::SqliteRetryQueue;

/// Open (or create) the fulfillment database at `path` and run migrations.
pub async fn open_database(path: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(path)
        .with_context(|| format!("invalid sqlite path {path:?}"))?
        .create_if_missing(true);

    let pool = SqlitePool::connect_with(options)
        .await
        .with_context(|| format!("failed to open sqlite database at {path:?}"))?;

    retry_store::migrate(&pool).await?;
    cursor::migrate(&pool).await?;
    tracing::info!(path, "fulfillment database ready");
    Ok(pool)
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    retry_store::migrate(&pool).await.unwrap();
    cursor::migrate(&pool).await.unwrap();
    pool
}
