//! Retry queue for failed order placements.
//!
//! A failed placement becomes a `RetryEntry` that carries everything needed
//! to resubmit the order later. Entries get three attempts; after that they
//! are dropped with a single admin escalation. The queue itself sits behind
//! the `RetryQueue` trait so it can be backed by memory (tests) or SQLite
//! (production, surviving restarts).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use postcards_core::Recipient;

use crate::client::OrderOptions;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Everything needed to retry one failed order placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEntry {
    pub id: Uuid,
    pub recipient: Recipient,
    pub design_id: i64,
    pub options: OrderOptions,
    /// Last error seen for this entry.
    pub error: String,
    /// Attempts already made, the original placement included.
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
}

impl RetryEntry {
    pub fn new(
        recipient: Recipient,
        design_id: i64,
        options: OrderOptions,
        error: String,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            recipient,
            design_id,
            options,
            error,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: Utc::now(),
        }
    }

    /// True once the entry has used up all its attempts.
    pub fn exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Snapshot of the queue for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct RetryQueueStatus {
    pub queue_size: usize,
    pub entries: Vec<RetryEntrySummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryEntrySummary {
    pub recipient: String,
    pub retry_count: u32,
    pub error: String,
    pub created_at: DateTime<Utc>,
}

impl RetryEntrySummary {
    pub fn of(entry: &RetryEntry) -> Self {
        Self {
            recipient: entry.recipient.full_name(),
            retry_count: entry.retry_count,
            error: entry.error.clone(),
            created_at: entry.created_at,
        }
    }
}

#[async_trait]
pub trait RetryQueue: Send + Sync {
    async fn push(&self, entry: RetryEntry) -> anyhow::Result<()>;

    /// Remove and return every queued entry. Entries that fail again are
    /// pushed back by the caller with an incremented count.
    async fn drain(&self) -> anyhow::Result<Vec<RetryEntry>>;

    async fn status(&self) -> anyhow::Result<RetryQueueStatus>;
}

/// Process-local queue. Loses entries on restart; tests and demo mode only.
#[derive(Debug, Default)]
pub struct InMemoryRetryQueue {
    entries: std::sync::Mutex<Vec<RetryEntry>>,
}

#[async_trait]
impl RetryQueue for InMemoryRetryQueue {
    async fn push(&self, entry: RetryEntry) -> anyhow::Result<()> {
        self.entries
            .lock()
            .map_err(|_| anyhow::anyhow!("retry queue mutex poisoned"))?
            .push(entry);
        Ok(())
    }

    async fn drain(&self) -> anyhow::Result<Vec<RetryEntry>> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("retry queue mutex poisoned"))?;
        Ok(std::mem::take(&mut *entries))
    }

    async fn status(&self) -> anyhow::Result<RetryQueueStatus> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("retry queue mutex poisoned"))?;
        Ok(RetryQueueStatus {
            queue_size: entries.len(),
            entries: entries.iter().map(RetryEntrySummary::of).collect(),
        })
    }
}
