//! `postcards-fulfillment` — the subscription-to-mailing-schedule core.
//!
//! Maps a paid subscription's billing cycle onto the 365-slot content
//! calendar, places one fulfillment order per day against the PostcardMania
//! DirectMail API, tracks the rolling calendar cursor across renewals, and
//! reconciles cancellations. Failed placements go through a
//! three-strikes-then-escalate retry queue.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod notify;
pub mod retry;
pub mod service;

pub use cache::Cached;
pub use client::{
    AddressCheck, Design, FulfillmentApi, OrderOptions, PcmClient, PlacedOrder,
};
pub use config::{PcmConfig, ReturnAddressConfig};
pub use error::FulfillmentError;
pub use notify::{AdminNotifier, LogNotifier};
pub use retry::{InMemoryRetryQueue, RetryEntry, RetryQueue, RetryQueueStatus};
pub use service::{
    BatchOutcome, CancellationOutcome, ConnectionStatus, FailedDay, FulfillmentConfig,
    FulfillmentService, PlacedDay, RetryReport, ScheduleOutcome, ScheduleReport,
};
