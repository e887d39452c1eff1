//! `postcards-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives for the postcard
//! fulfillment platform (no HTTP, no storage, no clock beyond `Utc::now`).

pub mod calendar;
pub mod error;
pub mod invoice;
pub mod recipient;
pub mod subscription;

pub use calendar::{CALENDAR_DAYS, DayOfYear};
pub use error::{DomainError, DomainResult};
pub use invoice::Invoice;
pub use recipient::{Customer, Recipient};
pub use subscription::{BillingCycle, BillingInterval, IntervalUnit, Subscription, SubscriptionId};
