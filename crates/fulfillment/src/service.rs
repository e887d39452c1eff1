//! Subscription-to-mailing-schedule reconciliation.
//!
//! `FulfillmentService` turns billing events into fulfillment orders: one
//! postcard per calendar slot, `duration` slots per billing period, walking
//! the 365-slot rotation with a metadata cursor so renewals pick up exactly
//! where the previous batch stopped. Per-day failures never abort a batch;
//! they land in the retry queue and the batch keeps going.

use std::collections::BTreeMap;

use chrono::{Days, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use postcards_core::subscription::meta;
use postcards_core::{Customer, DayOfYear, DomainError, Invoice, Recipient, Subscription, SubscriptionId};

use crate::cache::Cached;
use crate::client::{Design, FulfillmentApi, OrderOptions, PlacedOrder};
use crate::error::FulfillmentError;
use crate::notify::AdminNotifier;
use crate::retry::{RetryEntry, RetryQueue, RetryQueueStatus, DEFAULT_MAX_RETRIES};

/// Tunables for the scheduling loop.
#[derive(Debug, Clone)]
pub struct FulfillmentConfig {
    /// Design names are `{prefix}{day:03}`, e.g. `PP-042` for slot 42.
    pub design_prefix: String,
    /// Pause between consecutive order placements within a batch.
    pub order_delay: std::time::Duration,
    /// Pause between consecutive retry attempts.
    pub retry_delay: std::time::Duration,
    pub design_cache_ttl: chrono::Duration,
    pub max_retries: u32,
}

impl Default for FulfillmentConfig {
    fn default() -> Self {
        Self {
            design_prefix: "PP-".to_string(),
            order_delay: std::time::Duration::from_millis(100),
            retry_delay: std::time::Duration::from_secs(1),
            design_cache_ttl: chrono::Duration::hours(1),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// One successfully placed mailing.
#[derive(Debug, Clone, Serialize)]
pub struct PlacedDay {
    pub day: DayOfYear,
    pub order_id: String,
    pub mail_date: NaiveDate,
}

/// One mailing that could not be placed.
#[derive(Debug, Clone, Serialize)]
pub struct FailedDay {
    pub day: DayOfYear,
    pub mail_date: Option<NaiveDate>,
    pub error: String,
}

/// Result of walking one batch of calendar slots.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub subscription_id: SubscriptionId,
    pub successful: Vec<PlacedDay>,
    pub failed: Vec<FailedDay>,
    pub total_requested: u32,
}

impl BatchOutcome {
    pub fn order_ids(&self) -> Vec<String> {
        self.successful.iter().map(|p| p.order_id.clone()).collect()
    }

    /// Orders actually placed, as opposed to `total_requested` slots walked.
    pub fn total_ordered(&self) -> usize {
        self.successful.len()
    }
}

/// A scheduled batch plus the metadata that records its cursor.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleReport {
    pub start_day: DayOfYear,
    pub last_day: DayOfYear,
    pub batch: BatchOutcome,
    /// Key-value pairs to persist on the subscription (cursor, audit trail).
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScheduleOutcome {
    Scheduled(ScheduleReport),
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedCancellation {
    pub order_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CancellationOutcome {
    pub cancelled: Vec<String>,
    pub failed: Vec<FailedCancellation>,
}

/// One pass over the retry queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub requeued: usize,
    pub dropped: usize,
}

/// Diagnostic snapshot for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub configured: bool,
    pub authenticated: bool,
    pub design_count: Option<usize>,
    pub error: Option<String>,
}

pub struct FulfillmentService<A, N, Q> {
    api: A,
    notifier: N,
    retry_queue: Q,
    designs: Mutex<Option<Cached<Vec<Design>>>>,
    config: FulfillmentConfig,
}

impl<A, N, Q> FulfillmentService<A, N, Q>
where
    A: FulfillmentApi,
    N: AdminNotifier,
    Q: RetryQueue,
{
    pub fn new(api: A, notifier: N, retry_queue: Q, config: FulfillmentConfig) -> Self {
        Self {
            api,
            notifier,
            retry_queue,
            designs: Mutex::new(None),
            config,
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// The design catalog, served from cache while fresh. On refresh failure
    /// a stale catalog is served rather than failing the caller.
    pub async fn all_designs(&self, force_refresh: bool) -> Result<Vec<Design>, FulfillmentError> {
        let mut cached = self.designs.lock().await;

        if !force_refresh {
            if let Some(entry) = cached.as_ref() {
                if entry.is_valid(Utc::now()) {
                    return Ok(entry.value().clone());
                }
            }
        }

        match self.api.list_designs().await {
            Ok(designs) => {
                tracing::debug!(count = designs.len(), "refreshed design catalog");
                *cached = Some(Cached::with_ttl(designs.clone(), self.config.design_cache_ttl));
                Ok(designs)
            }
            Err(err) => {
                if let Some(stale) = cached.as_ref() {
                    tracing::warn!(error = %err, "design refresh failed, serving stale catalog");
                    return Ok(stale.value().clone());
                }
                Err(err)
            }
        }
    }

    /// The design for a calendar slot: exact `{prefix}{day:03}` match first,
    /// else the first design carrying the prefix at all.
    pub async fn design_for_day(&self, day: DayOfYear) -> Result<Option<Design>, FulfillmentError> {
        let wanted = format!("{}{:03}", self.config.design_prefix, day.get());
        let designs = self.all_designs(false).await?;

        if let Some(design) = designs.iter().find(|d| d.matches(&wanted)) {
            return Ok(Some(design.clone()));
        }

        if let Some(fallback) = designs.iter().find(|d| d.has_prefix(&self.config.design_prefix)) {
            tracing::warn!(
                wanted,
                fallback = fallback.display_name(),
                "design not found, using first catalog design with matching prefix"
            );
            return Ok(Some(fallback.clone()));
        }

        Ok(None)
    }

    async fn design_id_for_day(&self, day: DayOfYear) -> Result<Option<i64>, FulfillmentError> {
        Ok(self.design_for_day(day).await?.and_then(|d| d.resolved_id()))
    }

    /// Place a single order; on failure the order is queued for retry before
    /// the error is reported.
    pub async fn place_postcard_order(
        &self,
        recipient: &Recipient,
        design_id: i64,
        options: &OrderOptions,
    ) -> Result<PlacedOrder, FulfillmentError> {
        match self.api.place_postcard(recipient, design_id, options).await {
            Ok(order) => Ok(order),
            Err(err) => {
                let mut entry = RetryEntry::new(
                    recipient.clone(),
                    design_id,
                    options.clone(),
                    err.to_string(),
                );
                entry.max_retries = self.config.max_retries;
                if let Err(queue_err) = self.retry_queue.push(entry).await {
                    tracing::error!(error = %queue_err, "failed to enqueue order for retry");
                }
                Err(err)
            }
        }
    }

    /// Walk `duration` calendar slots from `start_day`, placing one order per
    /// slot with a staggered mail date. Failures are recorded per slot and
    /// never abort the walk.
    pub async fn place_subscription_orders(
        &self,
        recipient: &Recipient,
        start_day: DayOfYear,
        duration: u32,
        subscription_id: &SubscriptionId,
    ) -> BatchOutcome {
        let today = Utc::now().date_naive();
        let mut outcome = BatchOutcome {
            subscription_id: subscription_id.clone(),
            successful: Vec::new(),
            failed: Vec::new(),
            total_requested: duration,
        };

        for offset in 0..duration {
            let day = start_day.advance(offset);
            let mail_date = today
                .checked_add_days(Days::new(offset as u64))
                .unwrap_or(today);

            let design_id = match self.design_id_for_day(day).await {
                Ok(Some(id)) => id,
                Ok(None) => {
                    tracing::warn!(day = day.get(), "no design available for slot, skipping");
                    outcome.failed.push(FailedDay {
                        day,
                        mail_date: Some(mail_date),
                        error: "no design available for slot".to_string(),
                    });
                    continue;
                }
                Err(err) => {
                    outcome.failed.push(FailedDay {
                        day,
                        mail_date: Some(mail_date),
                        error: err.to_string(),
                    });
                    continue;
                }
            };

            let mut options = OrderOptions {
                mail_date: Some(mail_date),
                ext_ref_nbr: Some(format!("{subscription_id}-day{}", day.get())),
                ..OrderOptions::default()
            };
            options
                .variables
                .insert("dayNumber".to_string(), day.get().to_string());
            options
                .variables
                .insert("subscriptionId".to_string(), subscription_id.to_string());

            match self.place_postcard_order(recipient, design_id, &options).await {
                Ok(order) => {
                    tracing::info!(
                        day = day.get(),
                        order_id = %order.order_id,
                        %mail_date,
                        "postcard order placed"
                    );
                    outcome.successful.push(PlacedDay {
                        day,
                        order_id: order.order_id,
                        mail_date,
                    });
                }
                Err(err) => {
                    tracing::error!(day = day.get(), error = %err, "postcard order failed");
                    outcome.failed.push(FailedDay {
                        day,
                        mail_date: Some(mail_date),
                        error: err.to_string(),
                    });
                }
            }

            // Pacing between provider calls; slot-skips above bypass this.
            if !self.config.order_delay.is_zero() {
                tokio::time::sleep(self.config.order_delay).await;
            }
        }

        tracing::info!(
            subscription_id = %subscription_id,
            placed = outcome.successful.len(),
            failed = outcome.failed.len(),
            "batch complete"
        );
        outcome
    }

    /// First batch for a newly created subscription: starts at today's slot.
    pub async fn handle_new_subscription(
        &self,
        subscription: &Subscription,
        customer: &Customer,
    ) -> Result<ScheduleReport, FulfillmentError> {
        let Some(recipient) = Recipient::resolve(subscription, customer) else {
            self.notifier
                .notify(
                    "Missing shipping address",
                    serde_json::json!({
                        "subscription_id": subscription.id.as_str(),
                        "customer_id": customer.id,
                    }),
                )
                .await;
            return Err(DomainError::MissingShippingAddress.into());
        };

        self.verify_address_soft(&recipient, &subscription.id).await;

        let duration = subscription.mailing_duration();
        let start_day = DayOfYear::today();
        let last_day = start_day.last_of_batch(duration);

        tracing::info!(
            subscription_id = %subscription.id,
            start_day = start_day.get(),
            last_day = last_day.get(),
            duration,
            "scheduling initial batch"
        );

        let batch = self
            .place_subscription_orders(&recipient, start_day, duration, &subscription.id)
            .await;

        let mut metadata = BTreeMap::new();
        metadata.insert(meta::START_DAY.to_string(), start_day.to_string());
        metadata.insert(meta::LAST_DAY.to_string(), last_day.to_string());
        metadata.insert(meta::DURATION.to_string(), duration.to_string());
        metadata.insert(meta::CAMPAIGN_START.to_string(), Utc::now().to_rfc3339());
        metadata.insert(
            meta::ORDERS_PLACED.to_string(),
            batch.successful.len().to_string(),
        );
        metadata.insert(
            meta::ORDER_IDS.to_string(),
            serde_json::to_string(&batch.order_ids()).unwrap_or_else(|_| "[]".to_string()),
        );

        self.escalate_batch_failures(&batch).await;

        Ok(ScheduleReport {
            start_day,
            last_day,
            batch,
            metadata,
        })
    }

    /// Continuation batch for a paid renewal invoice. The initial invoice is
    /// skipped (the creation handler already scheduled it), as is any invoice
    /// not tied to a subscription.
    pub async fn handle_subscription_renewal(
        &self,
        invoice: &Invoice,
        subscription: &Subscription,
        customer: &Customer,
        cursor_hint: Option<DayOfYear>,
    ) -> Result<ScheduleOutcome, FulfillmentError> {
        if invoice.subscription.is_none() {
            return Ok(ScheduleOutcome::Skipped {
                reason: "no_subscription".to_string(),
            });
        }
        if invoice.is_initial() {
            tracing::debug!(invoice_id = %invoice.id, "initial invoice, creation handler owns it");
            return Ok(ScheduleOutcome::Skipped {
                reason: "initial_invoice".to_string(),
            });
        }

        let Some(recipient) = Recipient::resolve(subscription, customer) else {
            self.notifier
                .notify(
                    "Missing shipping address",
                    serde_json::json!({
                        "subscription_id": subscription.id.as_str(),
                        "invoice_id": invoice.id,
                    }),
                )
                .await;
            return Err(DomainError::MissingShippingAddress.into());
        };

        let duration = subscription.mailing_duration();
        // Continue from the durable cursor when present, else from the
        // metadata mirror, else start fresh at today's slot.
        let start_day = cursor_hint
            .or_else(|| subscription.continuation_day())
            .map(DayOfYear::next)
            .unwrap_or_else(DayOfYear::today);
        let last_day = start_day.last_of_batch(duration);

        tracing::info!(
            subscription_id = %subscription.id,
            invoice_id = %invoice.id,
            start_day = start_day.get(),
            last_day = last_day.get(),
            duration,
            "scheduling renewal batch"
        );

        let batch = self
            .place_subscription_orders(&recipient, start_day, duration, &subscription.id)
            .await;

        let mut metadata = BTreeMap::new();
        metadata.insert(meta::LAST_DAY.to_string(), last_day.to_string());
        metadata.insert(meta::RENEWAL_DATE.to_string(), Utc::now().to_rfc3339());
        metadata.insert(meta::RENEWAL_START_DAY.to_string(), start_day.to_string());
        metadata.insert(
            meta::ORDER_IDS.to_string(),
            serde_json::to_string(&batch.order_ids()).unwrap_or_else(|_| "[]".to_string()),
        );

        self.escalate_batch_failures(&batch).await;

        Ok(ScheduleOutcome::Scheduled(ScheduleReport {
            start_day,
            last_day,
            batch,
            metadata,
        }))
    }

    /// Cancel every outstanding order for a deleted subscription: the ids in
    /// its metadata plus any recorded elsewhere (the durable cursor store).
    /// Each cancellation is isolated; one failure never stops the rest.
    pub async fn handle_subscription_cancellation(
        &self,
        subscription: &Subscription,
        recorded_order_ids: &[String],
    ) -> CancellationOutcome {
        let mut order_ids = subscription.order_ids();
        for id in recorded_order_ids {
            if !order_ids.contains(id) {
                order_ids.push(id.clone());
            }
        }

        tracing::info!(
            subscription_id = %subscription.id,
            count = order_ids.len(),
            "cancelling outstanding orders"
        );

        let mut outcome = CancellationOutcome::default();
        for order_id in order_ids {
            match self.api.cancel_order(&order_id).await {
                Ok(()) => outcome.cancelled.push(order_id),
                Err(err) => {
                    tracing::warn!(order_id = %order_id, error = %err, "order cancellation failed");
                    outcome.failed.push(FailedCancellation {
                        order_id,
                        error: err.to_string(),
                    });
                }
            }
            if !self.config.order_delay.is_zero() {
                tokio::time::sleep(self.config.order_delay).await;
            }
        }
        outcome
    }

    /// One pass over the retry queue. Entries that fail again go back with an
    /// incremented count; entries drained already exhausted are dropped with
    /// a single admin escalation.
    pub async fn process_retry_queue(&self) -> anyhow::Result<RetryReport> {
        let entries = self.retry_queue.drain().await?;
        if entries.is_empty() {
            return Ok(RetryReport::default());
        }

        tracing::info!(count = entries.len(), "processing retry queue");
        let mut report = RetryReport::default();

        for mut entry in entries {
            if entry.exhausted() {
                self.notifier
                    .notify(
                        "Order permanently failed",
                        serde_json::json!({
                            "recipient": entry.recipient.full_name(),
                            "design_id": entry.design_id,
                            "attempts": entry.retry_count,
                            "last_error": entry.error,
                        }),
                    )
                    .await;
                report.dropped += 1;
                continue;
            }

            report.attempted += 1;
            match self
                .api
                .place_postcard(&entry.recipient, entry.design_id, &entry.options)
                .await
            {
                Ok(order) => {
                    tracing::info!(order_id = %order.order_id, "retried order placed");
                    report.succeeded += 1;
                }
                Err(err) => {
                    entry.retry_count += 1;
                    entry.error = err.to_string();
                    self.retry_queue.push(entry).await?;
                    report.requeued += 1;
                }
            }

            if !self.config.retry_delay.is_zero() {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }

        tracing::info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            requeued = report.requeued,
            dropped = report.dropped,
            "retry pass complete"
        );
        Ok(report)
    }

    pub async fn retry_queue_status(&self) -> anyhow::Result<RetryQueueStatus> {
        self.retry_queue.status().await
    }

    /// Authenticate and pull the catalog once, for the admin surface.
    pub async fn test_connection(&self) -> ConnectionStatus {
        if !self.api.is_configured() {
            return ConnectionStatus {
                configured: false,
                authenticated: false,
                design_count: None,
                error: None,
            };
        }

        match self.api.authenticate().await {
            Ok(_) => match self.all_designs(true).await {
                Ok(designs) => ConnectionStatus {
                    configured: true,
                    authenticated: true,
                    design_count: Some(designs.len()),
                    error: None,
                },
                Err(err) => ConnectionStatus {
                    configured: true,
                    authenticated: true,
                    design_count: None,
                    error: Some(err.to_string()),
                },
            },
            Err(err) => ConnectionStatus {
                configured: true,
                authenticated: false,
                design_count: None,
                error: Some(err.to_string()),
            },
        }
    }

    /// Address verification is advisory: an undeliverable or unverifiable
    /// address escalates but never blocks scheduling.
    async fn verify_address_soft(&self, recipient: &Recipient, subscription_id: &SubscriptionId) {
        match self.api.verify_recipient(recipient).await {
            Ok(check) if !check.valid => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    reason = check.reason.as_deref().unwrap_or("unknown"),
                    "recipient address flagged undeliverable"
                );
                self.notifier
                    .notify(
                        "Recipient address flagged undeliverable",
                        serde_json::json!({
                            "subscription_id": subscription_id.as_str(),
                            "recipient": recipient.full_name(),
                            "reason": check.reason,
                        }),
                    )
                    .await;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "address verification unavailable, proceeding");
            }
        }
    }

    async fn escalate_batch_failures(&self, batch: &BatchOutcome) {
        if batch.failed.is_empty() {
            return;
        }
        self.notifier
            .notify(
                "Some postcard orders failed",
                serde_json::json!({
                    "subscription_id": batch.subscription_id.as_str(),
                    "failed": batch.failed.len(),
                    "placed": batch.successful.len(),
                    "days": batch.failed.iter().map(|f| f.day.get()).collect::<Vec<_>>(),
                }),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::client::AddressCheck;
    use crate::retry::InMemoryRetryQueue;

    /// Provider fake: slot N's design is named `PP-{N:03}` with id N.
    #[derive(Default)]
    struct FakeApi {
        designs: Vec<Design>,
        failing_design_ids: BTreeSet<i64>,
        list_calls: AtomicUsize,
        place_calls: AtomicUsize,
        cancelled: StdMutex<Vec<String>>,
        failing_cancellations: BTreeSet<String>,
        undeliverable: bool,
        list_fails: bool,
    }

    impl FakeApi {
        fn with_full_catalog() -> Self {
            let designs = (1..=365)
                .map(|n| Design {
                    id: Some(n),
                    design_id: None,
                    name: Some(format!("PP-{n:03}")),
                    design_name: None,
                    nickname: None,
                })
                .collect();
            Self {
                designs,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl FulfillmentApi for FakeApi {
        async fn authenticate(&self) -> Result<String, FulfillmentError> {
            Ok("test-token".to_string())
        }

        async fn list_designs(&self) -> Result<Vec<Design>, FulfillmentError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.list_fails {
                return Err(FulfillmentError::Api {
                    status: 500,
                    message: "catalog down".to_string(),
                });
            }
            Ok(self.designs.clone())
        }

        async fn place_postcard(
            &self,
            _recipient: &Recipient,
            design_id: i64,
            _options: &OrderOptions,
        ) -> Result<PlacedOrder, FulfillmentError> {
            self.place_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing_design_ids.contains(&design_id) {
                return Err(FulfillmentError::Api {
                    status: 500,
                    message: format!("design {design_id} rejected"),
                });
            }
            Ok(PlacedOrder {
                order_id: format!("ord-{design_id}"),
                batch_id: None,
                status: Some("queued".to_string()),
                demo: false,
            })
        }

        async fn cancel_order(&self, order_id: &str) -> Result<(), FulfillmentError> {
            if self.failing_cancellations.contains(order_id) {
                return Err(FulfillmentError::Api {
                    status: 404,
                    message: "order not found".to_string(),
                });
            }
            self.cancelled.lock().unwrap().push(order_id.to_string());
            Ok(())
        }

        async fn get_order(&self, _order_id: &str) -> Result<serde_json::Value, FulfillmentError> {
            Ok(json!({}))
        }

        async fn list_orders(
            &self,
            _page: u32,
            _per_page: u32,
        ) -> Result<serde_json::Value, FulfillmentError> {
            Ok(json!({}))
        }

        async fn order_recipients(
            &self,
            _order_id: &str,
            _page: u32,
            _per_page: u32,
        ) -> Result<serde_json::Value, FulfillmentError> {
            Ok(json!({}))
        }

        async fn verify_recipient(
            &self,
            _recipient: &Recipient,
        ) -> Result<AddressCheck, FulfillmentError> {
            Ok(AddressCheck {
                valid: !self.undeliverable,
                reason: self.undeliverable.then(|| "vacant".to_string()),
                demo: false,
            })
        }

        fn is_configured(&self) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        subjects: StdMutex<Vec<String>>,
    }

    impl RecordingNotifier {
        fn subjects(&self) -> Vec<String> {
            self.subjects.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AdminNotifier for RecordingNotifier {
        async fn notify(&self, subject: &str, _details: serde_json::Value) {
            self.subjects.lock().unwrap().push(subject.to_string());
        }
    }

    fn no_delay_config() -> FulfillmentConfig {
        FulfillmentConfig {
            order_delay: std::time::Duration::ZERO,
            retry_delay: std::time::Duration::ZERO,
            ..FulfillmentConfig::default()
        }
    }

    fn service(api: FakeApi) -> FulfillmentService<FakeApi, RecordingNotifier, InMemoryRetryQueue> {
        FulfillmentService::new(
            api,
            RecordingNotifier::default(),
            InMemoryRetryQueue::default(),
            no_delay_config(),
        )
    }

    fn recipient() -> Recipient {
        Recipient {
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            address1: "12 Analytical Way".to_string(),
            city: "Clearwater".to_string(),
            state: "FL".to_string(),
            zip: "33765".to_string(),
            ..Recipient::default()
        }
    }

    fn subscription(metadata: serde_json::Value) -> Subscription {
        Subscription::from_payload(&json!({
            "id": "sub_1",
            "customer": "cus_1",
            "metadata": metadata,
        }))
        .unwrap()
    }

    fn customer() -> Customer {
        Customer::from_payload(&json!({
            "id": "cus_1",
            "name": "Ada Lovelace",
            "shipping": {
                "name": "Ada Lovelace",
                "address": {
                    "line1": "12 Analytical Way",
                    "city": "Clearwater",
                    "state": "FL",
                    "postal_code": "33765"
                }
            }
        }))
    }

    #[tokio::test]
    async fn batch_places_one_order_per_slot() {
        let svc = service(FakeApi::with_full_catalog());
        let start = DayOfYear::new(10).unwrap();
        let batch = svc
            .place_subscription_orders(&recipient(), start, 7, &SubscriptionId::new("sub_1"))
            .await;

        assert_eq!(batch.successful.len(), 7);
        assert!(batch.failed.is_empty());
        let days: Vec<u16> = batch.successful.iter().map(|p| p.day.get()).collect();
        assert_eq!(days, vec![10, 11, 12, 13, 14, 15, 16]);
        assert_eq!(batch.successful[0].order_id, "ord-10");
        // Mail dates stagger one day per slot.
        assert_eq!(
            batch.successful[6].mail_date,
            batch.successful[0].mail_date + Days::new(6)
        );
    }

    #[tokio::test]
    async fn batch_wraps_past_day_365() {
        let svc = service(FakeApi::with_full_catalog());
        let start = DayOfYear::new(363).unwrap();
        let batch = svc
            .place_subscription_orders(&recipient(), start, 7, &SubscriptionId::new("sub_1"))
            .await;

        let days: Vec<u16> = batch.successful.iter().map(|p| p.day.get()).collect();
        assert_eq!(days, vec![363, 364, 365, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn one_failing_slot_does_not_abort_the_batch() {
        let mut api = FakeApi::with_full_catalog();
        api.failing_design_ids.insert(15);
        let svc = service(api);

        let start = DayOfYear::new(10).unwrap();
        let batch = svc
            .place_subscription_orders(&recipient(), start, 30, &SubscriptionId::new("sub_1"))
            .await;

        assert_eq!(batch.total_ordered(), 29);
        assert_eq!(batch.total_requested, 30);
        assert_eq!(batch.failed.len(), 1);
        assert_eq!(batch.failed[0].day.get(), 15);

        // The failed slot landed in the retry queue.
        let status = svc.retry_queue_status().await.unwrap();
        assert_eq!(status.queue_size, 1);
        assert_eq!(status.entries[0].recipient, "Ada Lovelace");
    }

    #[tokio::test]
    async fn empty_catalog_records_failures_without_placing() {
        let svc = service(FakeApi::default());
        let start = DayOfYear::new(1).unwrap();
        let batch = svc
            .place_subscription_orders(&recipient(), start, 3, &SubscriptionId::new("sub_1"))
            .await;

        assert!(batch.successful.is_empty());
        assert_eq!(batch.failed.len(), 3);
        assert_eq!(svc.api().place_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn design_catalog_is_cached_across_lookups() {
        let svc = service(FakeApi::with_full_catalog());
        let start = DayOfYear::new(1).unwrap();
        svc.place_subscription_orders(&recipient(), start, 10, &SubscriptionId::new("sub_1"))
            .await;
        assert_eq!(svc.api().list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_catalog_is_served_when_refresh_fails() {
        let mut api = FakeApi::with_full_catalog();
        api.list_fails = true;
        let svc = service(api);
        // Seed a stale-but-present catalog; the broken endpoint must not
        // evict it.
        {
            let mut cached = svc.designs.lock().await;
            *cached = Some(Cached::with_ttl(
                vec![Design {
                    id: Some(1),
                    design_id: None,
                    name: Some("PP-001".to_string()),
                    design_name: None,
                    nickname: None,
                }],
                chrono::Duration::hours(1),
            ));
        }
        let designs = svc.all_designs(true).await.unwrap();
        assert_eq!(designs.len(), 1);
    }

    #[tokio::test]
    async fn prefix_fallback_covers_missing_slot_designs() {
        let api = FakeApi {
            designs: vec![Design {
                id: Some(77),
                design_id: None,
                name: Some("PP-001".to_string()),
                design_name: None,
                nickname: None,
            }],
            ..FakeApi::default()
        };
        let svc = service(api);

        let design = svc
            .design_for_day(DayOfYear::new(200).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(design.resolved_id(), Some(77));
    }

    #[tokio::test]
    async fn new_subscription_schedules_trial_week_and_records_cursor() {
        let svc = service(FakeApi::with_full_catalog());
        let sub = subscription(json!({ "type": "trial" }));
        let report = svc.handle_new_subscription(&sub, &customer()).await.unwrap();

        assert_eq!(report.batch.successful.len(), 7);
        assert_eq!(report.last_day, report.start_day.last_of_batch(7));
        assert_eq!(
            report.metadata.get(meta::START_DAY).unwrap(),
            &report.start_day.to_string()
        );
        assert_eq!(
            report.metadata.get(meta::LAST_DAY).unwrap(),
            &report.last_day.to_string()
        );
        assert_eq!(report.metadata.get(meta::DURATION).unwrap(), "7");
        let ids: Vec<String> =
            serde_json::from_str(report.metadata.get(meta::ORDER_IDS).unwrap()).unwrap();
        assert_eq!(ids.len(), 7);
    }

    #[tokio::test]
    async fn missing_address_escalates_and_fails() {
        let svc = service(FakeApi::with_full_catalog());
        let sub = subscription(json!({}));
        let customer = Customer::from_payload(&json!({ "id": "cus_1", "name": "No Address" }));

        let err = svc.handle_new_subscription(&sub, &customer).await.unwrap_err();
        assert!(matches!(
            err,
            FulfillmentError::Domain(DomainError::MissingShippingAddress)
        ));
        assert_eq!(svc.notifier.subjects(), vec!["Missing shipping address"]);
        assert_eq!(svc.api().place_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn undeliverable_address_escalates_but_still_schedules() {
        let api = FakeApi {
            undeliverable: true,
            ..FakeApi::with_full_catalog()
        };
        let svc = service(api);
        let sub = subscription(json!({ "type": "trial" }));
        let report = svc.handle_new_subscription(&sub, &customer()).await.unwrap();

        assert_eq!(report.batch.successful.len(), 7);
        assert_eq!(
            svc.notifier.subjects(),
            vec!["Recipient address flagged undeliverable"]
        );
    }

    #[tokio::test]
    async fn partial_batch_failure_escalates_once() {
        let mut api = FakeApi::with_full_catalog();
        api.failing_design_ids.insert(DayOfYear::today().next().get() as i64);
        let svc = service(api);
        let sub = subscription(json!({ "type": "trial" }));
        let report = svc.handle_new_subscription(&sub, &customer()).await.unwrap();

        assert_eq!(report.batch.failed.len(), 1);
        assert_eq!(svc.notifier.subjects(), vec!["Some postcard orders failed"]);
    }

    #[tokio::test]
    async fn initial_invoice_is_skipped_without_placing_anything() {
        let svc = service(FakeApi::with_full_catalog());
        let invoice = Invoice::from_payload(&json!({
            "id": "in_1",
            "subscription": "sub_1",
            "billing_reason": "subscription_create",
        }))
        .unwrap();
        let sub = subscription(json!({}));

        let outcome = svc
            .handle_subscription_renewal(&invoice, &sub, &customer(), None)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ScheduleOutcome::Skipped { ref reason } if reason == "initial_invoice"
        ));
        assert_eq!(svc.api().place_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn renewal_continues_from_metadata_cursor_across_wraparound() {
        let svc = service(FakeApi::with_full_catalog());
        let invoice = Invoice::from_payload(&json!({
            "id": "in_2",
            "subscription": "sub_1",
            "billing_reason": "subscription_cycle",
        }))
        .unwrap();
        let sub = subscription(json!({ "type": "trial", "pcm_last_day": "365" }));

        let outcome = svc
            .handle_subscription_renewal(&invoice, &sub, &customer(), None)
            .await
            .unwrap();
        let ScheduleOutcome::Scheduled(report) = outcome else {
            panic!("expected a scheduled renewal");
        };
        assert_eq!(report.start_day.get(), 1);
        assert_eq!(report.last_day.get(), 7);
        assert_eq!(report.metadata.get(meta::RENEWAL_START_DAY).unwrap(), "1");
        assert_eq!(report.metadata.get(meta::LAST_DAY).unwrap(), "7");
    }

    #[tokio::test]
    async fn durable_cursor_wins_over_metadata_mirror() {
        let svc = service(FakeApi::with_full_catalog());
        let invoice = Invoice::from_payload(&json!({
            "id": "in_3",
            "subscription": "sub_1",
            "billing_reason": "subscription_cycle",
        }))
        .unwrap();
        // Metadata mirror lags behind the durable cursor.
        let sub = subscription(json!({ "type": "trial", "pcm_last_day": "50" }));

        let outcome = svc
            .handle_subscription_renewal(
                &invoice,
                &sub,
                &customer(),
                Some(DayOfYear::new(100).unwrap()),
            )
            .await
            .unwrap();
        let ScheduleOutcome::Scheduled(report) = outcome else {
            panic!("expected a scheduled renewal");
        };
        assert_eq!(report.start_day.get(), 101);
    }

    #[tokio::test]
    async fn renewal_without_any_cursor_starts_today() {
        let svc = service(FakeApi::with_full_catalog());
        let invoice = Invoice::from_payload(&json!({
            "id": "in_4",
            "subscription": "sub_1",
            "billing_reason": "subscription_cycle",
        }))
        .unwrap();
        let sub = subscription(json!({ "type": "trial" }));

        let outcome = svc
            .handle_subscription_renewal(&invoice, &sub, &customer(), None)
            .await
            .unwrap();
        let ScheduleOutcome::Scheduled(report) = outcome else {
            panic!("expected a scheduled renewal");
        };
        assert_eq!(report.start_day, DayOfYear::today());
    }

    #[tokio::test]
    async fn cancellation_isolates_failures_and_merges_recorded_ids() {
        let mut api = FakeApi::with_full_catalog();
        api.failing_cancellations.insert("ord-2".to_string());
        let svc = service(api);
        let sub = subscription(json!({ "pcm_order_ids": "[\"ord-1\", \"ord-2\"]" }));

        let outcome = svc
            .handle_subscription_cancellation(&sub, &["ord-2".to_string(), "ord-3".to_string()])
            .await;

        assert_eq!(outcome.cancelled, vec!["ord-1", "ord-3"]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].order_id, "ord-2");
    }

    #[tokio::test]
    async fn retry_pass_resubmits_and_clears_the_queue() {
        let svc = service(FakeApi::with_full_catalog());
        svc.retry_queue
            .push(RetryEntry::new(
                recipient(),
                12,
                OrderOptions::default(),
                "provider 500".to_string(),
            ))
            .await
            .unwrap();

        let report = svc.process_retry_queue().await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.requeued, 0);
        assert_eq!(svc.retry_queue_status().await.unwrap().queue_size, 0);
    }

    #[tokio::test]
    async fn retries_exhaust_after_three_attempts_with_one_escalation() {
        let mut api = FakeApi::with_full_catalog();
        api.failing_design_ids.insert(12);
        let svc = service(api);
        svc.retry_queue
            .push(RetryEntry::new(
                recipient(),
                12,
                OrderOptions::default(),
                "provider 500".to_string(),
            ))
            .await
            .unwrap();

        for _ in 0..3 {
            let report = svc.process_retry_queue().await.unwrap();
            assert_eq!(report.attempted, 1);
            assert_eq!(report.requeued, 1);
        }

        // Fourth pass drains an exhausted entry: dropped, escalated once.
        let report = svc.process_retry_queue().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(report.dropped, 1);
        assert_eq!(svc.retry_queue_status().await.unwrap().queue_size, 0);
        assert_eq!(svc.notifier.subjects(), vec!["Order permanently failed"]);

        // Original placement was never counted; three retry attempts total.
        assert_eq!(svc.api().place_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_placement_lands_in_queue_with_error_context() {
        let mut api = FakeApi::with_full_catalog();
        api.failing_design_ids.insert(5);
        let svc = service(api);

        let err = svc
            .place_postcard_order(&recipient(), 5, &OrderOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FulfillmentError::Api { status: 500, .. }));

        let status = svc.retry_queue_status().await.unwrap();
        assert_eq!(status.queue_size, 1);
        assert!(status.entries[0].error.contains("design 5 rejected"));
        assert_eq!(status.entries[0].retry_count, 0);
    }

    #[tokio::test]
    async fn connection_test_reports_catalog_size() {
        let svc = service(FakeApi::with_full_catalog());
        let status = svc.test_connection().await;
        assert!(status.configured);
        assert!(status.authenticated);
        assert_eq!(status.design_count, Some(365));
        assert!(status.error.is_none());
    }
}
