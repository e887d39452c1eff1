//! Background fulfillment worker.
//!
//! The webhook handler does nothing but verify, parse, and enqueue; this
//! worker owns the slow part (one provider call per calendar slot) so Stripe
//! gets its 200 back immediately. Jobs arrive on an mpsc channel; the
//! periodic retry tick is just another job on the same channel.

use std::sync::Arc;

use tokio::sync::mpsc;

use postcards_core::{Customer, Invoice, Subscription};
use postcards_fulfillment::client::FulfillmentApi;
use postcards_fulfillment::notify::AdminNotifier;
use postcards_fulfillment::retry::RetryQueue;
use postcards_fulfillment::service::{FulfillmentService, ScheduleOutcome, ScheduleReport};
use postcards_store::CursorStore;

use crate::stripe::PaymentProvider;

#[derive(Debug, Clone)]
pub enum FulfillmentJob {
    SubscriptionCreated { payload: serde_json::Value },
    InvoicePaid { payload: serde_json::Value },
    SubscriptionDeleted { payload: serde_json::Value },
    ProcessRetryQueue,
}

impl FulfillmentJob {
    /// Map a webhook event onto a job. Unhandled event types map to `None`
    /// and are acknowledged without work.
    pub fn from_event(event_type: &str, object: serde_json::Value) -> Option<Self> {
        match event_type {
            "customer.subscription.created" => {
                Some(Self::SubscriptionCreated { payload: object })
            }
            "invoice.payment_succeeded" | "invoice.paid" => {
                Some(Self::InvoicePaid { payload: object })
            }
            "customer.subscription.deleted" => {
                Some(Self::SubscriptionDeleted { payload: object })
            }
            _ => None,
        }
    }
}

pub struct FulfillmentWorker<A, N, Q, P> {
    service: Arc<FulfillmentService<A, N, Q>>,
    provider: Arc<P>,
    cursors: CursorStore,
}

impl<A, N, Q, P> FulfillmentWorker<A, N, Q, P>
where
    A: FulfillmentApi,
    N: AdminNotifier,
    Q: RetryQueue,
    P: PaymentProvider,
{
    pub fn new(
        service: Arc<FulfillmentService<A, N, Q>>,
        provider: Arc<P>,
        cursors: CursorStore,
    ) -> Self {
        Self {
            service,
            provider,
            cursors,
        }
    }

    /// Drain the job channel until every sender is gone.
    pub async fn run(self, mut jobs: mpsc::Receiver<FulfillmentJob>) {
        while let Some(job) = jobs.recv().await {
            if let Err(err) = self.handle(job).await {
                tracing::error!(error = %err, "fulfillment job failed");
            }
        }
        tracing::info!("fulfillment worker stopped");
    }

    pub async fn handle(&self, job: FulfillmentJob) -> anyhow::Result<()> {
        match job {
            FulfillmentJob::SubscriptionCreated { payload } => {
                self.on_subscription_created(payload).await
            }
            FulfillmentJob::InvoicePaid { payload } => self.on_invoice_paid(payload).await,
            FulfillmentJob::SubscriptionDeleted { payload } => {
                self.on_subscription_deleted(payload).await
            }
            FulfillmentJob::ProcessRetryQueue => {
                self.service.process_retry_queue().await?;
                Ok(())
            }
        }
    }

    async fn on_subscription_created(&self, payload: serde_json::Value) -> anyhow::Result<()> {
        let subscription = Subscription::from_payload(&payload)?;
        tracing::info!(subscription_id = %subscription.id, "handling new subscription");

        let customer_payload = self.provider.get_customer(&subscription.customer_id).await?;
        let customer = Customer::from_payload(&customer_payload);

        let report = self
            .service
            .handle_new_subscription(&subscription, &customer)
            .await?;
        self.persist_report(&subscription, &report).await
    }

    async fn on_invoice_paid(&self, payload: serde_json::Value) -> anyhow::Result<()> {
        let invoice = Invoice::from_payload(&payload)?;
        let Some(subscription_id) = invoice.subscription.as_deref() else {
            tracing::debug!(invoice_id = %invoice.id, "invoice without subscription, nothing to do");
            return Ok(());
        };
        if invoice.is_initial() {
            tracing::debug!(invoice_id = %invoice.id, "initial invoice, creation handler owns it");
            return Ok(());
        }

        let subscription_payload = self.provider.get_subscription(subscription_id).await?;
        let subscription = Subscription::from_payload(&subscription_payload)?;
        let customer_payload = self.provider.get_customer(&subscription.customer_id).await?;
        let customer = Customer::from_payload(&customer_payload);

        let cursor_hint = self.cursors.last_day(&subscription.id).await?;
        let outcome = self
            .service
            .handle_subscription_renewal(&invoice, &subscription, &customer, cursor_hint)
            .await?;

        match outcome {
            ScheduleOutcome::Scheduled(report) => self.persist_report(&subscription, &report).await,
            ScheduleOutcome::Skipped { reason } => {
                tracing::debug!(invoice_id = %invoice.id, reason, "renewal skipped");
                Ok(())
            }
        }
    }

    async fn on_subscription_deleted(&self, payload: serde_json::Value) -> anyhow::Result<()> {
        let subscription = Subscription::from_payload(&payload)?;
        tracing::info!(subscription_id = %subscription.id, "handling cancellation");

        let recorded = self.cursors.order_ids(&subscription.id).await?;
        let outcome = self
            .service
            .handle_subscription_cancellation(&subscription, &recorded)
            .await;
        if !outcome.failed.is_empty() {
            tracing::warn!(
                subscription_id = %subscription.id,
                failed = outcome.failed.len(),
                cancelled = outcome.cancelled.len(),
                "some order cancellations failed"
            );
        }

        self.cursors.clear(&subscription.id).await?;
        Ok(())
    }

    /// Advance the durable cursor, then mirror it into provider metadata.
    /// The mirror is best-effort; a failure there must not fail the job.
    async fn persist_report(
        &self,
        subscription: &Subscription,
        report: &ScheduleReport,
    ) -> anyhow::Result<()> {
        self.cursors
            .record_batch(
                &subscription.id,
                report.start_day,
                report.last_day,
                &report.batch.successful,
            )
            .await?;

        if let Err(err) = self
            .provider
            .update_subscription_metadata(subscription.id.as_str(), &report.metadata)
            .await
        {
            tracing::warn!(
                subscription_id = %subscription.id,
                error = %err,
                "metadata mirror failed; durable cursor already recorded"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use serde_json::json;

    use postcards_core::Recipient;
    use postcards_core::subscription::meta;
    use postcards_fulfillment::client::{AddressCheck, Design, OrderOptions, PlacedOrder};
    use postcards_fulfillment::error::FulfillmentError;
    use postcards_fulfillment::notify::LogNotifier;
    use postcards_fulfillment::retry::InMemoryRetryQueue;
    use postcards_fulfillment::service::FulfillmentConfig;

    use super::*;

    /// Provider fake: every slot has a design whose id equals the slot.
    #[derive(Default)]
    struct FakeApi {
        cancelled: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl FulfillmentApi for FakeApi {
        async fn authenticate(&self) -> Result<String, FulfillmentError> {
            Ok("token".to_string())
        }

        async fn list_designs(&self) -> Result<Vec<Design>, FulfillmentError> {
            Ok((1..=365)
                .map(|n| Design {
                    id: Some(n),
                    design_id: None,
                    name: Some(format!("PP-{n:03}")),
                    design_name: None,
                    nickname: None,
                })
                .collect())
        }

        async fn place_postcard(
            &self,
            _recipient: &Recipient,
            design_id: i64,
            _options: &OrderOptions,
        ) -> Result<PlacedOrder, FulfillmentError> {
            Ok(PlacedOrder {
                order_id: format!("ord-{design_id}"),
                batch_id: None,
                status: None,
                demo: false,
            })
        }

        async fn cancel_order(&self, order_id: &str) -> Result<(), FulfillmentError> {
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
                valid: true,
                reason: None,
                demo: false,
            })
        }

        fn is_configured(&self) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct FakeProvider {
        subscriptions: StdMutex<BTreeMap<String, serde_json::Value>>,
        mirrored: StdMutex<Vec<(String, BTreeMap<String, String>)>>,
        fail_mirror: bool,
    }

    #[async_trait]
    impl PaymentProvider for FakeProvider {
        async fn get_customer(&self, customer_id: &str) -> anyhow::Result<serde_json::Value> {
            Ok(json!({
                "id": customer_id,
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

        async fn get_subscription(
            &self,
            subscription_id: &str,
        ) -> anyhow::Result<serde_json::Value> {
            Ok(self
                .subscriptions
                .lock()
                .unwrap()
                .get(subscription_id)
                .cloned()
                .unwrap_or_else(|| json!({ "id": subscription_id, "metadata": {} })))
        }

        async fn update_subscription_metadata(
            &self,
            subscription_id: &str,
            metadata: &BTreeMap<String, String>,
        ) -> anyhow::Result<()> {
            if self.fail_mirror {
                anyhow::bail!("stripe unavailable");
            }
            self.mirrored
                .lock()
                .unwrap()
                .push((subscription_id.to_string(), metadata.clone()));
            Ok(())
        }
    }

    type TestWorker = FulfillmentWorker<FakeApi, LogNotifier, InMemoryRetryQueue, FakeProvider>;

    async fn worker(provider: FakeProvider) -> (TestWorker, Arc<FakeProvider>, CursorStore) {
        let pool = postcards_store::open_database("sqlite::memory:").await.unwrap();
        let cursors = CursorStore::new(pool);
        let provider = Arc::new(provider);
        let service = Arc::new(FulfillmentService::new(
            FakeApi::default(),
            LogNotifier,
            InMemoryRetryQueue::default(),
            FulfillmentConfig {
                order_delay: std::time::Duration::ZERO,
                retry_delay: std::time::Duration::ZERO,
                ..FulfillmentConfig::default()
            },
        ));
        (
            FulfillmentWorker::new(service, provider.clone(), cursors.clone()),
            provider,
            cursors,
        )
    }

    fn trial_subscription(id: &str) -> serde_json::Value {
        json!({
            "id": id,
            "customer": "cus_1",
            "metadata": { "type": "trial" },
        })
    }

    #[tokio::test]
    async fn creation_records_cursor_and_mirrors_metadata() {
        let (worker, provider, cursors) = worker(FakeProvider::default()).await;

        worker
            .handle(FulfillmentJob::SubscriptionCreated {
                payload: trial_subscription("sub_1"),
            })
            .await
            .unwrap();

        let sub = postcards_core::SubscriptionId::new("sub_1");
        let last = cursors.last_day(&sub).await.unwrap().unwrap();
        assert_eq!(cursors.order_ids(&sub).await.unwrap().len(), 7);

        let mirrored = provider.mirrored.lock().unwrap();
        assert_eq!(mirrored.len(), 1);
        let (id, metadata) = &mirrored[0];
        assert_eq!(id, "sub_1");
        assert_eq!(metadata.get(meta::LAST_DAY).unwrap(), &last.to_string());
        assert!(metadata.contains_key(meta::START_DAY));
        assert!(metadata.contains_key(meta::CAMPAIGN_START));
    }

    #[tokio::test]
    async fn renewal_continues_from_the_durable_cursor() {
        let provider = FakeProvider::default();
        // The provider's metadata mirror is stale on purpose.
        provider.subscriptions.lock().unwrap().insert(
            "sub_1".to_string(),
            json!({
                "id": "sub_1",
                "customer": "cus_1",
                "metadata": { "type": "trial", "pcm_last_day": "10" },
            }),
        );
        let (worker, provider, cursors) = worker(provider).await;

        let sub = postcards_core::SubscriptionId::new("sub_1");
        let start = postcards_core::DayOfYear::new(100).unwrap();
        cursors
            .record_batch(&sub, start, start.last_of_batch(7), &[])
            .await
            .unwrap();

        worker
            .handle(FulfillmentJob::InvoicePaid {
                payload: json!({
                    "id": "in_1",
                    "subscription": "sub_1",
                    "billing_reason": "subscription_cycle",
                }),
            })
            .await
            .unwrap();

        // Durable cursor said last day 106, so the renewal ran 107-113.
        assert_eq!(cursors.last_day(&sub).await.unwrap().unwrap().get(), 113);
        let mirrored = provider.mirrored.lock().unwrap();
        assert_eq!(mirrored[0].1.get(meta::RENEWAL_START_DAY).unwrap(), "107");
    }

    #[tokio::test]
    async fn initial_invoice_does_not_touch_the_cursor() {
        let (worker, provider, cursors) = worker(FakeProvider::default()).await;

        worker
            .handle(FulfillmentJob::InvoicePaid {
                payload: json!({
                    "id": "in_1",
                    "subscription": "sub_1",
                    "billing_reason": "subscription_create",
                }),
            })
            .await
            .unwrap();

        let sub = postcards_core::SubscriptionId::new("sub_1");
        assert!(cursors.last_day(&sub).await.unwrap().is_none());
        assert!(provider.mirrored.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn deletion_cancels_recorded_orders_and_clears_state() {
        let (worker, _provider, cursors) = worker(FakeProvider::default()).await;

        worker
            .handle(FulfillmentJob::SubscriptionCreated {
                payload: trial_subscription("sub_1"),
            })
            .await
            .unwrap();
        let sub = postcards_core::SubscriptionId::new("sub_1");
        assert_eq!(cursors.order_ids(&sub).await.unwrap().len(), 7);

        worker
            .handle(FulfillmentJob::SubscriptionDeleted {
                payload: json!({ "id": "sub_1", "customer": "cus_1", "metadata": {} }),
            })
            .await
            .unwrap();

        assert!(cursors.last_day(&sub).await.unwrap().is_none());
        assert!(cursors.order_ids(&sub).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mirror_failure_still_records_the_cursor() {
        let (worker, _provider, cursors) = worker(FakeProvider {
            fail_mirror: true,
            ..FakeProvider::default()
        })
        .await;

        worker
            .handle(FulfillmentJob::SubscriptionCreated {
                payload: trial_subscription("sub_1"),
            })
            .await
            .unwrap();

        let sub = postcards_core::SubscriptionId::new("sub_1");
        assert!(cursors.last_day(&sub).await.unwrap().is_some());
    }

    #[test]
    fn only_fulfillment_events_map_to_jobs() {
        assert!(matches!(
            FulfillmentJob::from_event("customer.subscription.created", json!({})),
            Some(FulfillmentJob::SubscriptionCreated { .. })
        ));
        assert!(matches!(
            FulfillmentJob::from_event("invoice.payment_succeeded", json!({})),
            Some(FulfillmentJob::InvoicePaid { .. })
        ));
        assert!(matches!(
            FulfillmentJob::from_event("invoice.paid", json!({})),
            Some(FulfillmentJob::InvoicePaid { .. })
        ));
        assert!(matches!(
            FulfillmentJob::from_event("customer.subscription.deleted", json!({})),
            Some(FulfillmentJob::SubscriptionDeleted { .. })
        ));
        assert!(FulfillmentJob::from_event("charge.refunded", json!({})).is_none());
    }
}
