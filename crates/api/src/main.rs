use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use postcards_api::app::{build_app, AppState};
use postcards_api::stripe::StripeClient;
use postcards_api::worker::{FulfillmentJob, FulfillmentWorker};
use postcards_fulfillment::client::PcmClient;
use postcards_fulfillment::config::PcmConfig;
use postcards_fulfillment::notify::LogNotifier;
use postcards_fulfillment::service::{FulfillmentConfig, FulfillmentService};
use postcards_store::{CursorStore, SqliteRetryQueue};

#[tokio::main]
async fn main() {
    postcards_observability::init();

    let db_path =
        std::env::var("FULFILLMENT_DB").unwrap_or_else(|_| "sqlite://postcards.db".to_string());
    let pool = postcards_store::open_database(&db_path)
        .await
        .expect("failed to open fulfillment database");

    let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
        .ok()
        .filter(|v| !v.is_empty());
    if webhook_secret.is_none() {
        tracing::warn!("STRIPE_WEBHOOK_SECRET not set; webhook signatures will not be checked");
    }

    let service = Arc::new(FulfillmentService::new(
        PcmClient::new(PcmConfig::from_env()),
        LogNotifier,
        SqliteRetryQueue::new(pool.clone()),
        FulfillmentConfig::default(),
    ));

    let (jobs, job_rx) = mpsc::channel::<FulfillmentJob>(256);

    let worker = FulfillmentWorker::new(
        service.clone(),
        Arc::new(StripeClient::from_env()),
        CursorStore::new(pool),
    );
    tokio::spawn(worker.run(job_rx));

    // Periodic retry pass, on the same channel as webhook work.
    let retry_interval = std::env::var("RETRY_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(300u64);
    let retry_jobs = jobs.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(retry_interval));
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            if retry_jobs.send(FulfillmentJob::ProcessRetryQueue).await.is_err() {
                break;
            }
        }
    });

    let app = build_app(AppState {
        jobs,
        service,
        webhook_secret,
    });

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080")
        .await
        .expect("failed to bind 0.0.0.0:8080");

    tracing::info!("listening on {}", listener.local_addr().unwrap());

    axum::serve(listener, app).await.unwrap();
}
