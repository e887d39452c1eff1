//! Stripe integration: webhook signature verification and the thin REST
//! client the worker uses to fetch objects and mirror cursor metadata.

use std::collections::BTreeMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";

/// Webhook signatures older than this are rejected outright.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("malformed signature header")]
    Malformed,
    #[error("signature timestamp outside tolerance")]
    Stale,
    #[error("no signature matched the payload")]
    Mismatch,
}

/// Verify a `Stripe-Signature` header against the raw request body.
///
/// The header carries `t=<unix>,v1=<hex hmac>` pairs; the signed string is
/// `"{t}.{payload}"`. Comparison runs in constant time via `Mac::verify`.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now_unix: i64,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<Vec<u8>> = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse().ok(),
            "v1" => {
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed);
    }
    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(SignatureError::Stale);
    }

    for signature in &signatures {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|_| SignatureError::Malformed)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        if mac.verify_slice(signature).is_ok() {
            return Ok(());
        }
    }
    Err(SignatureError::Mismatch)
}

/// The envelope of a Stripe webhook event.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

/// What the fulfillment worker needs from the payment provider.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn get_customer(&self, customer_id: &str) -> anyhow::Result<serde_json::Value>;

    async fn get_subscription(&self, subscription_id: &str) -> anyhow::Result<serde_json::Value>;

    /// Mirror cursor metadata onto the subscription. Best-effort; the durable
    /// cursor store is the source of truth.
    async fn update_subscription_metadata(
        &self,
        subscription_id: &str,
        metadata: &BTreeMap<String, String>,
    ) -> anyhow::Result<()>;
}

/// Minimal Stripe REST client. Without a secret key it degrades into demo
/// responses so local runs work end to end.
pub struct StripeClient {
    http: reqwest::Client,
    secret_key: Option<String>,
}

impl StripeClient {
    pub fn new(secret_key: Option<String>) -> Self {
        if secret_key.is_none() {
            tracing::warn!("STRIPE_SECRET_KEY not set; provider lookups run in demo mode");
        }
        Self {
            http: reqwest::Client::new(),
            secret_key,
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var("STRIPE_SECRET_KEY").ok().filter(|v| !v.is_empty()))
    }

    async fn get(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        let key = self
            .secret_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("stripe client not configured"))?;
        let response = self
            .http
            .get(format!("{STRIPE_API_BASE}{path}"))
            .bearer_auth(key)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("stripe GET {path} returned {status}: {body}");
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn get_customer(&self, customer_id: &str) -> anyhow::Result<serde_json::Value> {
        if self.secret_key.is_none() {
            return Ok(serde_json::json!({ "id": customer_id }));
        }
        self.get(&format!("/customers/{customer_id}")).await
    }

    async fn get_subscription(&self, subscription_id: &str) -> anyhow::Result<serde_json::Value> {
        if self.secret_key.is_none() {
            return Ok(serde_json::json!({ "id": subscription_id, "metadata": {} }));
        }
        self.get(&format!("/subscriptions/{subscription_id}")).await
    }

    async fn update_subscription_metadata(
        &self,
        subscription_id: &str,
        metadata: &BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        let Some(key) = self.secret_key.as_deref() else {
            tracing::debug!(subscription_id, "demo mode: skipping metadata mirror");
            return Ok(());
        };

        // Stripe's form encoding for nested maps: metadata[key]=value.
        let form: Vec<(String, &str)> = metadata
            .iter()
            .map(|(k, v)| (format!("metadata[{k}]"), v.as_str()))
            .collect();

        let response = self
            .http
            .post(format!("{STRIPE_API_BASE}/subscriptions/{subscription_id}"))
            .bearer_auth(key)
            .form(&form)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("stripe metadata update returned {status}: {body}");
        }
        Ok(())
    }
}
