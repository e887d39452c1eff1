//! PostcardMania DirectMail API v3 client.
//!
//! `FulfillmentApi` is the seam between the scheduling service and the
//! provider: production uses `PcmClient` (reqwest + cached bearer token);
//! tests substitute an in-memory fake.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use postcards_core::Recipient;

use crate::cache::Cached;
use crate::config::PcmConfig;
use crate::error::FulfillmentError;

/// Refresh the bearer token this long before the provider-reported expiry.
const TOKEN_REFRESH_MARGIN_MINS: i64 = 5;

/// One entry of the provider's design catalog. Field names vary across
/// catalog versions, hence the alias triples.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Design {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub design_id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub design_name: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
}

impl Design {
    /// True when any of the naming fields equals `name` exactly.
    pub fn matches(&self, name: &str) -> bool {
        [&self.name, &self.design_name, &self.nickname]
            .into_iter()
            .any(|field| field.as_deref() == Some(name))
    }

    /// True when any naming field starts with `prefix`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        [&self.name, &self.design_name, &self.nickname]
            .into_iter()
            .any(|field| field.as_deref().is_some_and(|n| n.starts_with(prefix)))
    }

    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.design_name.as_deref())
            .or(self.nickname.as_deref())
            .unwrap_or("<unnamed>")
    }

    pub fn resolved_id(&self) -> Option<i64> {
        self.id.or(self.design_id)
    }
}

/// Per-order knobs. Everything is optional; the client fills provider
/// defaults (FirstClass, 4x6) for anything unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderOptions {
    pub mail_class: Option<String>,
    pub size: Option<String>,
    pub mail_date: Option<NaiveDate>,
    pub ext_ref_nbr: Option<String>,
    /// Personalization variables rendered into the design.
    pub variables: BTreeMap<String, String>,
}

/// Outcome of a placed order.
#[derive(Debug, Clone, Serialize)]
pub struct PlacedOrder {
    pub order_id: String,
    pub batch_id: Option<String>,
    pub status: Option<String>,
    pub demo: bool,
}

/// Outcome of an address verification.
#[derive(Debug, Clone, Serialize)]
pub struct AddressCheck {
    pub valid: bool,
    pub reason: Option<String>,
    pub demo: bool,
}

#[async_trait]
pub trait FulfillmentApi: Send + Sync {
    /// Return a valid bearer token, logging in if the cached one is absent
    /// or within the refresh margin of expiry.
    async fn authenticate(&self) -> Result<String, FulfillmentError>;

    /// Fetch the full design catalog (uncached; the service layer caches).
    async fn list_designs(&self) -> Result<Vec<Design>, FulfillmentError>;

    /// Place one postcard order for one recipient.
    async fn place_postcard(
        &self,
        recipient: &Recipient,
        design_id: i64,
        options: &OrderOptions,
    ) -> Result<PlacedOrder, FulfillmentError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), FulfillmentError>;

    async fn get_order(&self, order_id: &str) -> Result<serde_json::Value, FulfillmentError>;

    async fn list_orders(
        &self,
        page: u32,
        per_page: u32,
    ) -> Result<serde_json::Value, FulfillmentError>;

    async fn order_recipients(
        &self,
        order_id: &str,
        page: u32,
        per_page: u32,
    ) -> Result<serde_json::Value, FulfillmentError>;

    async fn verify_recipient(
        &self,
        recipient: &Recipient,
    ) -> Result<AddressCheck, FulfillmentError>;

    fn is_configured(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthRequest<'a> {
    api_key: &'a str,
    api_secret: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    child_ref_nbr: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: String,
    expires: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
struct DesignPage {
    #[serde(default)]
    results: Vec<Design>,
    #[serde(default)]
    data: Vec<Design>,
}

impl DesignPage {
    fn into_designs(self) -> Vec<Design> {
        if self.results.is_empty() { self.data } else { self.results }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRecipient {
    first_name: String,
    last_name: String,
    company: String,
    address: String,
    address2: String,
    city: String,
    state: String,
    zip_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ext_ref_nbr: Option<String>,
    variables: Vec<WireVariable>,
}

#[derive(Debug, Serialize)]
struct WireVariable {
    key: String,
    value: String,
}

impl WireRecipient {
    fn new(recipient: &Recipient, options: &OrderOptions) -> Self {
        Self {
            first_name: recipient.first_name.clone(),
            last_name: recipient.last_name.clone(),
            company: recipient.company.clone(),
            address: recipient.address1.clone(),
            address2: recipient.address2.clone(),
            city: recipient.city.clone(),
            state: recipient.state.clone(),
            zip_code: recipient.zip.clone(),
            ext_ref_nbr: options.ext_ref_nbr.clone(),
            variables: options
                .variables
                .iter()
                .map(|(key, value)| WireVariable {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireReturnAddress {
    company: String,
    first_name: String,
    last_name: String,
    address: String,
    address2: String,
    city: String,
    state: String,
    zip_code: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireAddressing {
    font: String,
    font_color: String,
    exceptional_addressing_type: String,
}

impl Default for WireAddressing {
    fn default() -> Self {
        Self {
            font: "Bradley Hand".to_string(),
            font_color: "Black".to_string(),
            exceptional_addressing_type: "resident".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PostcardOrderRequest {
    mail_class: String,
    size: String,
    #[serde(rename = "designID")]
    design_id: i64,
    recipients: Vec<WireRecipient>,
    return_address: WireReturnAddress,
    #[serde(skip_serializing_if = "Option::is_none")]
    mail_date: Option<String>,
    addressing: WireAddressing,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    #[serde(default)]
    order_id: Option<serde_json::Value>,
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    batch_id: Option<serde_json::Value>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResult {
    #[serde(default)]
    undeliverable: bool,
    #[serde(default)]
    undeliverable_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct VerifyResponse {
    #[serde(default)]
    results: Vec<VerifyResult>,
}

/// Provider ids show up as strings or numbers depending on endpoint.
fn id_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// PcmClient
// ---------------------------------------------------------------------------

/// reqwest-backed `FulfillmentApi` implementation with a cached bearer token.
pub struct PcmClient {
    http: reqwest::Client,
    config: PcmConfig,
    token: Mutex<Option<Cached<String>>>,
}

impl PcmClient {
    pub fn new(config: PcmConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            token: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PcmConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn authed(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, FulfillmentError> {
        let token = self.authenticate().await?;
        Ok(self.http.request(method, self.url(path)).bearer_auth(token))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, FulfillmentError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(FulfillmentError::Api {
            status: status.as_u16(),
            message,
        })
    }

    fn build_order_request(
        &self,
        recipient: &Recipient,
        design_id: i64,
        options: &OrderOptions,
    ) -> PostcardOrderRequest {
        let ret = &self.config.return_address;
        PostcardOrderRequest {
            mail_class: options
                .mail_class
                .clone()
                .unwrap_or_else(|| "FirstClass".to_string()),
            // "46" = 4x6; other provider sizes are "68", "69", "611".
            size: options.size.clone().unwrap_or_else(|| "46".to_string()),
            design_id,
            recipients: vec![WireRecipient::new(recipient, options)],
            return_address: WireReturnAddress {
                company: ret.company.clone(),
                first_name: ret.first_name.clone(),
                last_name: ret.last_name.clone(),
                address: ret.address.clone(),
                address2: ret.address2.clone(),
                city: ret.city.clone(),
                state: ret.state.clone(),
                zip_code: ret.zip.clone(),
            },
            mail_date: options
                .mail_date
                .map(|d| d.format("%Y-%m-%d").to_string()),
            addressing: WireAddressing::default(),
        }
    }
}

#[async_trait]
impl FulfillmentApi for PcmClient {
    async fn authenticate(&self) -> Result<String, FulfillmentError> {
        let (Some(api_key), Some(api_secret)) =
            (self.config.api_key.as_deref(), self.config.api_secret.as_deref())
        else {
            return Err(FulfillmentError::NotConfigured);
        };

        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_valid_with_margin(Utc::now(), Duration::minutes(TOKEN_REFRESH_MARGIN_MINS))
            {
                return Ok(token.value().clone());
            }
        }

        let response = self
            .http
            .post(self.url("/auth/login"))
            .json(&AuthRequest {
                api_key,
                api_secret,
                child_ref_nbr: self.config.child_ref_nbr.as_deref(),
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FulfillmentError::Authentication(format!(
                "login returned {status}: {body}"
            )));
        }

        let auth: AuthResponse = response
            .json()
            .await
            .map_err(|e| FulfillmentError::Authentication(format!("bad login response: {e}")))?;

        tracing::info!(expires = %auth.expires, "PCM authentication successful");
        *cached = Some(Cached::until(auth.token.clone(), auth.expires));
        Ok(auth.token)
    }

    async fn list_designs(&self) -> Result<Vec<Design>, FulfillmentError> {
        if !self.is_configured() {
            tracing::debug!("demo mode: returning empty design catalog");
            return Ok(Vec::new());
        }

        let response = self.authed(reqwest::Method::GET, "/design").await?.send().await?;
        let page: DesignPage = Self::check(response).await?.json().await?;
        Ok(page.into_designs())
    }

    async fn place_postcard(
        &self,
        recipient: &Recipient,
        design_id: i64,
        options: &OrderOptions,
    ) -> Result<PlacedOrder, FulfillmentError> {
        if !self.is_configured() {
            tracing::info!(
                recipient = %recipient.full_name(),
                design_id,
                "demo mode: would place postcard order"
            );
            return Ok(PlacedOrder {
                order_id: format!("demo-{}", Utc::now().timestamp_millis()),
                batch_id: None,
                status: Some("demo".to_string()),
                demo: true,
            });
        }

        let request = self.build_order_request(recipient, design_id, options);
        let response = self
            .authed(reqwest::Method::POST, "/order/postcard")
            .await?
            .json(&request)
            .send()
            .await?;
        let order: OrderResponse = Self::check(response).await?.json().await?;

        let order_id = order
            .order_id
            .as_ref()
            .and_then(id_string)
            .or_else(|| order.id.as_ref().and_then(id_string))
            .ok_or_else(|| {
                FulfillmentError::InvalidResponse("order response carried no order id".to_string())
            })?;

        Ok(PlacedOrder {
            order_id,
            batch_id: order.batch_id.as_ref().and_then(id_string),
            status: order.status,
            demo: false,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), FulfillmentError> {
        if !self.is_configured() {
            tracing::info!(order_id, "demo mode: would cancel order");
            return Ok(());
        }

        let response = self
            .authed(reqwest::Method::DELETE, &format!("/order/{order_id}"))
            .await?
            .send()
            .await?;
        Self::check(response).await?;
        tracing::info!(order_id, "order cancelled");
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> Result<serde_json::Value, FulfillmentError> {
        if !self.is_configured() {
            return Ok(serde_json::json!({ "demo": true, "orderId": order_id, "status": "demo" }));
        }

        let response = self
            .authed(reqwest::Method::GET, &format!("/order/{order_id}"))
            .await?
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn list_orders(
        &self,
        page: u32,
        per_page: u32,
    ) -> Result<serde_json::Value, FulfillmentError> {
        if !self.is_configured() {
            return Ok(serde_json::json!({ "demo": true, "orders": [] }));
        }

        let response = self
            .authed(
                reqwest::Method::GET,
                &format!("/order?page={page}&perPage={per_page}"),
            )
            .await?
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn order_recipients(
        &self,
        order_id: &str,
        page: u32,
        per_page: u32,
    ) -> Result<serde_json::Value, FulfillmentError> {
        if !self.is_configured() {
            return Ok(serde_json::json!({ "demo": true, "results": [] }));
        }

        let response = self
            .authed(
                reqwest::Method::GET,
                &format!("/order/{order_id}/recipients?page={page}&perPage={per_page}"),
            )
            .await?
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn verify_recipient(
        &self,
        recipient: &Recipient,
    ) -> Result<AddressCheck, FulfillmentError> {
        if !self.is_configured() {
            return Ok(AddressCheck {
                valid: true,
                reason: None,
                demo: true,
            });
        }

        let body = serde_json::json!({
            "recipients": [WireRecipient::new(recipient, &OrderOptions::default())],
        });
        let response = self
            .authed(reqwest::Method::POST, "/recipient/verify")
            .await?
            .json(&body)
            .send()
            .await?;
        let verify: VerifyResponse = Self::check(response).await?.json().await?;

        let result = verify.results.into_iter().next().unwrap_or(VerifyResult {
            undeliverable: false,
            undeliverable_reason: None,
        });
        Ok(AddressCheck {
            valid: !result.undeliverable,
            reason: result.undeliverable_reason,
            demo: false,
        })
    }

    fn is_configured(&self) -> bool {
        self.config.is_configured()
    }
}
