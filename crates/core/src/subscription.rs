//! Subscription view over the payment provider's opaque payload.
//!
//! The payment provider owns the subscription lifecycle; this module only
//! reads the fields the fulfillment core needs (billing cadence plus the
//! metadata bag used as the calendar continuation cursor).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::calendar::DayOfYear;
use crate::error::DomainError;

/// Metadata keys written by the fulfillment core into the provider's
/// subscription metadata bag.
pub mod meta {
    /// Day of year the first mailing began (1-365).
    pub const START_DAY: &str = "pcm_start_day";
    /// Day of year of the most recently scheduled mailing; the renewal cursor.
    pub const LAST_DAY: &str = "pcm_last_day";
    /// JSON list of fulfillment order identifiers.
    pub const ORDER_IDS: &str = "pcm_order_ids";
    /// Number of mailings scheduled in the most recent batch.
    pub const DURATION: &str = "pcm_duration";
    pub const CAMPAIGN_START: &str = "pcm_campaign_start";
    pub const ORDERS_PLACED: &str = "pcm_orders_placed";
    pub const RENEWAL_DATE: &str = "pcm_renewal_date";
    pub const RENEWAL_START_DAY: &str = "pcm_renewal_start_day";
}

/// Opaque provider-issued subscription identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Billing cycle as recorded by the storefront in subscription metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Trial,
    Monthly,
    Quarterly,
    Annual,
}

impl BillingCycle {
    /// Parse the storefront's free-form `billingCycle` metadata value.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "trial" => Some(Self::Trial),
            "monthly" => Some(Self::Monthly),
            "quarterly" => Some(Self::Quarterly),
            "annual" | "yearly" => Some(Self::Annual),
            _ => None,
        }
    }

    /// Mailings per billing period for this cycle.
    pub fn mailing_duration(self) -> u32 {
        match self {
            Self::Trial => 7,
            Self::Monthly => 30,
            Self::Quarterly => 90,
            Self::Annual => 365,
        }
    }
}

/// Raw recurring interval from the provider's price object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Day,
    Week,
    Month,
    Year,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingInterval {
    pub unit: IntervalUnit,
    pub count: u32,
}

impl BillingInterval {
    /// Mailings per billing period derived from the raw interval. Used only
    /// when no recognized billing-cycle metadata is present.
    pub fn mailing_duration(self) -> u32 {
        match self.unit {
            IntervalUnit::Day => self.count,
            IntervalUnit::Week => self.count.saturating_mul(7),
            IntervalUnit::Month => self.count.saturating_mul(30),
            IntervalUnit::Year => 365,
        }
    }
}

/// The slice of a provider subscription object this core reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub customer_id: String,
    pub metadata: BTreeMap<String, String>,
    pub billing_cycle: Option<BillingCycle>,
    pub interval: Option<BillingInterval>,
    pub trialing: bool,
}

impl Subscription {
    /// Parse the provider's subscription payload. Only `id` is required; the
    /// payload shape is otherwise an opaque contract owned by the provider.
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, DomainError> {
        let id = payload
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DomainError::invalid_payload("subscription missing id"))?;

        let customer_id = payload
            .get("customer")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let mut metadata = BTreeMap::new();
        if let Some(map) = payload.get("metadata").and_then(|v| v.as_object()) {
            for (k, v) in map {
                if let Some(s) = v.as_str() {
                    metadata.insert(k.clone(), s.to_string());
                }
            }
        }

        let billing_cycle = metadata.get("billingCycle").and_then(|v| BillingCycle::parse(v));

        let recurring = payload
            .pointer("/items/data/0/price/recurring")
            .unwrap_or(&serde_json::Value::Null);
        let interval = recurring
            .get("interval")
            .and_then(|v| v.as_str())
            .and_then(|unit| {
                let unit = match unit {
                    "day" => IntervalUnit::Day,
                    "week" => IntervalUnit::Week,
                    "month" => IntervalUnit::Month,
                    "year" => IntervalUnit::Year,
                    _ => return None,
                };
                let count = recurring
                    .get("interval_count")
                    .and_then(|v| v.as_u64())
                    .and_then(|c| u32::try_from(c).ok())
                    .unwrap_or(1);
                Some(BillingInterval { unit, count })
            });

        let trialing = metadata.get("type").map(String::as_str) == Some("trial")
            || payload.get("trial_end").map(|v| !v.is_null()).unwrap_or(false);

        Ok(Self {
            id: SubscriptionId::new(id),
            customer_id,
            metadata,
            billing_cycle,
            interval,
            trialing,
        })
    }

    /// Number of mailings for one billing period: trial wins over everything,
    /// then the storefront's billing-cycle metadata, then the raw interval,
    /// then a monthly default.
    pub fn mailing_duration(&self) -> u32 {
        if self.trialing {
            return 7;
        }
        if let Some(cycle) = self.billing_cycle {
            return cycle.mailing_duration();
        }
        self.interval
            .map(BillingInterval::mailing_duration)
            .unwrap_or(30)
    }

    /// The renewal continuation cursor, if the metadata carries a valid one.
    pub fn continuation_day(&self) -> Option<DayOfYear> {
        self.metadata.get(meta::LAST_DAY)?.parse().ok()
    }

    /// Fulfillment order identifiers recorded for this subscription.
    pub fn order_ids(&self) -> Vec<String> {
        let Some(raw) = self.metadata.get(meta::ORDER_IDS) else {
            return Vec::new();
        };
        match serde_json::from_str::<Vec<serde_json::Value>>(raw) {
            Ok(values) => values
                .iter()
                .filter_map(|v| match v {
                    serde_json::Value::String(s) => Some(s.clone()),
                    serde_json::Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect(),
            Err(err) => {
                tracing::warn!(subscription_id = %self.id, error = %err, "unparseable pcm_order_ids metadata");
                Vec::new()
            }
        }
    }
}
