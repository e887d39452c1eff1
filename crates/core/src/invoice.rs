//! Invoice view over the payment provider's payload.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// The slice of a provider invoice object the renewal handler needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    /// Subscription the invoice bills, if any. One-time payments carry none.
    pub subscription: Option<String>,
    pub billing_reason: Option<String>,
}

impl Invoice {
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, DomainError> {
        let id = payload
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DomainError::invalid_payload("invoice missing id"))?;

        Ok(Self {
            id: id.to_string(),
            subscription: payload
                .get("subscription")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            billing_reason: payload
                .get("billing_reason")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }

    /// True for the subscription's first invoice, which the creation handler
    /// already covers; renewal logic must skip it.
    pub fn is_initial(&self) -> bool {
        self.billing_reason.as_deref() == Some("subscription_create")
    }
}
