//! Mailing recipient resolution.
//!
//! A recipient is derived once per subscription from either explicit
//! gift-recipient metadata or the payer's own address, and is then immutable
//! for the life of a mailing batch.

use serde::{Deserialize, Serialize};

use crate::subscription::Subscription;

/// A postal address plus addressee, as the fulfillment provider expects it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    #[serde(default, alias = "firstName")]
    pub first_name: String,
    #[serde(default, alias = "lastName")]
    pub last_name: String,
    #[serde(default)]
    pub company: String,
    #[serde(alias = "address", alias = "line1")]
    pub address1: String,
    #[serde(default, alias = "line2")]
    pub address2: String,
    pub city: String,
    pub state: String,
    #[serde(alias = "zipCode", alias = "postalCode")]
    pub zip: String,
}

impl Recipient {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    /// Resolve the recipient for a subscription: gift metadata first, then
    /// the customer's shipping address, then their billing address.
    pub fn resolve(subscription: &Subscription, customer: &Customer) -> Option<Self> {
        if let Some(raw) = subscription.metadata.get("recipientInfo") {
            match serde_json::from_str::<Recipient>(raw) {
                Ok(recipient) => return Some(recipient),
                Err(err) => {
                    tracing::warn!(
                        subscription_id = %subscription.id,
                        error = %err,
                        "unparseable recipientInfo metadata, falling back to customer address"
                    );
                }
            }
        }

        if let Some(shipping) = &customer.shipping {
            let name = shipping.name.as_deref().or(customer.name.as_deref());
            let (first, last) = split_name(name);
            return Some(Self::from_address(first, last, &shipping.address));
        }

        if let Some(address) = &customer.address {
            let (first, last) = split_name(customer.name.as_deref());
            return Some(Self::from_address(first, last, address));
        }

        None
    }

    fn from_address(first_name: String, last_name: String, address: &Address) -> Self {
        Self {
            first_name,
            last_name,
            company: String::new(),
            address1: address.line1.clone().unwrap_or_default(),
            address2: address.line2.clone().unwrap_or_default(),
            city: address.city.clone().unwrap_or_default(),
            state: address.state.clone().unwrap_or_default(),
            zip: address.postal_code.clone().unwrap_or_default(),
        }
    }
}

fn split_name(name: Option<&str>) -> (String, String) {
    let Some(name) = name else {
        return (String::new(), String::new());
    };
    let mut parts = name.split_whitespace();
    let first = parts.next().unwrap_or_default().to_string();
    let last = parts.collect::<Vec<_>>().join(" ");
    (first, last)
}

/// A provider address block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub line1: Option<String>,
    pub line2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
}

/// Shipping block on a provider customer object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shipping {
    pub name: Option<String>,
    pub address: Address,
}

/// The slice of a provider customer object the recipient resolver reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub shipping: Option<Shipping>,
    pub address: Option<Address>,
}

impl Customer {
    pub fn from_payload(payload: &serde_json::Value) -> Self {
        serde_json::from_value(payload.clone()).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "customer payload had unexpected shape");
            Self {
                id: payload
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                ..Self::default()
            }
        })
    }
}
