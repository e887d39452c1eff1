//! Fulfillment error taxonomy.

use postcards_core::DomainError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FulfillmentError {
    /// API credentials are absent; operations short-circuit into demo
    /// responses instead of reaching this, except authentication itself.
    #[error("fulfillment API not configured")]
    NotConfigured,

    /// Login against the provider failed. Fatal to the triggering operation;
    /// never retried silently.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The provider answered with a non-success status.
    #[error("fulfillment API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The HTTP call itself failed.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The provider answered 2xx but the body was not what we expect.
    #[error("unexpected provider response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Domain(#[from] DomainError),
}
