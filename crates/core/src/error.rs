//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic domain failures (validation, payload
/// shape, address resolution). Transport and provider concerns belong to the
/// fulfillment crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. a day of year outside 1-365).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Subscription metadata carried a value we could not interpret.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// A provider payload was missing a required field or had the wrong shape.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// No shipping or billing address could be resolved for the recipient.
    #[error("no shipping address")]
    MissingShippingAddress,
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_metadata(msg: impl Into<String>) -> Self {
        Self::InvalidMetadata(msg.into())
    }

    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }
}
