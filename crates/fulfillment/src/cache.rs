//! Time-boxed cache values with explicit expiry.
//!
//! The bearer token and the design catalog both live behind a `Cached<T>`
//! carrying its own `expires_at`, with a pure validity predicate so tests can
//! pass an explicit clock.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone)]
pub struct Cached<T> {
    value: T,
    expires_at: DateTime<Utc>,
}

impl<T> Cached<T> {
    /// Cache a value until an absolute expiry instant (e.g. a token expiry
    /// reported by the provider).
    pub fn until(value: T, expires_at: DateTime<Utc>) -> Self {
        Self { value, expires_at }
    }

    /// Cache a value for a fixed time-to-live from now.
    pub fn with_ttl(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Utc::now() + ttl,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Valid only while at least `margin` remains before expiry. Used for the
    /// bearer token, which is refreshed five minutes early.
    pub fn is_valid_with_margin(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin < self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_until_expiry() {
        let now = Utc::now();
        let cached = Cached::until("token", now + Duration::minutes(10));
        assert!(cached.is_valid(now));
        assert!(!cached.is_valid(now + Duration::minutes(10)));
        assert!(!cached.is_valid(now + Duration::hours(1)));
    }

    #[test]
    fn margin_shrinks_the_validity_window() {
        let now = Utc::now();
        let cached = Cached::until("token", now + Duration::minutes(10));
        let margin = Duration::minutes(5);
        assert!(cached.is_valid_with_margin(now, margin));
        assert!(cached.is_valid_with_margin(now + Duration::minutes(4), margin));
        assert!(!cached.is_valid_with_margin(now + Duration::minutes(5), margin));
        assert!(!cached.is_valid_with_margin(now + Duration::minutes(6), margin));
    }

    #[test]
    fn ttl_expiry_is_relative_to_now() {
        let cached = Cached::with_ttl(vec![1, 2, 3], Duration::hours(1));
        assert!(cached.is_valid(Utc::now()));
        assert!(!cached.is_valid(Utc::now() + Duration::hours(2)));
    }
}
