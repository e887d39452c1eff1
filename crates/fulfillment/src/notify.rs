//! Admin escalation seam.
//!
//! Orders that exhaust their retries, unverifiable addresses, and partial
//! batch failures escalate through an `AdminNotifier`. The default sink
//! writes structured error events; deployments can plug in email or chat.

use async_trait::async_trait;

#[async_trait]
pub trait AdminNotifier: Send + Sync {
    async fn notify(&self, subject: &str, details: serde_json::Value);
}

/// Notifier that emits each escalation as an error-level tracing event.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl AdminNotifier for LogNotifier {
    async fn notify(&self, subject: &str, details: serde_json::Value) {
        tracing::error!(subject, %details, "admin notification");
    }
}
