//! Outbound notification abstraction.

use async_trait::async_trait;

use crate::error::NotifyError;

/// Delivers a formatted notification to an external chat destination.
///
/// Shared by the mailbox processors and the webhook routes, so both paths get
/// the same delivery and retry behavior.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Channel name for logs (e.g. "telegram").
    fn name(&self) -> &str;

    /// Deliver `text` to the destination identified by `destination`.
    async fn notify(&self, destination: &str, text: &str) -> Result<(), NotifyError>;
}
