//! Offline notification collaborator.
//!
//! Fired after a message is persisted, for participants with no live
//! connection. Delivery transport (push/email) hangs off this trait; the
//! engine itself only hands over a user id and a summary, fire-and-forget.

use async_trait::async_trait;

#[async_trait]
pub trait OfflineNotifier: Send + Sync {
    async fn notify_offline(&self, user_id: i64, resumen: &str);
}

/// Default notifier: records the hand-off in the log stream.
pub struct LogNotifier;

#[async_trait]
impl OfflineNotifier for LogNotifier {
    async fn notify_offline(&self, user_id: i64, resumen: &str) {
        tracing::info!(user_id, resumen, "Offline notification handed off");
    }
}
