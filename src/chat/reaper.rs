//! Background reclamation of idle connections.
//!
//! Transport-level close is not always observable (mobile clients dropping to
//! background, NAT timeouts), so a periodic sweep evicts any connection whose
//! inactivity exceeds the configured timeout. This is the only component that
//! may evict a connection without client-initiated action.

use std::sync::Arc;
use std::time::Duration;

use crate::chat::registry::ChatRegistry;

/// Spawn the idle sweep loop. Each tick snapshots the expired handles under
/// the registry lock, releases it, then disconnects them one by one — the
/// sweep never iterates live registry state while mutating it.
pub fn spawn_idle_reaper(
    registry: Arc<ChatRegistry>,
    interval: Duration,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let cancel = registry.shutdown_token();
        let mut ticker = tokio::time::interval(interval);
        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = registry.idle_connections(timeout);
                    if expired.is_empty() {
                        tracing::debug!("Idle sweep: no expired connections");
                        continue;
                    }
                    let count = expired.len();
                    for conn_id in expired {
                        registry.disconnect(conn_id, "timeout");
                    }
                    tracing::info!(evicted = count, "Idle sweep evicted expired connections");
                }
                _ = cancel.cancelled() => break,
            }
        }
    })
}
