//! Redis pub/sub backbone for cross-instance relay.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::mpsc;

use super::{BusMessage, EventBus};

/// Delay between reconnect attempts when the pub/sub connection drops.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

pub struct RedisBus {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisBus {
    /// Connect and verify the backbone with a PING before accepting it.
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: () = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<i64> = conn.publish(channel, payload).await;
        if let Err(e) = result {
            // Relay is best-effort: local delivery already happened.
            tracing::warn!(channel, error = %e, "Relay publish failed");
        }
    }

    async fn subscribe(&self, pattern: &str) -> mpsc::UnboundedReceiver<BusMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let pattern = pattern.to_string();

        tokio::spawn(async move {
            loop {
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(e) = pubsub.psubscribe(&pattern).await {
                            tracing::warn!(pattern = %pattern, error = %e, "Relay psubscribe failed");
                        } else {
                            tracing::info!(pattern = %pattern, "Relay subscription established");
                            let mut stream = pubsub.on_message();
                            while let Some(msg) = stream.next().await {
                                let channel = msg.get_channel_name().to_string();
                                let payload: Vec<u8> = match msg.get_payload() {
                                    Ok(p) => p,
                                    Err(e) => {
                                        tracing::warn!(channel = %channel, error = %e, "Unreadable relay payload");
                                        continue;
                                    }
                                };
                                if tx.send(BusMessage { channel, payload }).is_err() {
                                    return;
                                }
                            }
                            tracing::warn!(pattern = %pattern, "Relay subscription lost, reconnecting");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Relay backbone unreachable, retrying");
                    }
                }

                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
        });

        rx
    }
}
