// TRANSACTION LIFECYCLE - EVENT BRIDGE
// Handles: forwarding store events to a Redis pub/sub channel

use redis::{aio::ConnectionManager, AsyncCommands};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::store::TxEvent;

pub async fn connect(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = redis::Client::open(redis_url)?;
    let conn = ConnectionManager::new(client).await?;
    info!("[EVENTS] Connected to Redis");
    Ok(conn)
}

/// Publishes every event as JSON until the store is dropped. Publish failures
/// are logged and skipped; they never affect transaction state.
pub fn spawn_redis_forwarder(
    mut redis: ConnectionManager,
    channel: String,
    mut events: broadcast::Receiver<TxEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("[EVENTS] Forwarder lagged, {} events skipped", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let payload = event.to_json().to_string();
            let published: Result<i64, _> = redis.publish(&channel, payload).await;
            match published {
                Ok(receivers) => debug!("[EVENTS] Published to {} subscribers", receivers),
                Err(e) => warn!("[EVENTS] Publish to {} failed: {}", channel, e),
            }
        }
        info!("[EVENTS] Event stream closed");
    })
}
