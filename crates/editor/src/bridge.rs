// Cross-instance fan-out over a pub/sub backbone.
//
// Every room owns three channels: `{room}:update`, `{room}:awareness` and
// `{room}:delete`. Published payloads are prefixed with the publishing
// instance's 16-byte id; a subscriber that sees its own id drops the
// message, which is what keeps horizontally-scaled instances from echoing
// each other's broadcasts back into the room.

use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::registry::RoomRegistry;
use crate::session::DocSession;

const CHANNEL_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("pub/sub command failed: {0}")]
    Redis(#[from] redis::RedisError),
}

pub fn update_channel(room_id: &str) -> String {
    format!("{room_id}:update")
}

pub fn awareness_channel(room_id: &str) -> String {
    format!("{room_id}:awareness")
}

pub fn delete_channel(room_id: &str) -> String {
    format!("{room_id}:delete")
}

/// Prefix `payload` with the publishing instance's id.
pub fn tag_payload(instance_id: Uuid, payload: &[u8]) -> Vec<u8> {
    let mut tagged = Vec::with_capacity(16 + payload.len());
    tagged.extend_from_slice(instance_id.as_bytes());
    tagged.extend_from_slice(payload);
    tagged
}

/// Split a received payload into its origin tag and body.
/// Returns `None` for payloads too short to carry a tag.
pub fn split_tagged(payload: &[u8]) -> Option<(Uuid, &[u8])> {
    if payload.len() < 16 {
        return None;
    }
    let (tag, body) = payload.split_at(16);
    let origin = Uuid::from_slice(tag).ok()?;
    Some((origin, body))
}

/// Pub/sub backbone. `Redis` spans server instances; `Memory` wires
/// several in-process registries together for tests.
#[derive(Clone)]
pub enum Broker {
    Redis(RedisBroker),
    Memory(MemoryHub),
}

impl Broker {
    pub async fn redis(client: redis::Client) -> Result<Self, BridgeError> {
        let publish_conn = client.get_multiplexed_async_connection().await?;
        Ok(Self::Redis(RedisBroker { client, publish_conn }))
    }

    pub fn memory() -> Self {
        Self::Memory(MemoryHub::default())
    }

    pub async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
        match self {
            Self::Redis(broker) => {
                let mut conn = broker.publish_conn.clone();
                let _: i64 = conn.publish(channel, payload).await?;
                Ok(())
            }
            Self::Memory(hub) => {
                // No subscribers is not an error.
                let _ = hub.sender(channel).send(payload);
                Ok(())
            }
        }
    }

    /// Subscribe to a set of channels; messages arrive interleaved on one
    /// feed. Dropping the feed tears the subscription down.
    pub async fn subscribe(&self, channels: Vec<String>) -> Result<BrokerFeed, BridgeError> {
        match self {
            Self::Redis(broker) => {
                let mut pubsub = broker.client.get_async_pubsub().await?;
                for channel in &channels {
                    pubsub.subscribe(channel).await?;
                }
                Ok(BrokerFeed::Redis(pubsub))
            }
            Self::Memory(hub) => {
                let (tx, rx) = mpsc::unbounded_channel();
                for channel in channels {
                    let mut source = hub.sender(&channel).subscribe();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        loop {
                            match source.recv().await {
                                Ok(payload) => {
                                    if tx.send((channel.clone(), payload)).is_err() {
                                        break;
                                    }
                                }
                                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                    warn!(channel = %channel, skipped, "memory hub lagged");
                                }
                                Err(broadcast::error::RecvError::Closed) => break,
                            }
                        }
                    });
                }
                Ok(BrokerFeed::Memory(rx))
            }
        }
    }
}

#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    publish_conn: MultiplexedConnection,
}

/// In-process pub/sub hub. Clones share the same channel space.
#[derive(Clone, Default)]
pub struct MemoryHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>>,
}

impl MemoryHub {
    fn sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        let mut channels = self.channels.lock().expect("memory hub lock poisoned");
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_BUFFER).0)
            .clone()
    }
}

/// One room's inbound subscription feed.
pub enum BrokerFeed {
    Redis(redis::aio::PubSub),
    Memory(mpsc::UnboundedReceiver<(String, Vec<u8>)>),
}

impl BrokerFeed {
    pub async fn recv(&mut self) -> Option<(String, Vec<u8>)> {
        match self {
            Self::Redis(pubsub) => {
                let message = pubsub.on_message().next().await?;
                let channel = message.get_channel_name().to_string();
                let payload = message.get_payload_bytes().to_vec();
                Some((channel, payload))
            }
            Self::Memory(rx) => rx.recv().await,
        }
    }
}

/// Inbound half of a room's bridge: applies remote deltas through the
/// session's normal apply paths and tears the room down on a remote
/// delete. Exits when the subscription closes or the session is gone.
pub(crate) fn spawn_bridge(
    room_id: String,
    mut feed: BrokerFeed,
    instance_id: Uuid,
    session: Weak<DocSession>,
    registry: Weak<RoomRegistry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((channel, payload)) = feed.recv().await {
            let Some((origin, body)) = split_tagged(&payload) else {
                warn!(room_id = %room_id, channel = %channel, "dropping untagged bridge payload");
                continue;
            };
            if origin == instance_id {
                continue;
            }

            if channel == delete_channel(&room_id) {
                if let Some(registry) = registry.upgrade() {
                    registry.remove(&room_id).await;
                }
                break;
            }

            let Some(session) = session.upgrade() else {
                break;
            };

            let applied = if channel == update_channel(&room_id) {
                session.apply_remote_update(body).await
            } else if channel == awareness_channel(&room_id) {
                session.apply_remote_awareness(body).await
            } else {
                Ok(())
            };

            if let Err(error) = applied {
                warn!(
                    room_id = %room_id,
                    channel = %channel,
                    error = %error,
                    "failed to apply remote delta"
                );
            }
        }

        debug!(room_id = %room_id, "bridge subscription closed");
    })
}
