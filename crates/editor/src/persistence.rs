// Durable update log and the per-session persistence binder.
//
// Each room's document history is an append-only list of CRDT update
// payloads at `{room}:updates`. Session construction replays the whole
// list into a fresh replica before any connection attaches; afterwards a
// binder task appends every locally-produced update and forwards it (and
// every awareness delta) to the pub/sub backbone. The binder drains its
// event channel before exiting, so teardown cannot lose a pending write.

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bridge::{self, Broker};
use crate::session::SessionEvent;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("update store command failed: {0}")]
    Redis(#[from] redis::RedisError),
}

fn updates_key(room_id: &str) -> String {
    format!("{room_id}:updates")
}

/// Append-only store of document updates, one log per room.
#[derive(Clone)]
pub enum UpdateStore {
    Redis(RedisUpdateStore),
    Memory(MemoryUpdateStore),
}

impl UpdateStore {
    pub async fn redis(client: &redis::Client) -> Result<Self, StoreError> {
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self::Redis(RedisUpdateStore { conn }))
    }

    pub fn memory() -> Self {
        Self::Memory(MemoryUpdateStore::default())
    }

    /// Load the full stored update log for a room, oldest first.
    pub async fn load_updates(&self, room_id: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        match self {
            Self::Redis(store) => {
                let mut conn = store.conn.clone();
                let rows: Vec<Vec<u8>> = conn.lrange(updates_key(room_id), 0, -1).await?;
                Ok(rows)
            }
            Self::Memory(store) => {
                Ok(store.logs.read().await.get(room_id).cloned().unwrap_or_default())
            }
        }
    }

    /// Append one update payload to a room's log.
    pub async fn append_update(&self, room_id: &str, update: &[u8]) -> Result<(), StoreError> {
        match self {
            Self::Redis(store) => {
                let mut conn = store.conn.clone();
                let _: i64 = conn.rpush(updates_key(room_id), update).await?;
                Ok(())
            }
            Self::Memory(store) => {
                store
                    .logs
                    .write()
                    .await
                    .entry(room_id.to_string())
                    .or_default()
                    .push(update.to_vec());
                Ok(())
            }
        }
    }

    /// Drop a room's log entirely (room deletion).
    pub async fn clear(&self, room_id: &str) -> Result<(), StoreError> {
        match self {
            Self::Redis(store) => {
                let mut conn = store.conn.clone();
                let _: i64 = conn.del(updates_key(room_id)).await?;
                Ok(())
            }
            Self::Memory(store) => {
                store.logs.write().await.remove(room_id);
                Ok(())
            }
        }
    }
}

#[derive(Clone)]
pub struct RedisUpdateStore {
    conn: MultiplexedConnection,
}

#[derive(Clone, Default)]
pub struct MemoryUpdateStore {
    logs: Arc<RwLock<HashMap<String, Vec<Vec<u8>>>>>,
}

/// Always-on persistence binder for one session.
///
/// Consumes the session's event tap: document updates are appended to the
/// store and published to the room's update channel; awareness deltas are
/// published only. Store or publish failures are logged and never fed back
/// into the session.
pub(crate) fn spawn_binder(
    room_id: String,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    store: UpdateStore,
    broker: Broker,
    instance_id: Uuid,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::DocUpdate { update } => {
                    if let Err(error) = store.append_update(&room_id, &update).await {
                        warn!(room_id = %room_id, error = %error, "failed to persist update");
                    }

                    let payload = bridge::tag_payload(instance_id, &update);
                    if let Err(error) =
                        broker.publish(&bridge::update_channel(&room_id), payload).await
                    {
                        warn!(room_id = %room_id, error = %error, "failed to publish update");
                    }
                }
                SessionEvent::AwarenessDelta { update } => {
                    let payload = bridge::tag_payload(instance_id, &update);
                    if let Err(error) =
                        broker.publish(&bridge::awareness_channel(&room_id), payload).await
                    {
                        warn!(room_id = %room_id, error = %error, "failed to publish awareness");
                    }
                }
            }
        }

        debug!(room_id = %room_id, "persistence binder drained");
    })
}
