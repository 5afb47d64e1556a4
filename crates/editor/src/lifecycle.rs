// Room lifecycle consumer.
//
// Create/delete/remove-user events arrive on a Redis stream and are read
// through a consumer group, one batch at a time, acknowledged only after
// the handler returns cleanly. A failed handler leaves the entry pending
// for redelivery, so every handler is idempotent. Undecodable events are
// acknowledged and dropped so a poison entry cannot wedge the stream.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use peerpad_common::event::{RoomEvent, RoomEventKind};

use crate::bridge;
use crate::registry::{RegistryError, RoomRegistry};

const EVENT_FIELD: &str = "payload";
const READ_COUNT: usize = 8;
const READ_BLOCK_MS: usize = 5_000;
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

pub struct LifecycleConsumer {
    client: redis::Client,
    stream: String,
    group: String,
    consumer: String,
    registry: Arc<RoomRegistry>,
}

impl LifecycleConsumer {
    pub fn new(
        client: redis::Client,
        stream: String,
        group: String,
        registry: Arc<RoomRegistry>,
    ) -> Self {
        let consumer = format!("editor-{}", registry.instance_id());
        Self { client, stream, group, consumer, registry }
    }

    /// Consume forever. Transport failures back off and reconnect; they
    /// never kill the consumer loop.
    pub async fn run(self) {
        loop {
            if let Err(error) = self.consume().await {
                warn!(
                    error = %format!("{error:#}"),
                    "room event consumer disconnected, retrying"
                );
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
        }
    }

    async fn consume(&self) -> anyhow::Result<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("failed to connect room event consumer")?;

        let created: Result<(), redis::RedisError> =
            conn.xgroup_create_mkstream(&self.stream, &self.group, "$").await;
        if let Err(error) = created {
            // The group surviving a restart is the normal case.
            if !error.to_string().contains("BUSYGROUP") {
                return Err(error).context("failed to create room event consumer group");
            }
        }

        // Drain entries delivered to this consumer but never acknowledged
        // (crash redelivery), then block on new ones.
        while self.read_batch(&mut conn, "0").await? > 0 {}
        loop {
            self.read_batch(&mut conn, ">").await?;
        }
    }

    async fn read_batch(
        &self,
        conn: &mut MultiplexedConnection,
        cursor: &str,
    ) -> anyhow::Result<usize> {
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(READ_COUNT)
            .block(READ_BLOCK_MS);

        let reply: StreamReadReply = conn
            .xread_options(&[self.stream.as_str()], &[cursor], &options)
            .await
            .context("failed to read room events")?;

        let mut handled = 0;
        for key in reply.keys {
            for entry in key.ids {
                handled += 1;
                self.process(conn, &entry).await?;
            }
        }
        Ok(handled)
    }

    /// Handle one stream entry. Only transport errors propagate; handler
    /// failures are logged and leave the entry unacknowledged.
    async fn process(
        &self,
        conn: &mut MultiplexedConnection,
        entry: &StreamId,
    ) -> anyhow::Result<()> {
        let event = entry
            .map
            .get(EVENT_FIELD)
            .ok_or_else(|| anyhow::anyhow!("missing {EVENT_FIELD} field"))
            .and_then(|value| {
                redis::from_redis_value::<Vec<u8>>(value).context("payload is not bytes")
            })
            .and_then(|bytes| {
                serde_json::from_slice::<RoomEvent>(&bytes).context("payload is not a room event")
            });

        match event {
            Ok(event) => {
                if let Err(error) = handle_event(&self.registry, &event).await {
                    warn!(
                        id = %entry.id,
                        room_id = %event.room.room_id,
                        error = %format!("{error:#}"),
                        "room event handler failed, leaving unacknowledged"
                    );
                    return Ok(());
                }
                self.ack(conn, &entry.id).await
            }
            Err(error) => {
                warn!(
                    id = %entry.id,
                    error = %format!("{error:#}"),
                    "undecodable room event, acknowledging and dropping"
                );
                self.ack(conn, &entry.id).await
            }
        }
    }

    async fn ack(&self, conn: &mut MultiplexedConnection, id: &str) -> anyhow::Result<()> {
        let _: i64 = conn
            .xack(&self.stream, &self.group, &[id])
            .await
            .context("failed to acknowledge room event")?;
        Ok(())
    }
}

/// Dispatch one room event against the registry. Idempotent across
/// redeliveries.
pub async fn handle_event(registry: &Arc<RoomRegistry>, event: &RoomEvent) -> anyhow::Result<()> {
    let room_id = &event.room.room_id;

    match event.event_type {
        RoomEventKind::Create => {
            info!(room_id = %room_id, "room create event");
            registry.revive(room_id).await;
            match registry.ensure(room_id).await {
                Ok(_) => Ok(()),
                // Deleted again while pre-warming: delete wins.
                Err(RegistryError::RoomDeleted(_)) => Ok(()),
                Err(error) => Err(error).context("failed to pre-warm room"),
            }
        }
        RoomEventKind::Delete => {
            info!(room_id = %room_id, "room delete event");
            registry.remove(room_id).await;
            registry
                .store()
                .clear(room_id)
                .await
                .context("failed to clear room history")?;

            let payload = bridge::tag_payload(registry.instance_id(), room_id.as_bytes());
            registry
                .broker()
                .publish(&bridge::delete_channel(room_id), payload)
                .await
                .context("failed to publish room deletion")?;
            Ok(())
        }
        RoomEventKind::RemoveUser => {
            // Authorization is re-checked by the gateway on every upgrade;
            // there is nothing to tear down here.
            debug!(
                room_id = %room_id,
                removed_user_id = ?event.removed_user_id,
                "remove-user event"
            );
            Ok(())
        }
    }
}
