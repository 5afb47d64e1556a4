// Process-wide map from room id to its document session.
//
// Construction is exactly-once per room id even under concurrent callers:
// the map lock is held only long enough to clone a per-room once-cell, so
// building one room never serializes the others. A session is wired to the
// update store and the pub/sub backbone before it is exposed. Deleted
// rooms leave a tombstone so that a delete racing an in-flight
// construction always wins; only a fresh create event revives the room.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, OnceCell};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::{self, BridgeError, Broker};
use crate::persistence::{self, UpdateStore};
use crate::rooms::RoomServiceClient;
use crate::session::DocSession;

const STORE_LOAD_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("room {0} has been deleted")]
    RoomDeleted(String),
    #[error("failed to wire room {room_id} to the pub/sub backbone: {source}")]
    Bridge {
        room_id: String,
        #[source]
        source: BridgeError,
    },
}

struct RegistryState {
    cells: HashMap<String, Arc<OnceCell<Arc<DocSession>>>>,
    tombstones: HashSet<String>,
}

pub struct RoomRegistry {
    instance_id: Uuid,
    store: UpdateStore,
    broker: Broker,
    rooms: RoomServiceClient,
    state: Mutex<RegistryState>,
}

impl RoomRegistry {
    pub fn new(
        instance_id: Uuid,
        store: UpdateStore,
        broker: Broker,
        rooms: RoomServiceClient,
    ) -> Arc<Self> {
        Arc::new(Self {
            instance_id,
            store,
            broker,
            rooms,
            state: Mutex::new(RegistryState {
                cells: HashMap::new(),
                tombstones: HashSet::new(),
            }),
        })
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn store(&self) -> &UpdateStore {
        &self.store
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Return the room's session, constructing it exactly once if absent.
    pub async fn ensure(self: &Arc<Self>, room_id: &str) -> Result<Arc<DocSession>, RegistryError> {
        loop {
            let cell = {
                let mut state = self.state.lock().await;
                if state.tombstones.contains(room_id) {
                    return Err(RegistryError::RoomDeleted(room_id.to_string()));
                }
                state
                    .cells
                    .entry(room_id.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new()))
                    .clone()
            };

            let session = cell.get_or_try_init(|| self.build_session(room_id)).await?.clone();

            let mut state = self.state.lock().await;

            // A delete that landed while we were constructing wins.
            if state.tombstones.contains(room_id) {
                state.cells.remove(room_id);
                drop(state);
                session.destroy().await;
                return Err(RegistryError::RoomDeleted(room_id.to_string()));
            }

            // A stale cell from a racing teardown is discarded and the
            // construction retried, so a ghost session is never exposed.
            if session.is_destroyed().await {
                if let Some(existing) = state.cells.get(room_id) {
                    if Arc::ptr_eq(existing, &cell) {
                        state.cells.remove(room_id);
                    }
                }
                continue;
            }

            return Ok(session);
        }
    }

    /// Return the room's session if one exists.
    pub async fn get(&self, room_id: &str) -> Option<Arc<DocSession>> {
        let state = self.state.lock().await;
        state.cells.get(room_id).and_then(|cell| cell.get().cloned())
    }

    /// Destroy and remove the room, leaving a tombstone. Safe to call when
    /// the session is already gone.
    pub async fn remove(&self, room_id: &str) {
        let cell = {
            let mut state = self.state.lock().await;
            state.tombstones.insert(room_id.to_string());
            state.cells.remove(room_id)
        };

        if let Some(cell) = cell {
            if let Some(session) = cell.get() {
                session.destroy().await;
                info!(room_id = %room_id, "destroyed session for deleted room");
            }
        }
    }

    /// Clear a room's tombstone; a fresh create event is the only path
    /// that may resurrect a deleted room.
    pub async fn revive(&self, room_id: &str) {
        self.state.lock().await.tombstones.remove(room_id);
    }

    /// Retire the session when its last connection has departed. Re-checks
    /// under the registry lock so it is safe to race a new `ensure`.
    pub async fn retire_if_empty(&self, room_id: &str) {
        let session = {
            let mut state = self.state.lock().await;
            let Some(cell) = state.cells.get(room_id) else {
                return;
            };
            let Some(session) = cell.get().cloned() else {
                return;
            };
            if session.connection_count().await > 0 {
                return;
            }
            state.cells.remove(room_id);
            session
        };

        session.destroy().await;
        info!(room_id = %room_id, "retired empty session");
    }

    async fn build_session(
        self: &Arc<Self>,
        room_id: &str,
    ) -> Result<Arc<DocSession>, RegistryError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Arc::new(DocSession::new(room_id, events_tx));

        // Subscribe before replaying history so no published delta can
        // slip into the gap between the two.
        let feed = self
            .broker
            .subscribe(vec![
                bridge::update_channel(room_id),
                bridge::awareness_channel(room_id),
                bridge::delete_channel(room_id),
            ])
            .await
            .map_err(|source| RegistryError::Bridge { room_id: room_id.to_string(), source })?;

        match tokio::time::timeout(STORE_LOAD_TIMEOUT, self.store.load_updates(room_id)).await {
            Ok(Ok(updates)) if updates.is_empty() => {
                self.seed_template(&session, room_id).await;
            }
            Ok(Ok(updates)) => {
                debug!(room_id = %room_id, count = updates.len(), "replaying stored updates");
                session.replay_updates(updates).await;
            }
            Ok(Err(error)) => {
                warn!(
                    room_id = %room_id,
                    error = %error,
                    "failed to load stored updates, continuing with empty document"
                );
            }
            Err(_) => {
                warn!(
                    room_id = %room_id,
                    "stored update load timed out, continuing with empty document"
                );
            }
        }

        persistence::spawn_binder(
            room_id.to_string(),
            events_rx,
            self.store.clone(),
            self.broker.clone(),
            self.instance_id,
        );
        bridge::spawn_bridge(
            room_id.to_string(),
            feed,
            self.instance_id,
            Arc::downgrade(&session),
            Arc::downgrade(self),
        );

        info!(room_id = %room_id, "document session ready");
        Ok(session)
    }

    /// Best-effort template seeding for a brand-new room. Any failure
    /// along the way leaves the document empty rather than failing the
    /// room.
    async fn seed_template(&self, session: &DocSession, room_id: &str) {
        let room = match self.rooms.get_room(room_id).await {
            Ok(Some(room)) => room,
            Ok(None) => {
                debug!(room_id = %room_id, "room unknown to room service, seeding empty");
                return;
            }
            Err(error) => {
                warn!(room_id = %room_id, error = %error, "room lookup failed, seeding empty");
                return;
            }
        };

        let template = match self
            .rooms
            .get_question_template(&room.question_id, &room.question_lang_slug)
            .await
        {
            Ok(Some(code)) => code,
            Ok(None) => {
                debug!(
                    room_id = %room_id,
                    question_id = %room.question_id,
                    lang_slug = %room.question_lang_slug,
                    "no template for question, seeding empty"
                );
                return;
            }
            Err(error) => {
                warn!(room_id = %room_id, error = %error, "template fetch failed, seeding empty");
                return;
            }
        };

        if let Err(error) = session.seed_text(&template).await {
            warn!(room_id = %room_id, error = %error, "failed to seed template");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::Room;
    use crate::session::DOC_TEXT;
    use peerpad_common::protocol;
    use std::time::Instant;
    use yrs::sync::Awareness;
    use yrs::{Doc, Text, Transact};

    fn test_registry() -> Arc<RoomRegistry> {
        RoomRegistry::new(
            Uuid::new_v4(),
            UpdateStore::memory(),
            Broker::memory(),
            RoomServiceClient::memory(),
        )
    }

    async fn seeded_rooms_client() -> RoomServiceClient {
        let rooms = RoomServiceClient::memory();
        rooms
            .insert_room(Room {
                room_id: "r1".into(),
                user_ids: vec![1, 2],
                question_id: "q42".into(),
                question_lang_slug: "python3".into(),
            })
            .await;
        rooms.insert_template("q42", "python3", "print('hi')").await;
        rooms
    }

    fn encoded_update(text: &str) -> Vec<u8> {
        let doc = Doc::with_client_id(99);
        let content = doc.get_or_insert_text(DOC_TEXT);
        let mut txn = doc.transact_mut();
        content.push(&mut txn, text);
        txn.encode_update_v1()
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let registry = test_registry();
        let first = registry.ensure("r1").await.expect("ensure should succeed");
        let second = registry.ensure("r1").await.expect("ensure should succeed");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn concurrent_ensures_construct_one_session() {
        let registry = test_registry();
        let (a, b) = tokio::join!(registry.ensure("r1"), registry.ensure("r1"));
        let a = a.expect("first ensure should succeed");
        let b = b.expect("second ensure should succeed");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn ensure_replays_stored_updates() {
        let store = UpdateStore::memory();
        store
            .append_update("r1", &encoded_update("stored-history"))
            .await
            .expect("append should succeed");

        let registry =
            RoomRegistry::new(Uuid::new_v4(), store, Broker::memory(), RoomServiceClient::memory());

        let session = registry.ensure("r1").await.expect("ensure should succeed");
        assert_eq!(session.text_content().await, "stored-history");
    }

    #[tokio::test]
    async fn ensure_seeds_template_for_fresh_room() {
        let registry = RoomRegistry::new(
            Uuid::new_v4(),
            UpdateStore::memory(),
            Broker::memory(),
            seeded_rooms_client().await,
        );

        let session = registry.ensure("r1").await.expect("ensure should succeed");
        assert_eq!(session.text_content().await, "print('hi')");
    }

    #[tokio::test]
    async fn ensure_skips_template_when_history_exists() {
        let store = UpdateStore::memory();
        store.append_update("r1", &encoded_update("edited")).await.expect("append should succeed");

        let registry =
            RoomRegistry::new(Uuid::new_v4(), store, Broker::memory(), seeded_rooms_client().await);

        let session = registry.ensure("r1").await.expect("ensure should succeed");
        assert_eq!(session.text_content().await, "edited");
    }

    #[tokio::test]
    async fn template_failure_degrades_to_empty_document() {
        // Room exists but no template is registered for its language.
        let rooms = RoomServiceClient::memory();
        rooms
            .insert_room(Room {
                room_id: "r1".into(),
                user_ids: vec![1],
                question_id: "q42".into(),
                question_lang_slug: "cobol".into(),
            })
            .await;

        let registry =
            RoomRegistry::new(Uuid::new_v4(), UpdateStore::memory(), Broker::memory(), rooms);
        let session = registry.ensure("r1").await.expect("ensure should succeed");
        assert_eq!(session.text_content().await, "");
    }

    #[tokio::test]
    async fn remove_tombstones_until_revived() {
        let registry = test_registry();
        registry.ensure("r1").await.expect("ensure should succeed");

        registry.remove("r1").await;
        assert!(registry.get("r1").await.is_none());
        assert!(matches!(registry.ensure("r1").await, Err(RegistryError::RoomDeleted(_))));

        registry.revive("r1").await;
        let revived = registry.ensure("r1").await.expect("revived room should construct");
        assert_eq!(revived.connection_count().await, 0);
    }

    #[tokio::test]
    async fn remove_is_safe_when_session_is_absent() {
        let registry = test_registry();
        registry.remove("never-existed").await;
    }

    #[tokio::test]
    async fn retire_if_empty_removes_and_fresh_ensure_rebuilds() {
        let registry = test_registry();
        let session = registry.ensure("r1").await.expect("ensure should succeed");

        registry.retire_if_empty("r1").await;
        assert!(session.is_destroyed().await);
        assert!(registry.get("r1").await.is_none());

        let fresh = registry.ensure("r1").await.expect("fresh ensure should succeed");
        assert!(!Arc::ptr_eq(&session, &fresh), "no ghost state is retained");
        assert!(!fresh.is_destroyed().await);
    }

    #[tokio::test]
    async fn retire_if_empty_leaves_active_sessions_alone() {
        let registry = test_registry();
        let session = registry.ensure("r1").await.expect("ensure should succeed");
        let (tx, _keepalive) = mpsc::unbounded_channel();
        session.register_connection(tx).await.expect("register should succeed");

        registry.retire_if_empty("r1").await;
        assert!(!session.is_destroyed().await);
        assert!(registry.get("r1").await.is_some());
    }

    #[tokio::test]
    async fn instances_sharing_a_hub_converge() {
        let hub = crate::bridge::MemoryHub::default();
        let store = UpdateStore::memory();
        let registry_a = RoomRegistry::new(
            Uuid::new_v4(),
            store.clone(),
            Broker::Memory(hub.clone()),
            RoomServiceClient::memory(),
        );
        let registry_b = RoomRegistry::new(
            Uuid::new_v4(),
            store,
            Broker::Memory(hub),
            RoomServiceClient::memory(),
        );

        let session_a = registry_a.ensure("r1").await.expect("ensure a should succeed");
        let session_b = registry_b.ensure("r1").await.expect("ensure b should succeed");

        let (tx, _keepalive) = mpsc::unbounded_channel();
        let registered = session_a.register_connection(tx).await.expect("register should succeed");

        let editor = Awareness::new(Doc::with_client_id(7));
        let update = {
            let content = editor.doc().get_or_insert_text(DOC_TEXT);
            let mut txn = editor.doc().transact_mut();
            content.push(&mut txn, "x");
            txn.encode_update_v1()
        };
        session_a
            .handle_frame(registered.conn_id, &protocol::update_frame(update))
            .await
            .expect("update should be handled");

        let deadline = Instant::now() + Duration::from_secs(2);
        while session_b.text_content().await != "x" {
            assert!(Instant::now() < deadline, "instance b never received the update");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session_a.text_content().await, "x");
    }
}
