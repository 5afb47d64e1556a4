// Per-room document session.
//
// A session is the single source of truth for one room: the CRDT replica
// (owned by `yrs::sync::Awareness`, which also carries the presence
// table), the registry of locally-attached connections, and the event tap
// the persistence binder consumes. All mutation goes through the session's
// own methods; connections and the bridge never touch the maps directly.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, Mutex};
use tracing::warn;
use yrs::sync::awareness::AwarenessUpdateEntry;
use yrs::sync::{
    Awareness, AwarenessUpdate, DefaultProtocol, Message, Protocol,
    SyncMessage,
};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, Text, Transact, Update};

use peerpad_common::protocol::{self, ProtocolError};

/// Name of the shared text type every room document edits.
pub const DOC_TEXT: &str = "content";

// Fixed client id for template seeds: instances racing the first
// construction of a room encode byte-identical seed updates, so the
// template merges to a single copy no matter how many seeders ran.
const TEMPLATE_CLIENT_ID: u64 = 0x5eed;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session for room {0} is destroyed")]
    Destroyed(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("document engine rejected input: {0}")]
    Engine(String),
}

/// Locally-produced deltas, consumed by the persistence binder.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    DocUpdate { update: Vec<u8> },
    AwarenessDelta { update: Vec<u8> },
}

/// Result of attaching a connection: its id within the session and the
/// frames to send it before anything else (sync step 1, then the current
/// awareness snapshot when non-empty).
pub struct Registered {
    pub conn_id: u64,
    pub greeting: Vec<Vec<u8>>,
}

struct ConnEntry {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    controlled: HashSet<u64>,
}

struct SessionInner {
    awareness: Awareness,
    conns: HashMap<u64, ConnEntry>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    destroyed: bool,
}

impl SessionInner {
    fn broadcast(&self, frame: &[u8]) {
        for entry in self.conns.values() {
            // A closed receiver means that connection is already tearing
            // down; it will unregister itself.
            let _ = entry.outbound.send(frame.to_vec());
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

pub struct DocSession {
    room_id: String,
    inner: Mutex<SessionInner>,
    next_conn_id: AtomicU64,
}

impl DocSession {
    pub(crate) fn new(room_id: &str, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            room_id: room_id.to_string(),
            inner: Mutex::new(SessionInner {
                awareness: Awareness::new(Doc::new()),
                conns: HashMap::new(),
                events: Some(events),
                destroyed: false,
            }),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.conns.len()
    }

    pub async fn is_destroyed(&self) -> bool {
        self.inner.lock().await.destroyed
    }

    /// Current document text, for diagnostics and tests.
    pub async fn text_content(&self) -> String {
        let inner = self.inner.lock().await;
        let txn = inner.awareness.doc().transact();
        txn.get_text(DOC_TEXT).map(|text| text.get_string(&txn)).unwrap_or_default()
    }

    /// Attach a connection. The newcomer alone receives the greeting; the
    /// other connections are not replayed anything.
    pub async fn register_connection(
        &self,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<Registered, SessionError> {
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            return Err(SessionError::Destroyed(self.room_id.clone()));
        }

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        inner.conns.insert(conn_id, ConnEntry { outbound, controlled: HashSet::new() });

        let state_vector = inner.awareness.doc().transact().state_vector();
        let mut greeting = vec![protocol::sync_step1_frame(&state_vector)];

        let snapshot = inner.awareness.update().map_err(ProtocolError::from)?;
        if !snapshot.clients.is_empty() {
            greeting.push(protocol::awareness_frame(&snapshot));
        }

        Ok(Registered { conn_id, greeting })
    }

    /// Detach a connection, dropping every awareness client id it
    /// controlled and broadcasting the removal. Returns true when the
    /// session is now empty.
    pub async fn unregister_connection(&self, conn_id: u64) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.conns.remove(&conn_id) else {
            return inner.conns.is_empty();
        };

        if !entry.controlled.is_empty() {
            let mut clients = HashMap::new();
            for (client_id, state) in inner.awareness.iter() {
                if entry.controlled.contains(&client_id) {
                    clients.insert(
                        client_id,
                        AwarenessUpdateEntry { clock: state.clock + 1, json: "null".into() },
                    );
                }
            }

            if !clients.is_empty() {
                let removal = AwarenessUpdate { clients };
                if let Err(error) =
                    self.apply_awareness_locked(&mut inner, removal, None, true)
                {
                    warn!(
                        room_id = %self.room_id,
                        error = %error,
                        "failed to drop awareness states for departed connection"
                    );
                }
            }
        }

        inner.conns.is_empty()
    }

    /// Handle one inbound frame from a connection. Returns the direct
    /// responses for that socket; broadcasts and binder events are
    /// dispatched internally. A malformed frame is an error the caller
    /// logs; the session and its other connections are unaffected.
    pub async fn handle_frame(
        &self,
        conn_id: u64,
        frame: &[u8],
    ) -> Result<Vec<Vec<u8>>, SessionError> {
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            return Err(SessionError::Destroyed(self.room_id.clone()));
        }

        let messages = protocol::decode_frame(frame)?;
        let mut responses = Vec::new();

        for message in messages {
            match message {
                Message::Sync(SyncMessage::SyncStep1(state_vector)) => {
                    if let Some(reply) = DefaultProtocol
                        .handle_sync_step1(&inner.awareness, state_vector)
                        .map_err(ProtocolError::from)?
                    {
                        responses.push(reply.encode_v1());
                    }
                }
                // Step-2 carries client updates during the handshake; it is
                // applied and fanned out exactly like a live update.
                Message::Sync(SyncMessage::SyncStep2(update))
                | Message::Sync(SyncMessage::Update(update)) => {
                    self.apply_update_locked(&mut inner, update)?;
                }
                Message::Awareness(update) => {
                    self.apply_awareness_locked(&mut inner, update, Some(conn_id), true)?;
                }
                Message::AwarenessQuery => {
                    if let Some(reply) = DefaultProtocol
                        .handle_awareness_query(&inner.awareness)
                        .map_err(ProtocolError::from)?
                    {
                        responses.push(reply.encode_v1());
                    }
                }
                other => {
                    if let Some(reply) = DefaultProtocol
                        .handle_message(&inner.awareness, other)
                        .map_err(ProtocolError::from)?
                    {
                        responses.push(reply.encode_v1());
                    }
                }
            }
        }

        Ok(responses)
    }

    /// Apply a document update published by another instance. Broadcast
    /// locally but emit no event: the producing instance already persisted
    /// and published it.
    pub async fn apply_remote_update(&self, update: &[u8]) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            return Ok(());
        }

        let decoded =
            Update::decode_v1(update).map_err(|error| SessionError::Engine(error.to_string()))?;
        inner
            .awareness
            .doc()
            .transact_mut()
            .apply_update(decoded)
            .map_err(|error| SessionError::Engine(error.to_string()))?;

        inner.broadcast(&protocol::update_frame(update.to_vec()));
        Ok(())
    }

    /// Apply an awareness delta published by another instance.
    pub async fn apply_remote_awareness(&self, update: &[u8]) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            return Ok(());
        }

        let decoded = AwarenessUpdate::decode_v1(update)
            .map_err(|error| SessionError::Engine(error.to_string()))?;
        self.apply_awareness_locked(&mut inner, decoded, None, false)
    }

    /// Replay the stored update log into a fresh replica. Corrupt rows are
    /// logged and skipped so one bad record cannot hold the room hostage.
    pub async fn replay_updates(&self, updates: Vec<Vec<u8>>) {
        let inner = self.inner.lock().await;
        for (index, update) in updates.into_iter().enumerate() {
            let applied = Update::decode_v1(&update)
                .map_err(|error| error.to_string())
                .and_then(|decoded| {
                    inner
                        .awareness
                        .doc()
                        .transact_mut()
                        .apply_update(decoded)
                        .map_err(|error| error.to_string())
                });

            if let Err(error) = applied {
                warn!(
                    room_id = %self.room_id,
                    index,
                    error = %error,
                    "skipping corrupt stored update"
                );
            }
        }
    }

    /// Seed the starter template into an empty replica. The seed is encoded
    /// under a fixed client id (see `TEMPLATE_CLIENT_ID`) and emitted like
    /// any local update so it reaches the store and sibling instances.
    pub async fn seed_text(&self, template: &str) -> Result<(), SessionError> {
        if template.is_empty() {
            return Ok(());
        }

        let seed = {
            let doc = Doc::with_client_id(TEMPLATE_CLIENT_ID);
            let content = doc.get_or_insert_text(DOC_TEXT);
            let mut txn = doc.transact_mut();
            content.push(&mut txn, template);
            txn.encode_update_v1()
        };

        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            return Ok(());
        }

        let decoded =
            Update::decode_v1(&seed).map_err(|error| SessionError::Engine(error.to_string()))?;
        inner
            .awareness
            .doc()
            .transact_mut()
            .apply_update(decoded)
            .map_err(|error| SessionError::Engine(error.to_string()))?;

        inner.emit(SessionEvent::DocUpdate { update: seed });
        Ok(())
    }

    /// Tear the session down: every connection's outbound channel closes
    /// (which ends its socket task) and the event tap is dropped so the
    /// binder drains and exits. Idempotent.
    pub async fn destroy(&self) {
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            return;
        }
        inner.destroyed = true;
        inner.conns.clear();
        inner.events = None;
    }

    fn apply_update_locked(
        &self,
        inner: &mut SessionInner,
        update: Vec<u8>,
    ) -> Result<(), SessionError> {
        let decoded =
            Update::decode_v1(&update).map_err(|error| SessionError::Engine(error.to_string()))?;
        inner
            .awareness
            .doc()
            .transact_mut()
            .apply_update(decoded)
            .map_err(|error| SessionError::Engine(error.to_string()))?;

        inner.broadcast(&protocol::update_frame(update.clone()));
        inner.emit(SessionEvent::DocUpdate { update });
        Ok(())
    }

    fn apply_awareness_locked(
        &self,
        inner: &mut SessionInner,
        update: AwarenessUpdate,
        origin_conn: Option<u64>,
        publish: bool,
    ) -> Result<(), SessionError> {
        let Some(summary) = inner
            .awareness
            .apply_update_summary(update)
            .map_err(ProtocolError::from)?
        else {
            return Ok(());
        };

        // Track which client ids the originating connection now controls;
        // a client id belongs to at most one connection.
        if let Some(conn_id) = origin_conn {
            let added = summary.added.clone();
            let removed = summary.removed.clone();
            if let Some(entry) = inner.conns.get_mut(&conn_id) {
                entry.controlled.extend(added);
                for client_id in removed {
                    entry.controlled.remove(&client_id);
                }
            }
        }

        let changed = summary.all_changes();
        if changed.is_empty() {
            return Ok(());
        }

        let rebroadcast =
            inner.awareness.update_with_clients(changed).map_err(ProtocolError::from)?;
        inner.broadcast(&protocol::awareness_frame(&rebroadcast));

        if publish {
            inner.emit(SessionEvent::AwarenessDelta { update: rebroadcast.encode_v1() });
        }

        Ok(())
    }
}
