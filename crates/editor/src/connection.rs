// Socket-scoped state machine layered over a document session.
//
// Each accepted socket runs one task: inbound frames are dispatched to the
// session, session broadcasts arrive on the outbound channel, and a
// server-initiated heartbeat detects half-open sockets that never deliver
// a close. Every exit path funnels into the same teardown, so repeated
// close triggers collapse into a single unregister.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tracing::{debug, warn};

use crate::registry::RoomRegistry;
use crate::session::{DocSession, Registered, SessionError};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

const ATTACH_ATTEMPTS: usize = 2;

/// Drive one accepted socket against its room until either side closes.
pub async fn serve(socket: WebSocket, room_id: String, registry: Arc<RoomRegistry>) {
    run(socket, room_id, registry, HEARTBEAT_INTERVAL).await;
}

/// [`serve`] with an explicit heartbeat interval, for tests that cannot
/// wait out the production value.
pub async fn run(
    mut socket: WebSocket,
    room_id: String,
    registry: Arc<RoomRegistry>,
    heartbeat: Duration,
) {
    let Some((session, registered, mut outbound)) = attach(&registry, &room_id).await else {
        return;
    };
    let Registered { conn_id, greeting } = registered;

    let mut open = true;
    for frame in greeting {
        if socket.send(Message::Binary(frame.into())).await.is_err() {
            open = false;
            break;
        }
    }

    let mut pong_received = true;
    let mut heartbeat_ticks = interval_at(Instant::now() + heartbeat, heartbeat);

    while open {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else {
                    break;
                };

                match message {
                    Message::Binary(payload) => {
                        match session.handle_frame(conn_id, payload.as_ref()).await {
                            Ok(responses) => {
                                for response in responses {
                                    if socket.send(Message::Binary(response.into())).await.is_err() {
                                        open = false;
                                        break;
                                    }
                                }
                            }
                            Err(SessionError::Destroyed(_)) => break,
                            // A single bad frame must not evict a collaborator.
                            Err(error) => {
                                warn!(
                                    room_id = %room_id,
                                    conn_id,
                                    error = %error,
                                    "dropping malformed frame"
                                );
                            }
                        }
                    }
                    Message::Ping(payload) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Pong(_) => pong_received = true,
                    Message::Close(_) => break,
                    Message::Text(_) => {}
                }
            }
            frame = outbound.recv() => {
                // A closed channel means the session was destroyed.
                let Some(frame) = frame else {
                    break;
                };
                if socket.send(Message::Binary(frame.into())).await.is_err() {
                    break;
                }
            }
            _ = heartbeat_ticks.tick() => {
                if !pong_received {
                    debug!(room_id = %room_id, conn_id, "heartbeat missed, closing connection");
                    break;
                }
                pong_received = false;
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    if session.unregister_connection(conn_id).await {
        registry.retire_if_empty(&room_id).await;
    }
    debug!(room_id = %room_id, conn_id, "connection closed");
}

/// Bind to the room's session, retrying once if a racing teardown
/// destroyed the session between `ensure` and registration.
async fn attach(
    registry: &Arc<RoomRegistry>,
    room_id: &str,
) -> Option<(Arc<DocSession>, Registered, mpsc::UnboundedReceiver<Vec<u8>>)> {
    for _ in 0..ATTACH_ATTEMPTS {
        let session = match registry.ensure(room_id).await {
            Ok(session) => session,
            Err(error) => {
                warn!(room_id = %room_id, error = %error, "failed to bind socket to room");
                return None;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        match session.register_connection(tx).await {
            Ok(registered) => return Some((session, registered, rx)),
            Err(SessionError::Destroyed(_)) => continue,
            Err(error) => {
                warn!(room_id = %room_id, error = %error, "failed to register connection");
                return None;
            }
        }
    }

    warn!(room_id = %room_id, "gave up binding socket to room");
    None
}
