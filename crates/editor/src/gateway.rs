// HTTP upgrade entry point.
//
// `GET /rooms/{room_id}` authenticates the `access-token` cookie, confirms
// with the room service that the caller belongs to the room, makes sure a
// document session exists, and only then completes the socket upgrade.
// Any failure along that chain rejects before the upgrade, so a refused
// caller leaves no session side effects behind.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::{debug, warn};

use crate::auth::AccessTokenVerifier;
use crate::connection;
use crate::registry::{RegistryError, RoomRegistry};
use crate::rooms::RoomServiceClient;

const ACCESS_TOKEN_COOKIE: &str = "access-token";

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub verifier: Arc<AccessTokenVerifier>,
    pub rooms: RoomServiceClient,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/rooms/{room_id}", get(room_ws))
        .with_state(state)
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn room_ws(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let Some(token) = access_token_cookie(&headers) else {
        debug!(room_id = %room_id, "upgrade rejected: missing access token");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let profile = match state.verifier.verify(&token) {
        Ok(profile) => profile,
        Err(error) => {
            debug!(room_id = %room_id, error = %error, "upgrade rejected: invalid access token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    let room = match state.rooms.get_room(&room_id).await {
        Ok(Some(room)) => room,
        Ok(None) => {
            debug!(room_id = %room_id, "upgrade rejected: room not found");
            return StatusCode::NOT_FOUND.into_response();
        }
        Err(error) => {
            warn!(room_id = %room_id, error = %error, "room service lookup failed");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    if !room.user_ids.contains(&profile.user_id) {
        debug!(
            room_id = %room_id,
            user_id = profile.user_id,
            "upgrade rejected: user not in room"
        );
        return StatusCode::FORBIDDEN.into_response();
    }

    match state.registry.ensure(&room_id).await {
        Ok(_) => {}
        Err(RegistryError::RoomDeleted(_)) => {
            debug!(room_id = %room_id, "upgrade rejected: room deleted");
            return StatusCode::GONE.into_response();
        }
        Err(error) => {
            warn!(room_id = %room_id, error = %error, "failed to prepare session for upgrade");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    let registry = state.registry.clone();
    ws.on_upgrade(move |socket| connection::serve(socket, room_id, registry))
}

fn access_token_cookie(headers: &HeaderMap) -> Option<String> {
    for value in headers.get_all(header::COOKIE) {
        let Ok(raw) = value.to_str() else {
            continue;
        };
        for pair in raw.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                if name == ACCESS_TOKEN_COOKIE && !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}
