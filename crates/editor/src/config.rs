// Editor service configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The lifecycle consumer and Redis wiring read everything
// they need from here.

use std::net::SocketAddr;
use std::time::Duration;

/// Core editor server configuration.
///
/// Constructed via [`EditorConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct EditorConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// JWT signing secret for access tokens.
    pub jwt_secret: String,
    /// Redis connection string (pub/sub backbone, update log, event stream).
    pub redis_url: String,
    /// Base URL of the room service room endpoint.
    pub room_service_api: String,
    /// Base URL of the question service.
    pub question_service_api: String,
    /// Redis stream carrying room lifecycle events.
    pub room_events_stream: String,
    /// Consumer group name on the room events stream.
    pub room_events_group: String,
    /// Bounded timeout for room/question service lookups.
    pub service_timeout: Duration,
    /// Log filter directive (e.g. `info`, `peerpad_editor=debug`).
    pub log_filter: String,
}

impl EditorConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `PEERPAD_HOST` | `0.0.0.0` |
    /// | `PEERPAD_PORT` | `9004` |
    /// | `PEERPAD_JWT_SECRET` | dev-only placeholder |
    /// | `PEERPAD_REDIS_URL` | `redis://127.0.0.1:6379` |
    /// | `PEERPAD_ROOM_SERVICE_API` | `http://localhost:9002/room-service/room` |
    /// | `PEERPAD_QUESTION_SERVICE_API` | `http://localhost:9001/question-service` |
    /// | `PEERPAD_ROOM_EVENTS_STREAM` | `room-events` |
    /// | `PEERPAD_ROOM_EVENTS_GROUP` | `peerpad-editor` |
    /// | `PEERPAD_SERVICE_TIMEOUT_SECS` | `5` |
    /// | `PEERPAD_LOG_FILTER` | `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("PEERPAD_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("PEERPAD_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(9004);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("PEERPAD_JWT_SECRET").unwrap_or_else(|_| {
            "peerpad_local_development_jwt_secret_must_be_32_chars".into()
        });

        let redis_url =
            env("PEERPAD_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());

        let room_service_api = env("PEERPAD_ROOM_SERVICE_API")
            .unwrap_or_else(|_| "http://localhost:9002/room-service/room".into());
        let question_service_api = env("PEERPAD_QUESTION_SERVICE_API")
            .unwrap_or_else(|_| "http://localhost:9001/question-service".into());

        let room_events_stream =
            env("PEERPAD_ROOM_EVENTS_STREAM").unwrap_or_else(|_| "room-events".into());
        let room_events_group =
            env("PEERPAD_ROOM_EVENTS_GROUP").unwrap_or_else(|_| "peerpad-editor".into());

        let service_timeout = Duration::from_secs(
            env("PEERPAD_SERVICE_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(5),
        );

        let log_filter = env("PEERPAD_LOG_FILTER").unwrap_or_else(|_| "info".into());

        Self {
            listen_addr,
            jwt_secret,
            redis_url,
            room_service_api,
            question_service_api,
            room_events_stream,
            room_events_group,
            service_timeout,
            log_filter,
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == "peerpad_local_development_jwt_secret_must_be_32_chars"
    }
}
