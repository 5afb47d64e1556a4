use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

use peerpad_editor::auth::AccessTokenVerifier;
use peerpad_editor::bridge::Broker;
use peerpad_editor::config::EditorConfig;
use peerpad_editor::gateway::{self, AppState};
use peerpad_editor::lifecycle::LifecycleConsumer;
use peerpad_editor::persistence::UpdateStore;
use peerpad_editor::registry::RoomRegistry;
use peerpad_editor::rooms::RoomServiceClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EditorConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter)),
        )
        .init();

    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set PEERPAD_JWT_SECRET in production");
    }

    let instance_id = Uuid::new_v4();
    info!(instance_id = %instance_id, "starting editor sync service");

    let redis_client =
        redis::Client::open(config.redis_url.as_str()).context("invalid redis url")?;
    let broker = Broker::redis(redis_client.clone())
        .await
        .context("failed to connect to the pub/sub backbone")?;
    let store = UpdateStore::redis(&redis_client)
        .await
        .context("failed to connect to the update store")?;

    let verifier =
        Arc::new(AccessTokenVerifier::new(&config.jwt_secret).context("invalid JWT secret")?);
    let rooms = RoomServiceClient::http(
        &config.room_service_api,
        &config.question_service_api,
        config.service_timeout,
    )
    .context("failed to build the room service client")?;

    let registry = RoomRegistry::new(instance_id, store, broker, rooms.clone());

    let consumer = LifecycleConsumer::new(
        redis_client,
        config.room_events_stream.clone(),
        config.room_events_group.clone(),
        registry.clone(),
    );
    tokio::spawn(consumer.run());

    let app = gateway::router(AppState { registry, verifier, rooms });

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind editor listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("editor server exited unexpectedly")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
