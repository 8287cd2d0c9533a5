//! Warden server library.
//!
//! Provides a reusable serve function wiring the client routes, the admin
//! surface and the policy engine together, for the binary and for tests.

#![deny(missing_docs)]

mod auth;
mod limit;
mod routes;
mod session;
mod state;

#[cfg(test)]
mod tests;

use std::{net::SocketAddr, sync::Arc};

use axum::{Json, Router, middleware, routing::get};
use config::Config;
use llm::OpenAiClient;
use policy::{
    events::{EventBus, LogSink},
    manager::PolicyManager,
    store::StreamContextStore,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

pub(crate) use state::AppState;

/// Configuration for serving Warden.
pub struct ServeConfig {
    /// The socket address the server binds to.
    pub listen_address: SocketAddr,
    /// The deserialized warden.toml configuration.
    pub config: Config,
    /// Cancellation token for graceful shutdown.
    pub shutdown_signal: CancellationToken,
    /// The version string to log on startup.
    pub version: String,
    /// Optional oneshot sender for the bound address (useful when port 0
    /// was specified).
    pub bound_addr_sender: Option<tokio::sync::oneshot::Sender<SocketAddr>>,
}

/// Starts and runs the Warden server with the provided configuration.
pub async fn serve(
    ServeConfig {
        listen_address,
        config,
        shutdown_signal,
        version,
        bound_addr_sender,
    }: ServeConfig,
) -> anyhow::Result<()> {
    log::info!("Warden {version}");

    let client = Arc::new(OpenAiClient::new(&config.llm));
    let (events, events_worker) = EventBus::start(config.events.queue_capacity, vec![Box::new(LogSink)]);
    let store = Arc::new(StreamContextStore::from_config(&config.policy.stream_store).await?);

    let manager = Arc::new(PolicyManager::default());
    match &config.policy.config_file {
        Some(path) => {
            let policy = manager
                .activate_from_file(path)
                .map_err(|error| anyhow::anyhow!("Failed to load policy from {path}: {error}"))?;
            log::info!("Loaded policy '{}' from {path}", policy.name());
        }
        None => {
            log::info!("No policy document configured; the no-op policy is active");
        }
    }

    let state = Arc::new(AppState::new(config.clone(), manager, client, events, store));

    let app = router(state, &config);

    let listener = TcpListener::bind(listen_address).await?;
    let bound_addr = listener.local_addr()?;
    log::info!("Listening on {bound_addr}");

    if let Some(sender) = bound_addr_sender
        && sender.send(bound_addr).is_err()
    {
        log::debug!("Bound address receiver dropped before startup completed");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_signal.cancelled().await })
        .await?;

    drop(events_worker);
    Ok(())
}

fn router(state: Arc<AppState>, config: &Config) -> Router {
    Router::new()
        .merge(routes::client_router(state.clone()))
        .merge(routes::admin_router(state.clone()))
        .route(&config.server.health_path, get(health))
        .layer(middleware::from_fn_with_state(state, limit::request_size_limit))
        .layer(CorsLayer::permissive())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}
