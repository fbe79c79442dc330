pub mod authorizer;
pub mod cli;
pub mod config;
pub mod handlers;
pub mod push;
pub mod router;
pub mod storage;
pub mod telemetry;
pub mod websocket;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    authorizer::Authorizer,
    config::RelayConfig,
    handlers::{health_check, metrics_handler},
    push::PushHub,
    router::RelayRouter,
    storage::{MemoryRegistry, RedisRegistry, Registry},
    websocket::{websocket_handler, RelayState},
};

/// Build the registry selected by the configuration.
pub async fn build_registry(config: &RelayConfig) -> Result<Arc<dyn Registry>> {
    match &config.redis_url {
        Some(url) => {
            let registry = RedisRegistry::connect(url, config.ttl)
                .await
                .context("failed to connect to redis")?;
            info!("using redis registry");
            Ok(Arc::new(registry))
        }
        None => {
            info!("using in-memory registry");
            Ok(Arc::new(MemoryRegistry::new(config.ttl)))
        }
    }
}

pub fn relay_state(config: &RelayConfig, registry: Arc<dyn Registry>) -> RelayState {
    let hub = Arc::new(PushHub::new());
    let router = RelayRouter::new(
        registry,
        hub.clone(),
        config.public_ws_url.clone(),
        config.ttl,
    );
    RelayState {
        router: Arc::new(router),
        hub,
        authorizer: Arc::new(Authorizer::new(config.authorizer.clone())),
    }
}

/// HTTP surface: `/ws`, `/health` and `/metrics`.
pub fn app(state: RelayState, metrics: PrometheusHandle) -> Router {
    let ws_routes = Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(state);

    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    Router::new()
        .route("/health", get(health_check))
        .merge(ws_routes)
        .merge(metrics_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
