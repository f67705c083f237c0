use axum::{
    extract::State,
    http::Method,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use crate::relay::Relay;
use crate::signal;

/// Routes: control endpoints plus the transport on the configured namespace.
pub fn router(relay: Relay) -> Router {
    let namespace = relay.config().namespace.clone();
    Router::new()
        .route("/", get(|| async { "Shroud relay online" }))
        .route("/health", get(health))
        .route("/streams", get(streams))
        .route("/decryption/toggle", post(toggle))
        .route(&namespace, get(signal::ws_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST]),
        )
        .with_state(relay)
}

async fn health(State(relay): State<Relay>) -> Json<Value> {
    let snapshot = relay.snapshot().await;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "streams": snapshot.streams.len(),
        "connections": snapshot.connections,
        "decryption_enabled": snapshot.decryption_enabled,
        "sessions": snapshot.sessions,
        "stream_stats": snapshot.streams,
        "decode_pool": snapshot.pool,
    }))
}

async fn streams(State(relay): State<Relay>) -> Json<Vec<String>> {
    Json(relay.directory().await)
}

async fn toggle(State(relay): State<Relay>) -> Json<Value> {
    let enabled = relay.toggle_decryption().await;
    Json(json!({ "enabled": enabled }))
}
