use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{HeaderName, StatusCode},
    response::{AppendHeaders, Html, IntoResponse},
    routing::get,
    Json, Router,
};
use reqwest::header;
use tower_http::{services::ServeDir, trace::TraceLayer};

mod chat;
mod inference;
mod logging;
mod model;

pub(crate) mod env {
    pub const API_PORT: &str = "DEEPCHAT_API_PORT";
    pub const OLLAMA_URL: &str = "DEEPCHAT_OLLAMA_URL";
    pub const MODEL: &str = "DEEPCHAT_MODEL";
    pub const INFER_TIMEOUT_MS: &str = "DEEPCHAT_INFER_TIMEOUT_MS";
}

struct AppState {
    client: inference::OllamaClient,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::configure_logging();

    let app = Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/websocket", get(websocket_handler))
        .nest_service("/scripts", ServeDir::new("public/scripts"))
        .layer(TraceLayer::new_for_http())
        .with_state(configure_app_state().await);

    let port = std::env::var(env::API_PORT).ok();
    let port = port.and_then(|x| x.parse().ok()).unwrap_or(3000_u16);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .context("chat server exited")?;

    Ok(())
}

async fn configure_app_state() -> Arc<AppState> {
    let client = inference::OllamaClient::from_env();
    match client.preflight().await {
        Ok(()) => {
            tracing::info!("ollama is reachable, model '{}' is installed", client.model())
        }
        Err(err) => tracing::warn!("ollama preflight failed: {err}"),
    }
    Arc::new(AppState { client })
}

async fn index() -> (
    StatusCode,
    AppendHeaders<Vec<(HeaderName, &'static str)>>,
    Html<String>,
) {
    match std::fs::read_to_string("index.html") {
        Ok(html) => (
            StatusCode::OK,
            AppendHeaders(vec![
                (header::CACHE_CONTROL, "no-cache, no-store"),
                (header::EXPIRES, "-1"),
            ]),
            Html(html),
        ),
        Err(err) => (
            StatusCode::NOT_FOUND,
            AppendHeaders(vec![]),
            Html(err.to_string()),
        ),
    }
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.client.preflight().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "model": state.client.model(),
            })),
        ),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "error",
                "reason": err.kind(),
                "message": err.to_string(),
            })),
        ),
    }
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| chat::chat_websocket(socket, state))
}
