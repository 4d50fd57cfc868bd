use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use eel_core::Session;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::connection;

/// Browser-side client for the same protocol, served at `/eel.js`.
pub const EEL_JS: &str = include_str!("../assets/eel.js");

/// Server configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// 0 picks a free port.
    pub port: u16,
    /// Directory served for every path without a dedicated route.
    pub web_root: Option<PathBuf>,
    /// Largest accepted WebSocket message, in bytes.
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 8000,
            web_root: None,
            max_message_size: 16 << 20,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub session: Arc<Session>,
    pub max_message_size: usize,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, web_root: Option<PathBuf>) -> Router {
    let router = Router::new()
        .route("/establishConnection", get(ws_handler))
        .route("/eel.js", get(eel_js_handler))
        .route("/health", get(health_handler));

    let router = match web_root {
        Some(root) => router.fallback_service(ServeDir::new(root)),
        None => router,
    };

    router
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind and start serving `session`. Returns a handle to shut it down.
pub async fn start(config: ServerConfig, session: Arc<Session>) -> Result<ServerHandle, ServerError> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let local_addr = listener.local_addr()?;

    let state = AppState {
        session,
        max_message_size: config.max_message_size,
    };
    let router = build_router(state, config.web_root);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "eel server stopped with error");
        }
    });

    tracing::info!(addr = %local_addr, "eel server started");

    Ok(ServerHandle {
        addr: local_addr,
        shutdown_tx: Some(shutdown_tx),
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting connections and wait briefly for the server to wind
    /// down. Open WebSockets are cut after the grace period.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(Duration::from_secs(5), &mut self.server)
            .await
            .is_err()
        {
            tracing::warn!("eel server did not stop in time, aborting");
            self.server.abort();
        }
        tracing::info!("eel server stopped");
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| connection::handle_ws_connection(socket, state.session))
}

async fn eel_js_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/javascript; charset=utf-8")],
        EEL_JS,
    )
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let session = &state.session;
    Json(serde_json::json!({
        "status": "ok",
        "connected": session.is_connected(),
        "exposed": session.registry().names(),
        "peerFunctions": session.peer_functions(),
        "inFlight": session.pending().in_flight(),
    }))
}
