use std::{future::Future, net::SocketAddr};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{ConnectInfo, DefaultBodyLimit, State, ws::WebSocketUpgrade},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tokio::{net::TcpListener, task::JoinHandle};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    gateway::{self, DEFAULT_BROADCAST_BUFFER, Hub, HubHandle},
    protocol::{ErrorNotice, SUBMISSION_FAILED},
    record::Submission,
    relay::{DEFAULT_CAPACITY, MessageRelay},
    web,
};

pub const DEFAULT_PORT: u16 = 3001;
/// Largest WebSocket message or POST body accepted. Image and audio data
/// URIs travel inline, so this is far above typical text traffic.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub capacity: usize,
    pub broadcast_buffer: usize,
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            capacity: DEFAULT_CAPACITY,
            broadcast_buffer: DEFAULT_BROADCAST_BUFFER,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Clone)]
struct AppState {
    hub: HubHandle,
    max_frame_bytes: usize,
}

pub struct Server {
    listener: TcpListener,
    hub: HubHandle,
    hub_task: JoinHandle<()>,
    max_frame_bytes: usize,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let relay = MessageRelay::new(config.capacity)?;
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        let (hub, hub_task) = Hub::spawn(relay, config.broadcast_buffer);

        Ok(Self {
            listener,
            hub,
            hub_task,
            max_frame_bytes: config.max_frame_bytes,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> HubHandle {
        self.hub.clone()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server {
            listener,
            hub,
            hub_task,
            max_frame_bytes,
        } = self;

        let app = router(hub.clone(), max_frame_bytes);
        let stopping = hub.clone();

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("server shutting down");
            // Stopping the hub closes every open socket so the drain can finish.
            if let Err(error) = stopping.shutdown().await {
                warn!(%error, "hub already stopped");
            }
        })
        .await
        .context("server exited")?;

        drop(hub);
        if let Err(error) = hub_task.await {
            warn!(?error, "hub task failed");
        }
        info!("server stopped");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }
}

pub fn router(hub: HubHandle, max_frame_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/", get(web::index))
        .route("/app.js", get(web::script))
        .route("/style.css", get(web::stylesheet))
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/api/messages", get(list_messages).post(submit_message))
        .layer(DefaultBodyLimit::max(max_frame_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState {
            hub,
            max_frame_bytes,
        })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = ?err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.max_message_size(state.max_frame_bytes)
        .on_upgrade(move |socket| gateway::handle_socket(socket, state.hub, peer))
}

async fn health(State(state): State<AppState>) -> Response {
    match state.hub.stats().await {
        Ok(stats) => Json(json!({
            "status": "ok",
            "messages": stats.messages,
            "capacity": stats.capacity,
        }))
        .into_response(),
        Err(err) => unavailable(err),
    }
}

/// Polling fallback: the current relay contents, oldest first.
async fn list_messages(State(state): State<AppState>) -> Response {
    match state.hub.snapshot().await {
        Ok(records) => Json(records).into_response(),
        Err(err) => unavailable(err),
    }
}

/// Polling fallback: submit a message without a WebSocket. The stored
/// record is broadcast to WebSocket peers like any other.
async fn submit_message(State(state): State<AppState>, body: Bytes) -> Response {
    let submission: Submission = match serde_json::from_slice(&body) {
        Ok(submission) => submission,
        Err(err) => {
            warn!(error = %err, "rejected polled submission");
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorNotice::new(SUBMISSION_FAILED)),
            )
                .into_response();
        }
    };

    match state.hub.submit(submission).await {
        Ok(record) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(err) => unavailable(err),
    }
}

fn unavailable(err: crate::error::RelayError) -> Response {
    warn!(error = %err, "hub unavailable");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorNotice::new(err.to_string())),
    )
        .into_response()
}
