//! HTTP and WebSocket front end using Axum.

use super::dispatcher::{InboundRequest, OutboundResponse, ServerDispatcher};
use crate::config::ProtocolConfig;
use crate::contract::CatalogMetadata;
use crate::error::{DispatchError, RpcError};
use crate::socket::{FrameSocket, SocketError};
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use flate2::{write::GzEncoder, Compression};
use futures::FutureExt;
use http_body_util::LengthLimitError;
use serde::Deserialize;
use std::io::Write;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    dispatcher: Arc<ServerDispatcher>,
}

/// Build the router for a dispatcher.
pub fn router(dispatcher: Arc<ServerDispatcher>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", post(handle_rpc))
        .route(ProtocolConfig::METADATA_PATH, get(handle_metadata))
        .route(ProtocolConfig::HEALTH_PATH, get(handle_health))
        .route(ProtocolConfig::WS_PATH, get(handle_ws))
        .fallback(handle_not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(AppState { dispatcher })
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn handle_metadata(State(state): State<AppState>) -> Json<CatalogMetadata> {
    Json(state.dispatcher.metadata())
}

async fn handle_not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn handle_rpc(State(state): State<AppState>, headers: HeaderMap, body: Body) -> Response {
    let accept_gzip = headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("gzip"));
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let meta = headers
        .get(ProtocolConfig::META_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let dispatcher = &state.dispatcher;
    let limit = ProtocolConfig::MAX_REQUEST_BYTES;
    if content_length.is_some_and(|len| len > limit) {
        return respond(dispatcher.reject(DispatchError::PayloadTooLarge), accept_gzip);
    }
    let body = match axum::body::to_bytes(body, limit as usize).await {
        Ok(body) => body,
        Err(e) if is_length_limit(&e) => {
            return respond(dispatcher.reject(DispatchError::PayloadTooLarge), accept_gzip)
        }
        Err(e) => {
            debug!("failed to read request body: {}", e);
            let err = DispatchError::Protocol(format!("failed to read request body, {}", e));
            return respond(dispatcher.reject(err), accept_gzip);
        }
    };

    let request = InboundRequest {
        meta,
        content_length,
        body,
    };
    let response = match AssertUnwindSafe(dispatcher.dispatch(request)).catch_unwind().await {
        Ok(response) => response,
        Err(_) => {
            error!("rpc dispatch panicked");
            dispatcher.reject(DispatchError::Business(RpcError::new("rpc server internal error.")))
        }
    };
    respond(response, accept_gzip)
}

fn respond(response: OutboundResponse, accept_gzip: bool) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut headers = HeaderMap::new();
    headers.insert(header::SERVER, HeaderValue::from_static(ProtocolConfig::SERVER_NAME));

    let mut body = response.body;
    if accept_gzip && !body.is_empty() {
        match gzip(&body) {
            Ok(compressed) => {
                headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                body = compressed;
            }
            Err(e) => error!("failed to compress response: {}", e),
        }
    }
    (status, headers, body).into_response()
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn is_length_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> =
        Some(err as &(dyn std::error::Error + 'static));
    while let Some(current) = source {
        if current.is::<LengthLimitError>() {
            return true;
        }
        source = current.source();
    }
    false
}

#[derive(Debug, Deserialize)]
struct SocketParams {
    #[serde(rename = "instanceId")]
    instance_id: Uuid,
}

async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<SocketParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let hub = state.dispatcher.hub().clone();
    ws.protocols([ProtocolConfig::WS_SUBPROTOCOL])
        .on_upgrade(move |socket| async move {
            let exit = hub.attach(params.instance_id, AxumSocket(socket)).await;
            debug!(
                "event socket for instance {} finished: {}",
                params.instance_id,
                exit.reason()
            );
        })
}

/// Server end of an event socket.
struct AxumSocket(WebSocket);

#[async_trait]
impl FrameSocket for AxumSocket {
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), SocketError> {
        self.0
            .send(Message::Binary(frame))
            .await
            .map_err(|e| SocketError::Transport(e.to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<Vec<u8>, SocketError>> {
        loop {
            match self.0.recv().await? {
                Ok(Message::Binary(data)) => return Some(Ok(data)),
                Ok(Message::Text(text)) => return Some(Ok(text.into_bytes())),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => return None,
                Err(e) => return Some(Err(SocketError::Transport(e.to_string()))),
            }
        }
    }

    async fn ping(&mut self) -> Result<(), SocketError> {
        self.0
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| SocketError::Transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), SocketError> {
        self.0
            .send(Message::Close(None))
            .await
            .map_err(|e| SocketError::Transport(e.to_string()))
    }
}

/// Handle to a running server. Dropping shuts it down.
pub struct RunningServer {
    addr: SocketAddr,
    dispatcher: Arc<ServerDispatcher>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    liveness: JoinHandle<()>,
}

impl RunningServer {
    /// The address the server is bound to (useful when port = 0).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn dispatcher(&self) -> &Arc<ServerDispatcher> {
        &self.dispatcher
    }

    /// Stop accepting connections and close every event socket.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            self.dispatcher.shutdown();
            self.liveness.abort();
        }
    }

    /// Shut down and wait for the listener to finish.
    pub async fn stop(mut self) {
        self.shutdown();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Bind and start serving in the background.
pub async fn serve(dispatcher: Arc<ServerDispatcher>, addr: SocketAddr) -> std::io::Result<RunningServer> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;
    info!("Server listening on {}", actual_addr);

    let app = router(dispatcher.clone());
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
            error!("server error: {}", e);
        }
    });
    let liveness = dispatcher.spawn_liveness();

    Ok(RunningServer {
        addr: actual_addr,
        dispatcher,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
        liveness,
    })
}
