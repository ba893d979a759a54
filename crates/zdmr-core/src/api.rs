//! L9 Control API.
//!
//! Loopback-only, token-authenticated HTTP surface. Generalizes the
//! teacher's unauthenticated browser-integration server (REST +
//! WebSocket) into the authenticated REST + SSE surface this engine
//! exposes to external callers — the WebSocket transport is dropped, not
//! carried forward.

use crate::engine::Engine;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, post};
use axum::{Json, Router};
use futures_util::stream::Stream;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;
use zdmr_types::{CreateBatchRequest, CreateDownloadRequest};

#[derive(Clone)]
struct ApiState {
    engine: Arc<Engine>,
    token: Arc<str>,
}

/// Bind and serve the Control API on `127.0.0.1:<port>` until the
/// process is asked to shut down. Returns once the listener stops.
pub async fn serve(engine: Arc<Engine>, token: String, port: u16) -> Result<(), std::io::Error> {
    let state = ApiState {
        engine,
        token: Arc::from(token.as_str()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-zdmr-token"),
        ]);

    let app = Router::new()
        .route("/downloads", post(create_downloads))
        .route("/batches", post(create_batch))
        .route("/downloads/:id/pause", post(pause_download))
        .route("/downloads/:id/resume", post(resume_download))
        .route("/downloads/:id/retry", post(retry_download))
        .route("/downloads/:id/use-proxy", post(use_proxy_and_retry))
        .route("/downloads/:id", delete(delete_download))
        .route("/events", axum::routing::get(events))
        .layer(cors)
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    tracing::info!("control API listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

/// Constant-time comparison so token checks don't leak timing
/// information about how many leading bytes matched.
fn tokens_match(expected: &str, provided: &str) -> bool {
    if expected.len() != provided.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in expected.bytes().zip(provided.bytes()) {
        diff |= a ^ b;
    }
    diff == 0
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    headers
        .get("x-zdmr-token")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn authorize(state: &ApiState, headers: &HeaderMap) -> Result<(), StatusCode> {
    match extract_token(headers) {
        Some(token) if tokens_match(&state.token, &token) => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

#[derive(Serialize)]
struct CreateDownloadsResponse {
    ids: Vec<Uuid>,
}

#[derive(Serialize)]
struct CreateBatchResponse {
    batch_id: Uuid,
    ids: Vec<Uuid>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (status, Json(ErrorResponse { error: message.into() })).into_response()
}

async fn create_downloads(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<CreateDownloadRequest>,
) -> axum::response::Response {
    if let Err(status) = authorize(&state, &headers) {
        return error_response(status, "unauthorized");
    }
    if req.urls.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "urls must not be empty");
    }

    let mut ids = Vec::with_capacity(req.urls.len());
    for url in req.urls {
        match state.engine.enqueue(url, req.dest_dir.clone(), None).await {
            Ok(download) => ids.push(download.id),
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
        }
    }
    Json(CreateDownloadsResponse { ids }).into_response()
}

async fn create_batch(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<CreateBatchRequest>,
) -> axum::response::Response {
    if let Err(status) = authorize(&state, &headers) {
        return error_response(status, "unauthorized");
    }

    let mut urls = req.urls;
    if let Some(raw) = req.raw_url_list {
        urls.extend(
            raw.split_whitespace()
                .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
                .map(str::to_string),
        );
    }
    if urls.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "no urls provided");
    }

    let name = req.name.unwrap_or_else(|| "batch".to_string());
    match state
        .engine
        .create_batch(name, req.dest_dir, urls, req.download_through_proxy.unwrap_or(false))
        .await
    {
        Ok((batch, downloads)) => Json(CreateBatchResponse {
            batch_id: batch.id,
            ids: downloads.iter().map(|d| d.id).collect(),
        })
        .into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn pause_download(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> axum::response::Response {
    if let Err(status) = authorize(&state, &headers) {
        return error_response(status, "unauthorized");
    }
    respond_to_control_op(state.engine.pause(id).await)
}

async fn resume_download(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> axum::response::Response {
    if let Err(status) = authorize(&state, &headers) {
        return error_response(status, "unauthorized");
    }
    respond_to_control_op(state.engine.resume(id).await)
}

async fn retry_download(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> axum::response::Response {
    if let Err(status) = authorize(&state, &headers) {
        return error_response(status, "unauthorized");
    }
    respond_to_control_op(state.engine.retry(id).await)
}

async fn delete_download(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> axum::response::Response {
    if let Err(status) = authorize(&state, &headers) {
        return error_response(status, "unauthorized");
    }
    respond_to_control_op(state.engine.cancel_and_delete(id).await)
}

#[derive(serde::Deserialize)]
struct UseProxyRequest {
    proxy_url: String,
}

async fn use_proxy_and_retry(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<UseProxyRequest>,
) -> axum::response::Response {
    if let Err(status) = authorize(&state, &headers) {
        return error_response(status, "unauthorized");
    }
    respond_to_control_op(state.engine.add_host_to_proxy_and_retry(id, req.proxy_url).await)
}

fn respond_to_control_op(result: Result<(), crate::error::EngineError>) -> axum::response::Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(crate::error::EngineError::NotFound(_)) => error_response(StatusCode::NOT_FOUND, "download not found"),
        Err(crate::error::EngineError::InvalidOperation(msg)) => error_response(StatusCode::CONFLICT, msg),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn events(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    authorize(&state, &headers).map_err(|_| StatusCode::UNAUTHORIZED)?;

    let rx = state.engine.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|item| {
        let event = item.ok()?;
        let payload = serde_json::to_string(&event).ok()?;
        Some(Ok(Event::default().data(payload)))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
