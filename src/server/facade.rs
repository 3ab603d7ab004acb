// src/server/facade.rs

//! The loopback HTTP facade toward the local UI process: aggregated
//! snapshots, SSE event and catalog streams, the multiplexed resource
//! WebSocket, manual refresh, and Prometheus metrics.

use crate::core::ClusterRuntime;
use crate::core::aggregate::StreamRequest;
use crate::core::aggregate::stream::SocketSubscriptions;
use crate::core::errors::KubedeckError;
use crate::core::metrics::gather_metrics;
use crate::core::refresh::{CatalogEntry, ResourceFrame};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Buffered frames per resource stream socket before the writer backpressures.
const RESOURCE_SOCKET_BUFFER: usize = 256;

/// Maps a core error to the HTTP status the UI expects.
fn error_status(err: &KubedeckError) -> StatusCode {
    match err {
        KubedeckError::InvalidScope(_) | KubedeckError::InvalidSelection(_) => {
            StatusCode::BAD_REQUEST
        }
        KubedeckError::ClusterUnavailable(_) | KubedeckError::JobNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        KubedeckError::AuthFailure(_) => StatusCode::BAD_GATEWAY,
        KubedeckError::ApiStatus { code, .. } => {
            StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: KubedeckError) -> (StatusCode, Json<serde_json::Value>) {
    (error_status(&err), Json(json!({ "error": err.to_string() })))
}

/// Builds the facade router.
pub fn router(runtime: Arc<ClusterRuntime>) -> Router {
    Router::new()
        .route("/api/v2/snapshot", get(snapshot_handler))
        .route("/api/v2/stream/events", get(event_stream_handler))
        .route("/api/v2/stream/resources", get(resource_stream_handler))
        .route("/api/v2/stream/catalog", get(catalog_stream_handler))
        .route("/api/v2/manual-refresh", post(manual_refresh_enqueue))
        .route("/api/v2/manual-refresh/{id}", get(manual_refresh_status))
        .route("/api/v2/diagnostics/selection", get(selection_diagnostics))
        .route("/metrics", get(metrics_handler))
        .with_state(runtime)
}

#[derive(Debug, Deserialize)]
struct SnapshotParams {
    domain: String,
    scope: String,
}

async fn snapshot_handler(
    State(runtime): State<Arc<ClusterRuntime>>,
    Query(params): Query<SnapshotParams>,
) -> impl IntoResponse {
    match runtime
        .snapshots
        .build(&params.domain, &params.scope)
        .await
    {
        Ok(snapshot) => (StatusCode::OK, Json(json!(snapshot))),
        Err(e) => {
            let (status, body) = error_response(e);
            (status, body)
        }
    }
}

#[derive(Debug, Deserialize)]
struct EventStreamParams {
    scope: String,
    since: Option<u64>,
}

/// Resume point: the `since` query parameter or, preferred, `Last-Event-ID`.
fn resume_point(params: &EventStreamParams, headers: &HeaderMap) -> Option<u64> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .or(params.since)
}

async fn event_stream_handler(
    State(runtime): State<Arc<ClusterRuntime>>,
    Query(params): Query<EventStreamParams>,
    headers: HeaderMap,
) -> Result<
    Sse<impl Stream<Item = Result<Event, Infallible>>>,
    (StatusCode, Json<serde_json::Value>),
> {
    let since = resume_point(&params, &headers);
    let mut subscription = runtime
        .events
        .subscribe(&params.scope, since)
        .await
        .map_err(error_response)?;

    let heartbeat_timeout = runtime.config.streams.heartbeat_timeout();
    let keep_alive = runtime.config.streams.keep_alive();
    let scope = params.scope.clone();

    let stream = async_stream::stream! {
        for frame in std::mem::take(&mut subscription.initial) {
            yield Ok(sse_event(&frame));
        }
        loop {
            match tokio::time::timeout(heartbeat_timeout, subscription.rx.recv()).await {
                Ok(Some(frame)) => yield Ok(sse_event(&frame)),
                Ok(None) => break,
                Err(_) => {
                    // No upstream entries within the heartbeat window. The
                    // keep-alive comment keeps the pipe open; just note it.
                    debug!("Event stream '{}' idle past the heartbeat window.", scope);
                }
            }
        }
    };

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(keep_alive).text("keep-alive")))
}

fn sse_event(frame: &crate::core::aggregate::EventFrame) -> Event {
    let data = serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string());
    Event::default()
        .event("event")
        .id(frame.sequence.to_string())
        .data(data)
}

async fn resource_stream_handler(
    State(runtime): State<Arc<ClusterRuntime>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| resource_stream_socket(runtime, socket))
}

/// Drives one resource stream socket: client requests in, frames out.
async fn resource_stream_socket(runtime: Arc<ClusterRuntime>, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::channel::<ResourceFrame>(RESOURCE_SOCKET_BUFFER);
    let mut subscriptions = SocketSubscriptions::default();

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                let Some(Ok(message)) = incoming else { break };
                let Message::Text(text) = message else { continue };
                match serde_json::from_str::<StreamRequest>(text.as_str()) {
                    Ok(request) => {
                        runtime
                            .resources
                            .handle_request(request, frame_tx.clone(), &mut subscriptions)
                            .await;
                    }
                    Err(e) => {
                        debug!("Resource stream request rejected: {}", e);
                        let error = json!({ "type": "error", "message": e.to_string() });
                        if ws_tx.send(Message::Text(error.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            frame = frame_rx.recv() => {
                let Some(frame) = frame else { break };
                let Ok(text) = serde_json::to_string(&frame) else { continue };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    }
    subscriptions.cancel_all();
}

/// The catalog stream serves the primary cluster only.
async fn catalog_stream_handler(
    State(runtime): State<Arc<ClusterRuntime>>,
) -> Result<
    Sse<impl Stream<Item = Result<Event, Infallible>>>,
    (StatusCode, Json<serde_json::Value>),
> {
    let primary = runtime.lifecycle.primary_subsystem().ok_or_else(|| {
        error_response(KubedeckError::ClusterUnavailable(
            "no active clusters".to_string(),
        ))
    })?;

    let keep_alive = runtime.config.streams.keep_alive();
    let mut rx = primary.catalog.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(entry) => yield Ok(catalog_event(&entry)),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Catalog stream lagged by {} entries.", skipped);
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(keep_alive).text("keep-alive")))
}

fn catalog_event(entry: &CatalogEntry) -> Event {
    let data = serde_json::to_string(entry).unwrap_or_else(|_| "{}".to_string());
    Event::default().event("catalog").data(data)
}

#[derive(Debug, Deserialize)]
struct ManualRefreshRequest {
    domain: String,
    scope: String,
    #[serde(default)]
    reason: String,
}

async fn manual_refresh_enqueue(
    State(runtime): State<Arc<ClusterRuntime>>,
    Json(request): Json<ManualRefreshRequest>,
) -> impl IntoResponse {
    match runtime
        .refresh
        .enqueue(&request.domain, &request.scope, &request.reason)
    {
        Ok(id) => (StatusCode::ACCEPTED, Json(json!({ "id": id }))),
        Err(e) => {
            let (status, body) = error_response(e);
            (status, body)
        }
    }
}

async fn manual_refresh_status(
    State(runtime): State<Arc<ClusterRuntime>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match runtime.refresh.status(&id) {
        Ok(status) => (StatusCode::OK, Json(json!(status))),
        Err(e) => {
            let (status, body) = error_response(e);
            (status, body)
        }
    }
}

/// The rolling window of selection mutation samples, for the UI's debug view.
async fn selection_diagnostics(State(runtime): State<Arc<ClusterRuntime>>) -> impl IntoResponse {
    let samples: Vec<serde_json::Value> = runtime
        .coordinator
        .diagnostics
        .snapshot()
        .iter()
        .map(|sample| {
            let phases: serde_json::Map<String, serde_json::Value> = sample
                .phases
                .iter()
                .map(|(phase, elapsed)| {
                    (
                        phase.label().to_string(),
                        json!(elapsed.as_millis() as u64),
                    )
                })
                .collect();
            json!({
                "generation": sample.generation,
                "reason": sample.reason,
                "status": sample.status.label(),
                "totalMs": sample.total.as_millis() as u64,
                "phasesMs": phases,
                "error": sample.error,
            })
        })
        .collect();
    (StatusCode::OK, Json(json!({ "samples": samples })))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        gather_metrics(),
    )
}
