// crates/server/src/routes/jobs.rs
//! API routes for background jobs.
//!
//! - GET /jobs - Snapshot of running, queued and finished jobs
//! - GET /jobs/{runner_id} - One job
//! - GET /jobs/ws - WebSocket push of `JobEvent` envelopes
//! - GET /jobs/stream - SSE push of `JobEvent` envelopes

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use jobcast_server_jobs::{RecvError, Subscription};
use jobcast_types::{Job, JobSnapshot, RESYNC_CLOSE_CODE};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Interval between keep-alive frames on push connections.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// GET /api/jobs - Consistent snapshot of all job state.
async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<JobSnapshot> {
    Json(state.registry.snapshot())
}

/// GET /api/jobs/{runner_id} - One job from any group.
async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(runner_id): Path<String>,
) -> ApiResult<Json<Job>> {
    state
        .registry
        .get(&runner_id)
        .map(Json)
        .ok_or(ApiError::JobNotFound(runner_id))
}

/// GET /api/jobs/ws - WebSocket push of job events.
///
/// One text frame per `JobEvent` envelope. The subscription is opened
/// before the upgrade completes, so a client that fetches `/api/jobs` after
/// its handshake cannot miss an event published in between. When the
/// subscriber falls behind the socket is closed with code 4000 (`resync`).
async fn jobs_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let subscription = state.bus.subscribe();
    ws.on_upgrade(move |socket| forward_events(socket, subscription))
}

async fn forward_events(socket: WebSocket, mut subscription: Subscription) {
    let (mut sink, mut stream) = socket.split();
    let subscriber = subscription.id();
    tracing::debug!(subscriber, "job websocket connected");

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            event = subscription.recv() => {
                match event {
                    Ok(event) => {
                        let json = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(e) => {
                                tracing::error!("failed to encode job event: {e}");
                                continue;
                            }
                        };
                        if sink.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Gap) => {
                        tracing::warn!(subscriber, "job websocket lagged, asking client to resync");
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: RESYNC_CLOSE_CODE,
                                reason: "resync".into(),
                            })))
                            .await;
                        break;
                    }
                    Err(RecvError::Closed) => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Pong is handled automatically by axum; clients send nothing else.
                    Some(Ok(_)) => {}
                }
            }
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::debug!(subscriber, "job websocket disconnected");
}

/// GET /api/jobs/stream - SSE stream of job events.
///
/// # Events
///
/// | Event name   | When emitted                                       |
/// |--------------|----------------------------------------------------|
/// | `snapshot`   | On connect                                         |
/// | `<kind>`     | One per `JobEvent`, named after its `kind`         |
/// | `resync`     | The subscriber lagged; the stream ends after this  |
/// | `heartbeat`  | Every 15 seconds to keep the connection open       |
async fn stream_jobs(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    // Subscribe before reading the snapshot so nothing falls in between.
    let mut subscription = state.bus.subscribe();
    let snapshot = state.registry.snapshot();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("snapshot").data(
            serde_json::to_string(&snapshot).unwrap_or_default()
        ));

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        loop {
            tokio::select! {
                event = subscription.recv() => {
                    match event {
                        Ok(event) => {
                            yield Ok(Event::default().event(event.kind().as_str()).data(
                                serde_json::to_string(&event).unwrap_or_default()
                            ));
                        }
                        Err(RecvError::Gap) => {
                            tracing::warn!("SSE job client lagged, asking it to resync");
                            yield Ok(Event::default().event("resync").data("{}"));
                            break;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                _ = heartbeat.tick() => {
                    yield Ok(Event::default().event("heartbeat").data("{}"));
                }
            }
        }
    };

    Sse::new(stream)
}

/// Build the jobs router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/ws", get(jobs_ws))
        .route("/jobs/stream", get(stream_jobs))
        .route("/jobs/{runner_id}", get(get_job))
}
