//! Integration tests for the job snapshot and push endpoints.
//!
//! The SSE tests drive the router in-process with `oneshot`; the WebSocket
//! tests bind a real listener and connect with `tokio-tungstenite`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::StreamExt;
use jobcast_server::{create_app, AppState};
use jobcast_server_jobs::{BusConfig, EventBus, JobRegistry, PoolConfig, ProgressThrottle};
use jobcast_types::{JobEvent, JobSnapshot, JobStatus, RESYNC_CLOSE_CODE};
use pretty_assertions::assert_eq;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

/// State whose runners only emit progress on the final task.
fn quiet_state(bus_capacity: usize) -> Arc<AppState> {
    AppState::new(
        Arc::new(JobRegistry::default()),
        EventBus::new(BusConfig {
            subscriber_capacity: bus_capacity,
        }),
        PoolConfig {
            workers: 2,
            throttle: ProgressThrottle {
                every_tasks: 1_000,
                min_interval: Duration::from_secs(3600),
            },
        },
    )
}

/// Parse SSE event lines from the body string into a vec of (event_name, json_data) pairs.
fn parse_sse_events(body: &str) -> Vec<(String, serde_json::Value)> {
    let mut events = Vec::new();
    let mut current_event = String::new();
    let mut current_data = String::new();

    for line in body.lines() {
        if let Some(event_name) = line.strip_prefix("event: ") {
            current_event = event_name.trim().to_string();
        } else if let Some(data) = line.strip_prefix("data: ") {
            current_data = data.trim().to_string();
        } else if line.is_empty() && !current_event.is_empty() {
            let value = serde_json::from_str(&current_data).unwrap_or(serde_json::Value::Null);
            events.push((std::mem::take(&mut current_event), value));
            current_data.clear();
        }
    }
    if !current_event.is_empty() {
        let value = serde_json::from_str(&current_data).unwrap_or(serde_json::Value::Null);
        events.push((current_event, value));
    }
    events
}

async fn serve(state: Arc<AppState>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_app(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn test_snapshot_lists_all_groups() {
    let state = quiet_state(16);
    state.registry.create_job("run", "library_scan", 10).unwrap();
    state.registry.enqueue("wait", "library_scan").unwrap();
    state.registry.create_job("done", "library_scan", 1).unwrap();
    state.registry.complete("done", Some("ok".into())).unwrap();

    let response = create_app(state)
        .oneshot(Request::builder().uri("/api/jobs").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let snapshot: JobSnapshot = serde_json::from_slice(&body).unwrap();
    assert_eq!(snapshot.running.len(), 1);
    assert_eq!(snapshot.running[0].runner_id, "run");
    assert_eq!(snapshot.queued[0].runner_id, "wait");
    assert_eq!(snapshot.queued[0].status, JobStatus::Queued);
    assert_eq!(snapshot.history[0].runner_id, "done");
    assert_eq!(snapshot.history[0].message.as_deref(), Some("ok"));
}

#[tokio::test]
async fn test_sse_follows_job_lifecycle() {
    let state = quiet_state(64);

    let response = create_app(state.clone())
        .oneshot(
            Request::builder()
                .uri("/api/jobs/stream")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let handle = state
        .pool
        .submit_with_id("scan-1", "library_scan", 10, |ctx| async move {
            for _ in 0..10 {
                ctx.advance();
            }
            ctx.created_media(vec!["m1".into()]);
            Ok(Some("done".into()))
        })
        .unwrap();
    assert_eq!(handle.join().await, Some(JobStatus::Completed));
    state.bus.close();

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let events = parse_sse_events(std::str::from_utf8(&body).unwrap());
    let names: Vec<&str> = events.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(
        names,
        vec!["snapshot", "JobStarted", "JobProgress", "CreatedMedia", "JobComplete"]
    );

    assert_eq!(events[0].1["running"], serde_json::json!([]));
    assert_eq!(events[1].1["taskCount"], 10);
    assert_eq!(events[2].1["currentTask"], 10);
    assert_eq!(events[3].1["mediaIds"], serde_json::json!(["m1"]));
    assert_eq!(events[4].1["runnerId"], "scan-1");
    assert_eq!(events[4].1["message"], "done");
}

#[tokio::test]
async fn test_sse_lagging_client_gets_resync() {
    let state = quiet_state(2);

    let response = create_app(state.clone())
        .oneshot(
            Request::builder()
                .uri("/api/jobs/stream")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    // Nothing drains the body yet, so the third publish overflows the queue.
    for i in 1..=5 {
        state.bus.publish(JobEvent::JobProgress {
            runner_id: "r1".into(),
            current_task: i,
        });
    }

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let events = parse_sse_events(std::str::from_utf8(&body).unwrap());
    let names: Vec<&str> = events.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["snapshot", "JobProgress", "JobProgress", "resync"]);
}

#[tokio::test]
async fn test_websocket_streams_events() {
    let state = quiet_state(64);
    let addr = serve(state.clone()).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/jobs/ws"))
        .await
        .unwrap();
    assert_eq!(state.bus.subscriber_count(), 1);

    let handle = state
        .pool
        .submit_with_id("scan-ws", "library_scan", 3, |ctx| async move {
            ctx.set_progress(3);
            Err(anyhow::anyhow!("disk vanished"))
        })
        .unwrap();
    assert_eq!(handle.join().await, Some(JobStatus::Failed));

    let mut events = Vec::new();
    while events.len() < 3 {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("websocket frame")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = msg {
            events.push(serde_json::from_str::<JobEvent>(&text).unwrap());
        }
    }

    assert_eq!(
        events,
        vec![
            JobEvent::JobStarted {
                runner_id: "scan-ws".into(),
                task_count: 3,
            },
            JobEvent::JobProgress {
                runner_id: "scan-ws".into(),
                current_task: 3,
            },
            JobEvent::JobFailed {
                runner_id: "scan-ws".into(),
                message: Some("disk vanished".into()),
            },
        ]
    );
}

#[tokio::test]
async fn test_websocket_gap_closes_with_resync_code() {
    let state = quiet_state(2);
    let addr = serve(state.clone()).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/jobs/ws"))
        .await
        .unwrap();

    // The current-thread runtime cannot run the forwarder during this loop.
    for i in 1..=10 {
        state.bus.publish(JobEvent::JobProgress {
            runner_id: "r1".into(),
            current_task: i,
        });
    }

    let mut texts = 0;
    let close = loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("websocket frame")
            .unwrap()
            .unwrap();
        match msg {
            Message::Text(_) => texts += 1,
            Message::Close(frame) => break frame,
            _ => {}
        }
    };

    assert_eq!(texts, 2);
    let frame = close.expect("close frame");
    assert_eq!(u16::from(frame.code), RESYNC_CLOSE_CODE);
    assert_eq!(frame.reason.as_str(), "resync");
}

#[tokio::test]
async fn test_unknown_job_returns_404() {
    let response = create_app(quiet_state(4))
        .oneshot(
            Request::builder()
                .uri("/api/jobs/nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
