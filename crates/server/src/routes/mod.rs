//! API route handlers for the jobcast server.

pub mod health;
pub mod jobs;
pub mod metrics;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

/// Create the combined router.
///
/// Routes:
/// - GET /api/health - Health check
/// - GET /api/jobs - Snapshot of running, queued and finished jobs
/// - GET /api/jobs/{runner_id} - A single job
/// - GET /api/jobs/ws - WebSocket push of job events
/// - GET /api/jobs/stream - SSE push of job events
/// - GET /metrics - Prometheus metrics
pub fn api_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", health::router())
        .nest("/api", jobs::router())
        .merge(metrics::router())
        .with_state(state)
}
