// crates/server/src/main.rs
//! jobcast server binary.
//!
//! Binds the HTTP listener, starts the history sweeper and (with `--demo`)
//! a synthetic job producer, then serves until Ctrl-C.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use jobcast_observability::{init_tracing, LogConfig};
use jobcast_server::demo::spawn_demo_producer;
use jobcast_server::{create_app, init_metrics, AppState, ServerConfig};

/// How often expired history entries are swept.
const HISTORY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Pause between demo job submissions.
const DEMO_SUBMIT_INTERVAL: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();

    let _log_guard = init_tracing(&LogConfig {
        json: config.log_json,
        log_dir: config.log_dir.clone(),
        ..LogConfig::default()
    })?;

    init_metrics();

    let state = AppState::from_config(&config);
    let sweeper = state.registry.spawn_history_sweeper(HISTORY_SWEEP_INTERVAL);
    let demo = config
        .demo
        .then(|| spawn_demo_producer(state.pool.clone(), DEMO_SUBMIT_INTERVAL));

    let app = create_app(state.clone());
    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(
        %addr,
        workers = config.workers,
        demo = config.demo,
        "jobcast v{} listening",
        env!("CARGO_PKG_VERSION")
    );
    eprintln!("\n  \u{2192} http://{addr}/api/jobs\n");

    let bus = state.bus.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down");
            // Ends every push stream so open connections drain.
            bus.close();
        })
        .await?;

    if let Some(demo) = demo {
        demo.abort();
    }
    sweeper.abort();
    Ok(())
}
