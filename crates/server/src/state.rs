// crates/server/src/state.rs
//! Application state for the Axum server.

use std::sync::Arc;
use std::time::Instant;

use jobcast_server_jobs::{EventBus, JobRegistry, PoolConfig, WorkerPool};

use crate::config::ServerConfig;

/// Shared application state accessible from all route handlers.
///
/// The registry is an explicitly owned instance handed to the pool and the
/// routes; there is no process-global job state.
pub struct AppState {
    /// Server start time for uptime tracking.
    pub start_time: Instant,
    /// Authoritative job store, source of every snapshot.
    pub registry: Arc<JobRegistry>,
    /// Fan-out of job events to push subscribers.
    pub bus: EventBus,
    /// Bounded worker pool used to start jobs.
    pub pool: WorkerPool,
}

impl AppState {
    /// Build state from explicit parts.
    pub fn new(registry: Arc<JobRegistry>, bus: EventBus, pool_config: PoolConfig) -> Arc<Self> {
        let pool = WorkerPool::new(Arc::clone(&registry), bus.clone(), pool_config);
        Arc::new(Self {
            start_time: Instant::now(),
            registry,
            bus,
            pool,
        })
    }

    /// Build state from the command-line / environment configuration.
    pub fn from_config(config: &ServerConfig) -> Arc<Self> {
        Self::new(
            Arc::new(JobRegistry::new(config.registry_config())),
            EventBus::new(config.bus_config()),
            config.pool_config(),
        )
    }

    /// Default-configured state, for tests and embedding.
    pub fn for_tests() -> Arc<Self> {
        Self::new(
            Arc::new(JobRegistry::default()),
            EventBus::default(),
            PoolConfig::default(),
        )
    }

    /// Get the server uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
