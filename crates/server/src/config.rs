// crates/server/src/config.rs
//! Command-line and environment configuration for the server binary.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use jobcast_server_jobs::{BusConfig, PoolConfig, ProgressThrottle, RegistryConfig};

/// Default port for the server.
pub const DEFAULT_PORT: u16 = 47893;

/// Server configuration. Every flag falls back to a `JOBCAST_*` variable.
#[derive(Parser, Debug, Clone)]
#[command(name = "jobcast", version, about = "Background job registry with live push")]
pub struct ServerConfig {
    /// Address to bind.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST), env = "JOBCAST_BIND")]
    pub bind: IpAddr,

    /// Port to listen on.
    #[arg(long, short, default_value_t = DEFAULT_PORT, env = "JOBCAST_PORT")]
    pub port: u16,

    /// Maximum number of jobs running at once.
    #[arg(long, default_value_t = 4, env = "JOBCAST_WORKERS")]
    pub workers: usize,

    /// Events buffered per push subscriber before it is told to resync.
    #[arg(long, default_value_t = 256, env = "JOBCAST_BUS_CAPACITY")]
    pub bus_capacity: usize,

    /// Number of finished jobs kept for snapshots.
    #[arg(long, default_value_t = 100, env = "JOBCAST_HISTORY_LIMIT")]
    pub history_limit: usize,

    /// Seconds a finished job stays in history.
    #[arg(long, default_value_t = 3600, env = "JOBCAST_HISTORY_TTL_SECS")]
    pub history_ttl_secs: u64,

    /// Emit a progress event at least every N tasks.
    #[arg(long, default_value_t = 25, env = "JOBCAST_PROGRESS_EVERY")]
    pub progress_every: u64,

    /// Minimum milliseconds between progress events of one job.
    #[arg(long, default_value_t = 250, env = "JOBCAST_PROGRESS_INTERVAL_MS")]
    pub progress_interval_ms: u64,

    /// Log as JSON lines instead of the compact format.
    #[arg(long, default_value_t = false, env = "JOBCAST_LOG_JSON")]
    pub log_json: bool,

    /// Also write daily-rotated logs into this directory.
    #[arg(long, env = "JOBCAST_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Spawn synthetic library scans so the push streams have traffic.
    #[arg(long, default_value_t = false, env = "JOBCAST_DEMO")]
    pub demo: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            workers: 4,
            bus_capacity: 256,
            history_limit: 100,
            history_ttl_secs: 3600,
            progress_every: 25,
            progress_interval_ms: 250,
            log_json: false,
            log_dir: None,
            demo: false,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            history_limit: self.history_limit,
            history_ttl: Duration::from_secs(self.history_ttl_secs),
            ..RegistryConfig::default()
        }
    }

    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            subscriber_capacity: self.bus_capacity,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.workers,
            throttle: ProgressThrottle {
                every_tasks: self.progress_every.max(1),
                min_interval: Duration::from_millis(self.progress_interval_ms),
            },
        }
    }
}
