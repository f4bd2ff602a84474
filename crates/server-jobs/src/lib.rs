// crates/server-jobs/src/lib.rs
//! Background job system for long-running async work.
//!
//! Provides:
//! - `JobRegistry`: authoritative store of active, queued and finished jobs
//! - `EventBus`: non-blocking fan-out of `JobEvent`s to bounded subscriber queues
//! - `JobRunner`: drives one job through its lifecycle and emits its events
//! - `WorkerPool`: bounded concurrency, queueing and cancellation handles

pub mod bus;
pub mod error;
pub mod pool;
pub mod registry;
pub mod runner;
pub mod types;

pub use bus::{BusConfig, EventBus, RecvError, Subscription};
pub use error::RegistryError;
pub use pool::{PoolConfig, WorkerPool};
pub use registry::{JobRegistry, RegistryConfig};
pub use runner::{JobContext, JobRunner};
pub use types::{JobHandle, ProgressThrottle};
