// crates/server-jobs/src/pool.rs
//! Bounded worker pool: the entry point for starting background jobs.

use std::future::Future;
use std::sync::Arc;

use jobcast_types::JobStatus;
use tokio::sync::{oneshot, Semaphore};

use crate::bus::EventBus;
use crate::error::RegistryError;
use crate::registry::JobRegistry;
use crate::runner::{JobContext, JobRunner};
use crate::types::{JobHandle, ProgressThrottle};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of jobs running at once.
    pub workers: usize,
    pub throttle: ProgressThrottle,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            throttle: ProgressThrottle::default(),
        }
    }
}

/// Central manager that spawns jobs onto a bounded set of workers.
///
/// Jobs submitted while every worker is busy are recorded as `Queued` in
/// the registry and start in submission order as permits free up.
#[derive(Clone)]
pub struct WorkerPool {
    registry: Arc<JobRegistry>,
    bus: EventBus,
    permits: Arc<Semaphore>,
    throttle: ProgressThrottle,
}

impl WorkerPool {
    pub fn new(registry: Arc<JobRegistry>, bus: EventBus, config: PoolConfig) -> Self {
        Self {
            registry,
            bus,
            permits: Arc::new(Semaphore::new(config.workers.max(1))),
            throttle: config.throttle,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Submit a job under a freshly generated ULID runner id.
    pub fn submit<F, Fut>(
        &self,
        kind: impl Into<String>,
        task_count: u64,
        work: F,
    ) -> Result<JobHandle, RegistryError>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Option<String>>> + Send + 'static,
    {
        self.submit_with_id(ulid::Ulid::new().to_string(), kind, task_count, work)
    }

    /// Submit a job under a caller-chosen runner id.
    pub fn submit_with_id<F, Fut>(
        &self,
        runner_id: impl Into<String>,
        kind: impl Into<String>,
        task_count: u64,
        work: F,
    ) -> Result<JobHandle, RegistryError>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Option<String>>> + Send + 'static,
    {
        let runner_id = runner_id.into();
        let kind = kind.into();
        self.registry.enqueue(&runner_id, &kind)?;

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let runner = JobRunner::new(
            runner_id.clone(),
            kind,
            task_count,
            Arc::clone(&self.registry),
            self.bus.clone(),
        )
        .with_throttle(self.throttle.clone());
        let permits = Arc::clone(&self.permits);

        let join = tokio::spawn(async move {
            let permit = tokio::select! {
                permit = permits.acquire_owned() => permit,
                Ok(()) = &mut cancel_rx => {
                    return finished(runner.abandon("cancelled"));
                }
            };
            let Ok(_permit) = permit else {
                return finished(runner.abandon("worker pool closed"));
            };
            finished(runner.run_cancellable(work, cancel_rx).await)
        });

        Ok(JobHandle::new(runner_id, cancel_tx, join))
    }

    /// Number of workers currently free.
    pub fn idle_workers(&self) -> usize {
        self.permits.available_permits()
    }
}

fn finished(result: Result<JobStatus, RegistryError>) -> Option<JobStatus> {
    match result {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::error!("job could not start: {e}");
            None
        }
    }
}
