// crates/server-jobs/src/types.rs
//! Handles and tuning knobs for the background job system.

use std::time::Duration;

use jobcast_types::JobStatus;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// How often a runner turns progress updates into `JobProgress` events.
///
/// An event goes out once either threshold is crossed since the last one,
/// and always when the job reaches its final task.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    pub every_tasks: u64,
    pub min_interval: Duration,
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self {
            every_tasks: 25,
            min_interval: Duration::from_millis(250),
        }
    }
}

impl ProgressThrottle {
    /// Emit an event for every progress update.
    pub fn every_update() -> Self {
        Self {
            every_tasks: 1,
            min_interval: Duration::ZERO,
        }
    }
}

/// Handle to a submitted job, used for cancellation and for awaiting the
/// terminal status.
pub struct JobHandle {
    runner_id: String,
    cancel_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<Option<JobStatus>>,
}

impl JobHandle {
    pub(crate) fn new(
        runner_id: String,
        cancel_tx: oneshot::Sender<()>,
        join: JoinHandle<Option<JobStatus>>,
    ) -> Self {
        Self {
            runner_id,
            cancel_tx: Some(cancel_tx),
            join,
        }
    }

    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    /// Cancel the job. Returns true if the cancellation signal was sent.
    pub fn cancel(&mut self) -> bool {
        if let Some(tx) = self.cancel_tx.take() {
            tx.send(()).is_ok()
        } else {
            false
        }
    }

    /// Wait for the job to finish.
    ///
    /// Returns the terminal status, or `None` if the job never reached the
    /// registry (e.g. its id was rejected).
    pub async fn join(self) -> Option<JobStatus> {
        match self.join.await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(runner_id = %self.runner_id, "job task aborted: {e}");
                None
            }
        }
    }
}
