// crates/server-jobs/src/runner.rs
//! Drives one job through `Idle → Running → {Completed, Failed}`.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use jobcast_types::{JobEvent, JobStatus};
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinError};

use crate::bus::EventBus;
use crate::error::RegistryError;
use crate::registry::JobRegistry;
use crate::types::ProgressThrottle;

/// Runs a single job and emits its lifecycle events.
///
/// The work closure receives a [`JobContext`] for reporting progress and
/// side effects. Whatever happens inside it (an `Err`, a panic, or a
/// cancellation) the runner records exactly one terminal state in the
/// registry and publishes exactly one terminal event.
pub struct JobRunner {
    runner_id: String,
    kind: String,
    task_count: u64,
    registry: Arc<JobRegistry>,
    bus: EventBus,
    throttle: ProgressThrottle,
}

enum Outcome {
    Completed(Option<String>),
    Failed(Option<String>),
}

impl Outcome {
    fn from_join(joined: Result<anyhow::Result<Option<String>>, JoinError>) -> Self {
        match joined {
            Ok(Ok(message)) => Outcome::Completed(message),
            Ok(Err(e)) => Outcome::Failed(Some(format!("{e:#}"))),
            Err(e) if e.is_panic() => Outcome::Failed(Some(format!(
                "job panicked: {}",
                panic_message(e.into_panic())
            ))),
            Err(e) => Outcome::Failed(Some(format!("job aborted: {e}"))),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl JobRunner {
    pub fn new(
        runner_id: impl Into<String>,
        kind: impl Into<String>,
        task_count: u64,
        registry: Arc<JobRegistry>,
        bus: EventBus,
    ) -> Self {
        Self {
            runner_id: runner_id.into(),
            kind: kind.into(),
            task_count,
            registry,
            bus,
            throttle: ProgressThrottle::default(),
        }
    }

    pub fn with_throttle(mut self, throttle: ProgressThrottle) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    /// Run `work` to completion.
    ///
    /// Fails only if the registry refuses to start the job; every started job
    /// ends in `Ok(Completed | Failed)`.
    pub async fn run<F, Fut>(self, work: F) -> Result<JobStatus, RegistryError>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Option<String>>> + Send + 'static,
    {
        self.execute(work, None).await
    }

    /// Like [`run`](Self::run), but a signal on `cancel_rx` aborts the work
    /// and fails the job with the message `"cancelled"`.
    pub async fn run_cancellable<F, Fut>(
        self,
        work: F,
        cancel_rx: oneshot::Receiver<()>,
    ) -> Result<JobStatus, RegistryError>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Option<String>>> + Send + 'static,
    {
        self.execute(work, Some(cancel_rx)).await
    }

    /// Start and immediately fail the job without running any work.
    ///
    /// Used when a queued job can no longer run, so observers still see a
    /// started/failed pair rather than a job that silently disappears.
    pub fn abandon(self, reason: &str) -> Result<JobStatus, RegistryError> {
        let ctx = self.start()?;
        Ok(self.finish(&ctx, Outcome::Failed(Some(reason.to_string()))))
    }

    async fn execute<F, Fut>(
        self,
        work: F,
        cancel_rx: Option<oneshot::Receiver<()>>,
    ) -> Result<JobStatus, RegistryError>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Option<String>>> + Send + 'static,
    {
        let ctx = self.start()?;
        let mut task = tokio::spawn(work(ctx.clone()));
        let guard = FinishOnDrop {
            runner: &self,
            ctx: &ctx,
            task: task.abort_handle(),
            armed: true,
        };

        let outcome = match cancel_rx {
            Some(mut cancel_rx) => tokio::select! {
                joined = &mut task => Outcome::from_join(joined),
                Ok(()) = &mut cancel_rx => {
                    ctx.inner.cancelled.store(true, Ordering::Release);
                    task.abort();
                    // Wait until the work has actually stopped so no progress
                    // can race the terminal event.
                    let _ = (&mut task).await;
                    tracing::info!(runner_id = %self.runner_id, "job cancelled");
                    Outcome::Failed(Some("cancelled".to_string()))
                }
            },
            None => Outcome::from_join(task.await),
        };

        guard.disarm();
        Ok(self.finish(&ctx, outcome))
    }

    fn start(&self) -> Result<JobContext, RegistryError> {
        let job = self
            .registry
            .create_job(&self.runner_id, &self.kind, self.task_count)?;
        self.bus.publish(JobEvent::JobStarted {
            runner_id: self.runner_id.clone(),
            task_count: job.task_count,
        });
        Ok(JobContext::new(
            self.runner_id.clone(),
            job.task_count,
            Arc::clone(&self.registry),
            self.bus.clone(),
            self.throttle.clone(),
        ))
    }

    fn finish(&self, ctx: &JobContext, outcome: Outcome) -> JobStatus {
        ctx.close();

        let (result, intended) = match outcome {
            Outcome::Completed(message) => (
                self.registry.complete(&self.runner_id, message),
                JobStatus::Completed,
            ),
            Outcome::Failed(message) => (
                self.registry.fail(&self.runner_id, message),
                JobStatus::Failed,
            ),
        };

        match result {
            Ok(Some(job)) => {
                let event = match job.status {
                    JobStatus::Completed => JobEvent::JobComplete {
                        runner_id: job.runner_id,
                        message: job.message,
                    },
                    _ => JobEvent::JobFailed {
                        runner_id: job.runner_id,
                        message: job.message,
                    },
                };
                self.bus.publish(event);
                job.status
            }
            // Already finished by someone else; their transition stands.
            Ok(None) => self
                .registry
                .get(&self.runner_id)
                .map(|j| j.status)
                .unwrap_or(intended),
            Err(e) => {
                tracing::error!(runner_id = %self.runner_id, "failed to record terminal state: {e}");
                intended
            }
        }
    }
}

/// Fails the job if the future driving it is dropped before it finished,
/// so a started job never stays `Running` with nobody left to end it.
struct FinishOnDrop<'a> {
    runner: &'a JobRunner,
    ctx: &'a JobContext,
    task: AbortHandle,
    armed: bool,
}

impl FinishOnDrop<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for FinishOnDrop<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.ctx.inner.cancelled.store(true, Ordering::Release);
        self.task.abort();
        tracing::warn!(runner_id = %self.runner.runner_id, "job driver dropped, cancelling");
        // Closing the context first keeps late progress from the aborted
        // work out of the registry and off the bus.
        self.runner
            .finish(self.ctx, Outcome::Failed(Some("cancelled".to_string())));
    }
}

struct ProgressState {
    current: u64,
    emitted: u64,
    last_emit: Instant,
    closed: bool,
}

struct ContextInner {
    runner_id: String,
    task_count: u64,
    registry: Arc<JobRegistry>,
    bus: EventBus,
    throttle: ProgressThrottle,
    progress: Mutex<ProgressState>,
    cancelled: AtomicBool,
}

impl ContextInner {
    fn progress(&self) -> MutexGuard<'_, ProgressState> {
        self.progress.lock().unwrap_or_else(|e| {
            tracing::error!("Mutex poisoned on job progress: {e}");
            e.into_inner()
        })
    }

    fn should_emit(&self, state: &ProgressState) -> bool {
        state.current == self.task_count
            || state.current - state.emitted >= self.throttle.every_tasks
            || state.last_emit.elapsed() >= self.throttle.min_interval
    }

    fn emit(&self, state: &mut ProgressState) {
        self.bus.publish(JobEvent::JobProgress {
            runner_id: self.runner_id.clone(),
            current_task: state.current,
        });
        state.emitted = state.current;
        state.last_emit = Instant::now();
    }
}

/// Reporting surface handed to a job's work.
///
/// Progress is recorded in the registry on every call; `JobProgress` events
/// are coalesced according to the runner's [`ProgressThrottle`]. Calls made
/// after the job finished are ignored.
#[derive(Clone)]
pub struct JobContext {
    inner: Arc<ContextInner>,
}

impl JobContext {
    fn new(
        runner_id: String,
        task_count: u64,
        registry: Arc<JobRegistry>,
        bus: EventBus,
        throttle: ProgressThrottle,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                runner_id,
                task_count,
                registry,
                bus,
                throttle,
                progress: Mutex::new(ProgressState {
                    current: 0,
                    emitted: 0,
                    last_emit: Instant::now(),
                    closed: false,
                }),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    pub fn runner_id(&self) -> &str {
        &self.inner.runner_id
    }

    pub fn task_count(&self) -> u64 {
        self.inner.task_count
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Set absolute progress. Returns the progress now on record.
    pub fn set_progress(&self, current_task: u64) -> u64 {
        self.update(|_| current_task)
    }

    /// Mark one more task done. Returns the progress now on record.
    pub fn advance(&self) -> u64 {
        self.update(|current| current.saturating_add(1))
    }

    fn update(&self, next: impl FnOnce(u64) -> u64) -> u64 {
        let inner = &self.inner;
        let mut state = inner.progress();
        if state.closed {
            return state.current;
        }
        let target = next(state.current);
        match inner.registry.record_progress(&inner.runner_id, target) {
            Ok(Some(accepted)) => {
                state.current = accepted;
                if inner.should_emit(&state) {
                    inner.emit(&mut state);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(runner_id = %inner.runner_id, "progress update rejected: {e}"),
        }
        state.current
    }

    /// Announce media entities created by this job.
    pub fn created_media(&self, media_ids: Vec<String>) {
        self.inner.bus.publish(JobEvent::CreatedMedia { media_ids });
    }

    /// Announce series entities created by this job.
    pub fn created_series(&self, series_ids: Vec<String>) {
        self.inner.bus.publish(JobEvent::CreatedSeries { series_ids });
    }

    /// Flush any coalesced progress and stop accepting updates.
    fn close(&self) {
        let inner = &self.inner;
        let mut state = inner.progress();
        if state.closed {
            return;
        }
        state.closed = true;
        if state.current > state.emitted {
            inner.emit(&mut state);
        }
    }
}
