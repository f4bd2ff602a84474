// crates/server-jobs/src/registry.rs
//! Authoritative server-side store of job state.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobcast_types::{Job, JobSnapshot, JobStatus};
use metrics::{counter, gauge};
use tokio::task::JoinHandle;

use crate::error::RegistryError;

/// Retention policy for finished jobs.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of terminal jobs kept in history.
    pub history_limit: usize,
    /// Terminal jobs older than this are dropped from history.
    pub history_ttl: Duration,
    /// Ids of jobs that left history, remembered so a late terminal call
    /// for them is still a no-op.
    pub retired_id_limit: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            history_ttl: Duration::from_secs(60 * 60),
            retired_id_limit: 10_000,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    active: HashMap<String, Job>,
    queued: HashMap<String, Job>,
    /// Most recently finished first.
    history: VecDeque<Job>,
    /// Finished ids evicted from history, keyed to their finish time.
    retired: HashMap<String, DateTime<Utc>>,
    /// Eviction order of `retired`, most recent first.
    retired_order: VecDeque<(String, DateTime<Utc>)>,
}

impl RegistryInner {
    fn in_history(&self, runner_id: &str) -> bool {
        self.history.iter().any(|j| j.runner_id == runner_id)
    }

    fn is_finished(&self, runner_id: &str) -> bool {
        self.in_history(runner_id) || self.retired.contains_key(runner_id)
    }

    fn prune(&mut self, config: &RegistryConfig, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        while let Some(oldest) = self.history.back() {
            if self.history.len() <= config.history_limit && !is_expired(oldest, config, now) {
                break;
            }
            if let Some(job) = self.history.pop_back() {
                self.retire(job.runner_id, job.finished_at.unwrap_or(now));
                removed += 1;
            }
        }
        self.trim_retired(config.retired_id_limit);
        removed
    }

    fn retire(&mut self, runner_id: String, finished_at: DateTime<Utc>) {
        self.retired.insert(runner_id.clone(), finished_at);
        self.retired_order.push_front((runner_id, finished_at));
    }

    fn trim_retired(&mut self, limit: usize) {
        while self.retired_order.len() > limit {
            let Some((runner_id, finished_at)) = self.retired_order.pop_back() else {
                break;
            };
            // The id may have been reused and retired again since.
            if self.retired.get(&runner_id) == Some(&finished_at) {
                self.retired.remove(&runner_id);
            }
        }
    }
}

fn is_expired(job: &Job, config: &RegistryConfig, now: DateTime<Utc>) -> bool {
    let Some(finished_at) = job.finished_at else {
        return false;
    };
    let ttl = chrono::Duration::from_std(config.history_ttl).unwrap_or(chrono::Duration::MAX);
    now.signed_duration_since(finished_at) > ttl
}

/// Single authoritative map from `runner_id` to [`Job`].
///
/// All state sits behind one `RwLock` so `snapshot()` always observes a
/// consistent cut across the running, queued and history sets. The lock is
/// never held across an `.await`.
pub struct JobRegistry {
    config: RegistryConfig,
    inner: RwLock<RegistryInner>,
}

impl JobRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(|e| {
            tracing::error!("RwLock poisoned reading job registry: {e}");
            e.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(|e| {
            tracing::error!("RwLock poisoned writing job registry: {e}");
            e.into_inner()
        })
    }

    /// Record a job that has been accepted but is waiting for a worker.
    pub fn enqueue(&self, runner_id: &str, kind: &str) -> Result<Job, RegistryError> {
        let mut inner = self.write();
        if inner.active.contains_key(runner_id)
            || inner.queued.contains_key(runner_id)
            || inner.in_history(runner_id)
        {
            return Err(RegistryError::DuplicateRunner(runner_id.to_string()));
        }
        let job = Job::queued(runner_id, kind);
        inner.queued.insert(runner_id.to_string(), job.clone());
        tracing::debug!(runner_id, kind, "job queued");
        Ok(job)
    }

    /// Register a job as running with a fixed task count.
    ///
    /// A queued entry with the same id is promoted. An id that is running or
    /// still retained in history is rejected.
    pub fn create_job(
        &self,
        runner_id: &str,
        kind: &str,
        task_count: u64,
    ) -> Result<Job, RegistryError> {
        let mut inner = self.write();
        if inner.active.contains_key(runner_id) || inner.in_history(runner_id) {
            return Err(RegistryError::DuplicateRunner(runner_id.to_string()));
        }

        inner.retired.remove(runner_id);
        let job = match inner.queued.remove(runner_id) {
            Some(queued) => Job {
                status: JobStatus::Running,
                task_count,
                started_at: Some(Utc::now()),
                ..queued
            },
            None => Job::running(runner_id, kind, task_count),
        };
        inner.active.insert(runner_id.to_string(), job.clone());
        gauge!("jobs_running").set(inner.active.len() as f64);
        drop(inner);

        counter!("jobs_started_total").increment(1);
        tracing::info!(runner_id, kind = %job.kind, task_count, "job started");
        Ok(job)
    }

    /// Update the progress of a running job.
    ///
    /// Returns the clamped value when it changed, `None` when the call was a
    /// no-op (already terminal, or not ahead of the recorded progress).
    pub fn record_progress(
        &self,
        runner_id: &str,
        current_task: u64,
    ) -> Result<Option<u64>, RegistryError> {
        let mut inner = self.write();
        if let Some(job) = inner.active.get_mut(runner_id) {
            let clamped = current_task.min(job.task_count);
            if clamped <= job.current_task {
                return Ok(None);
            }
            job.current_task = clamped;
            return Ok(Some(clamped));
        }
        if inner.is_finished(runner_id) {
            tracing::debug!(runner_id, current_task, "progress for finished job ignored");
            return Ok(None);
        }
        Err(RegistryError::UnknownRunner(runner_id.to_string()))
    }

    /// Transition a running job to `Completed`.
    pub fn complete(
        &self,
        runner_id: &str,
        message: Option<String>,
    ) -> Result<Option<Job>, RegistryError> {
        self.finish(runner_id, JobStatus::Completed, message)
    }

    /// Transition a running job to `Failed`.
    pub fn fail(
        &self,
        runner_id: &str,
        message: Option<String>,
    ) -> Result<Option<Job>, RegistryError> {
        self.finish(runner_id, JobStatus::Failed, message)
    }

    /// Move a job from the active set into history.
    ///
    /// A second terminal call for the same id returns `Ok(None)` so runner
    /// retries are harmless, also after the job has left history.
    fn finish(
        &self,
        runner_id: &str,
        status: JobStatus,
        message: Option<String>,
    ) -> Result<Option<Job>, RegistryError> {
        debug_assert!(status.is_terminal());
        let now = Utc::now();
        let mut inner = self.write();

        let Some(mut job) = inner.active.remove(runner_id) else {
            if inner.is_finished(runner_id) {
                tracing::debug!(runner_id, %status, "duplicate terminal transition ignored");
                return Ok(None);
            }
            return Err(RegistryError::UnknownRunner(runner_id.to_string()));
        };

        job.status = status;
        job.message = message;
        job.finished_at = Some(now);
        inner.history.push_front(job.clone());
        inner.prune(&self.config, now);
        gauge!("jobs_running").set(inner.active.len() as f64);
        drop(inner);

        counter!("jobs_finished_total", "status" => status.as_str()).increment(1);
        match status {
            JobStatus::Failed => tracing::warn!(
                runner_id,
                kind = %job.kind,
                message = job.message.as_deref().unwrap_or(""),
                "job failed"
            ),
            _ => tracing::info!(
                runner_id,
                kind = %job.kind,
                current_task = job.current_task,
                "job completed"
            ),
        }
        Ok(Some(job))
    }

    /// Look up a job in any of the running, queued or history sets.
    ///
    /// Expired history is hidden the same way as in [`snapshot`](Self::snapshot).
    pub fn get(&self, runner_id: &str) -> Option<Job> {
        let now = Utc::now();
        let inner = self.read();
        inner
            .active
            .get(runner_id)
            .or_else(|| inner.queued.get(runner_id))
            .or_else(|| {
                inner
                    .history
                    .iter()
                    .find(|j| j.runner_id == runner_id && !is_expired(j, &self.config, now))
            })
            .cloned()
    }

    pub fn running_count(&self) -> usize {
        self.read().active.len()
    }

    /// Consistent copy of all job state.
    ///
    /// Running jobs are oldest-started first, queued jobs oldest-queued first,
    /// history most-recently-finished first. Expired history is omitted even
    /// if the sweeper has not run yet.
    pub fn snapshot(&self) -> JobSnapshot {
        let now = Utc::now();
        let inner = self.read();

        let mut running: Vec<Job> = inner.active.values().cloned().collect();
        running.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.runner_id.cmp(&b.runner_id))
        });

        let mut queued: Vec<Job> = inner.queued.values().cloned().collect();
        queued.sort_by(|a, b| {
            a.queued_at
                .cmp(&b.queued_at)
                .then_with(|| a.runner_id.cmp(&b.runner_id))
        });

        let history = inner
            .history
            .iter()
            .filter(|j| !is_expired(j, &self.config, now))
            .cloned()
            .collect();

        JobSnapshot {
            running,
            queued,
            history,
        }
    }

    /// Drop history entries beyond the retention window. Returns how many
    /// entries were removed.
    pub fn prune_history(&self) -> usize {
        self.write().prune(&self.config, Utc::now())
    }

    /// Periodically prune history until the registry is dropped.
    pub fn spawn_history_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(live) = registry.upgrade() else {
                    break;
                };
                let removed = live.prune_history();
                if removed > 0 {
                    tracing::debug!(removed, "pruned expired job history");
                }
            }
        })
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}
