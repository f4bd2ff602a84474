// crates/client/src/store.rs
//! Client-side reducer folding snapshots and events into a job map.
//!
//! The fold is synchronous and never lets a job show impossible state:
//! progress only moves forward, a terminal job stays terminal, and updates
//! from a superseded connection are dropped.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use jobcast_types::{Job, JobEvent, JobSnapshot, JobStatus};

use crate::channel::ChannelUpdate;
use crate::view::JobView;

/// A job as the client currently understands it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientJob {
    pub runner_id: String,
    /// Empty for shadow entries created from a bare event.
    pub kind: String,
    pub status: JobStatus,
    pub current_task: u64,
    /// `None` until a `JobStarted` or snapshot reports it.
    pub task_count: Option<u64>,
    pub message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Position in start order, for stable view ordering.
    pub(crate) started_seq: u64,
    /// Position in finish order; 0 while not terminal.
    pub(crate) finished_seq: u64,
}

impl ClientJob {
    fn shadow(runner_id: String, status: JobStatus, started_seq: u64) -> Self {
        Self {
            runner_id,
            kind: String::new(),
            status,
            current_task: 0,
            task_count: None,
            message: None,
            started_at: Some(Utc::now()),
            finished_at: None,
            started_seq,
            finished_seq: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True for entries created from an event without a prior start.
    pub fn is_shadow(&self) -> bool {
        self.task_count.is_none()
    }

    /// Completed fraction in `0.0..=1.0`, if the task count is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.task_count {
            Some(0) => Some(1.0),
            Some(total) => Some(self.current_task as f64 / total as f64),
            None => None,
        }
    }
}

/// Entity-creation notifications forwarded to collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    CreatedMedia(Vec<String>),
    CreatedSeries(Vec<String>),
}

/// What applying one update did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The job map changed.
    Changed,
    /// Valid but redundant: duplicate, regression, or event for a finished job.
    Ignored,
    /// From a superseded connection; dropped.
    Stale,
    /// Not job state; hand it on.
    SideEffect(SideEffect),
}

#[derive(Debug, Default, Clone)]
pub struct ClientJobStore {
    jobs: HashMap<String, ClientJob>,
    generation: u64,
    next_seq: u64,
}

impl ClientJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generation of the snapshot currently applied.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, runner_id: &str) -> Option<&ClientJob> {
        self.jobs.get(runner_id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &ClientJob> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn view(&self, history_limit: usize) -> JobView {
        JobView::derive(self, history_limit)
    }

    pub fn apply(&mut self, update: ChannelUpdate) -> ApplyOutcome {
        match update {
            ChannelUpdate::Snapshot {
                generation,
                snapshot,
            } => self.apply_snapshot(generation, snapshot),
            ChannelUpdate::Event { generation, event } => self.apply_event(generation, event),
        }
    }

    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Replace the whole map with a server snapshot.
    pub fn apply_snapshot(&mut self, generation: u64, snapshot: JobSnapshot) -> ApplyOutcome {
        if generation < self.generation {
            tracing::debug!(generation, current = self.generation, "dropping stale snapshot");
            return ApplyOutcome::Stale;
        }
        self.generation = generation;
        self.jobs.clear();

        // Running arrives oldest first, history most recent first.
        for job in snapshot.running.into_iter().chain(snapshot.queued) {
            let seq = self.seq();
            self.insert_from_snapshot(job, seq, 0);
        }
        let finished: Vec<Job> = snapshot.history.into_iter().rev().collect();
        for job in finished {
            let seq = self.seq();
            self.insert_from_snapshot(job, seq, seq);
        }
        ApplyOutcome::Changed
    }

    fn insert_from_snapshot(&mut self, job: Job, started_seq: u64, finished_seq: u64) {
        let task_count = match job.status {
            JobStatus::Queued => None,
            _ => Some(job.task_count),
        };
        let entry = ClientJob {
            runner_id: job.runner_id.clone(),
            kind: job.kind,
            status: job.status,
            current_task: job.current_task.min(job.task_count),
            task_count,
            message: job.message,
            started_at: job.started_at.or(job.queued_at),
            finished_at: job.finished_at,
            started_seq,
            finished_seq: if job.status.is_terminal() { finished_seq } else { 0 },
        };
        self.jobs.insert(job.runner_id, entry);
    }

    /// Fold one live event.
    pub fn apply_event(&mut self, generation: u64, event: JobEvent) -> ApplyOutcome {
        if generation < self.generation {
            return ApplyOutcome::Stale;
        }

        match event {
            JobEvent::JobStarted {
                runner_id,
                task_count,
            } => self.started(runner_id, task_count),
            JobEvent::JobProgress {
                runner_id,
                current_task,
            } => self.progress(runner_id, current_task),
            JobEvent::JobComplete { runner_id, message } => {
                self.finished(runner_id, JobStatus::Completed, message)
            }
            JobEvent::JobFailed { runner_id, message } => {
                self.finished(runner_id, JobStatus::Failed, message)
            }
            JobEvent::CreatedMedia { media_ids } => {
                ApplyOutcome::SideEffect(SideEffect::CreatedMedia(media_ids))
            }
            JobEvent::CreatedSeries { series_ids } => {
                ApplyOutcome::SideEffect(SideEffect::CreatedSeries(series_ids))
            }
        }
    }

    fn started(&mut self, runner_id: String, task_count: u64) -> ApplyOutcome {
        let seq = self.seq();
        match self.jobs.get_mut(&runner_id) {
            Some(job) if job.is_terminal() => ApplyOutcome::Ignored,
            Some(job) if job.status == JobStatus::Queued => {
                job.status = JobStatus::Running;
                job.task_count = Some(task_count);
                job.current_task = 0;
                job.started_at = Some(Utc::now());
                job.started_seq = seq;
                ApplyOutcome::Changed
            }
            // Redelivered start: keep progress, fill in a shadow's count.
            Some(job) => {
                if job.task_count.is_some() {
                    return ApplyOutcome::Ignored;
                }
                job.task_count = Some(task_count);
                job.current_task = job.current_task.min(task_count);
                ApplyOutcome::Changed
            }
            None => {
                let mut job = ClientJob::shadow(runner_id.clone(), JobStatus::Running, seq);
                job.task_count = Some(task_count);
                self.jobs.insert(runner_id, job);
                ApplyOutcome::Changed
            }
        }
    }

    fn progress(&mut self, runner_id: String, current_task: u64) -> ApplyOutcome {
        match self.jobs.get_mut(&runner_id) {
            Some(job) if job.is_terminal() => ApplyOutcome::Ignored,
            Some(job) => {
                let mut changed = false;
                if job.status == JobStatus::Queued {
                    job.status = JobStatus::Running;
                    changed = true;
                }
                let next = job
                    .task_count
                    .map_or(current_task, |total| current_task.min(total));
                if next > job.current_task {
                    job.current_task = next;
                    changed = true;
                }
                if changed {
                    ApplyOutcome::Changed
                } else {
                    ApplyOutcome::Ignored
                }
            }
            None => {
                let seq = self.seq();
                let mut job = ClientJob::shadow(runner_id.clone(), JobStatus::Running, seq);
                job.current_task = current_task;
                self.jobs.insert(runner_id, job);
                ApplyOutcome::Changed
            }
        }
    }

    fn finished(
        &mut self,
        runner_id: String,
        status: JobStatus,
        message: Option<String>,
    ) -> ApplyOutcome {
        let seq = self.seq();
        let job = self
            .jobs
            .entry(runner_id)
            .or_insert_with_key(|id| ClientJob::shadow(id.clone(), status, seq));
        if job.is_terminal() && job.finished_seq != 0 {
            return ApplyOutcome::Ignored;
        }
        job.status = status;
        job.message = message;
        job.finished_at = Some(Utc::now());
        job.finished_seq = seq;
        ApplyOutcome::Changed
    }
}
