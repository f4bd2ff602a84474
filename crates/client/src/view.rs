// crates/client/src/view.rs
//! Running / Queued / History grouping of the client store.

use jobcast_types::JobStatus;

use crate::store::{ClientJob, ClientJobStore};

/// Default number of finished jobs shown.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobView {
    /// Oldest first.
    pub running: Vec<ClientJob>,
    /// In the order they were accepted.
    pub queued: Vec<ClientJob>,
    /// Most recently finished first, at most `history_limit` entries.
    pub history: Vec<ClientJob>,
}

impl JobView {
    pub fn derive(store: &ClientJobStore, history_limit: usize) -> Self {
        let mut view = JobView::default();
        for job in store.jobs() {
            match job.status {
                JobStatus::Running => view.running.push(job.clone()),
                JobStatus::Queued => view.queued.push(job.clone()),
                JobStatus::Completed | JobStatus::Failed => view.history.push(job.clone()),
            }
        }

        view.running
            .sort_by(|a, b| a.started_seq.cmp(&b.started_seq).then_with(|| a.runner_id.cmp(&b.runner_id)));
        view.queued
            .sort_by(|a, b| a.started_seq.cmp(&b.started_seq).then_with(|| a.runner_id.cmp(&b.runner_id)));
        view.history
            .sort_by(|a, b| b.finished_seq.cmp(&a.finished_seq).then_with(|| a.runner_id.cmp(&b.runner_id)));
        view.history.truncate(history_limit);
        view
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty() && self.queued.is_empty() && self.history.is_empty()
    }

    pub fn find(&self, runner_id: &str) -> Option<&ClientJob> {
        self.running
            .iter()
            .chain(&self.queued)
            .chain(&self.history)
            .find(|job| job.runner_id == runner_id)
    }
}
