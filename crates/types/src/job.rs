// crates/types/src/job.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
#[cfg(feature = "codegen")]
use ts_rs::TS;

/// Lifecycle status of a job.
///
/// `Queued` is only ever held by jobs waiting for a worker slot. `Completed`
/// and `Failed` are terminal: once reached, the job never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "codegen", derive(TS), ts(export, export_to = "../../bindings/"))]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracked state of one runner's execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "codegen", derive(TS), ts(export, export_to = "../../bindings/"))]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub runner_id: String,
    /// Free-form label of the work, e.g. `"library_scan"`.
    #[serde(default)]
    pub kind: String,
    pub status: JobStatus,
    pub current_task: u64,
    pub task_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A freshly started job with no progress yet.
    pub fn running(runner_id: impl Into<String>, kind: impl Into<String>, task_count: u64) -> Self {
        Self {
            runner_id: runner_id.into(),
            kind: kind.into(),
            status: JobStatus::Running,
            current_task: 0,
            task_count,
            message: None,
            queued_at: None,
            started_at: Some(Utc::now()),
            finished_at: None,
        }
    }

    /// A job accepted for execution but still waiting for a worker.
    pub fn queued(runner_id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            runner_id: runner_id.into(),
            kind: kind.into(),
            status: JobStatus::Queued,
            current_task: 0,
            task_count: 0,
            message: None,
            queued_at: Some(Utc::now()),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Point-in-time, internally consistent copy of all job state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "codegen", derive(TS), ts(export, export_to = "../../bindings/"))]
pub struct JobSnapshot {
    pub running: Vec<Job>,
    pub queued: Vec<Job>,
    /// Terminal jobs, most recently finished first.
    pub history: Vec<Job>,
}

impl JobSnapshot {
    /// Iterate over every job in the snapshot regardless of group.
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.running
            .iter()
            .chain(self.queued.iter())
            .chain(self.history.iter())
    }

    pub fn len(&self) -> usize {
        self.running.len() + self.queued.len() + self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_job_serializes_camel_case() {
        let mut job = Job::running("r1", "library_scan", 10);
        job.current_task = 4;
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["runnerId"], "r1");
        assert_eq!(json["status"], "running");
        assert_eq!(json["currentTask"], 4);
        assert_eq!(json["taskCount"], 10);
        assert!(json.get("message").is_none());
        assert!(json.get("finishedAt").is_none());
    }

    #[test]
    fn test_snapshot_accepts_minimal_jobs() {
        // Older servers omit kind and timestamps.
        let raw = r#"{
            "running": [],
            "queued": [],
            "history": [{"runnerId":"r2","status":"failed","currentTask":1,"taskCount":3,"message":"boom"}]
        }"#;
        let snapshot: JobSnapshot = serde_json::from_str(raw).unwrap();
        assert_eq!(snapshot.len(), 1);
        let job = &snapshot.history[0];
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.kind, "");
        assert_eq!(job.message.as_deref(), Some("boom"));
    }
}
