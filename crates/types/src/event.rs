// crates/types/src/event.rs
//! The push envelope: one tagged message per lifecycle or side-effect event.

use serde::{Deserialize, Serialize};
#[cfg(feature = "codegen")]
use ts_rs::TS;

/// Notification delivered over the push channel.
///
/// Serialized as `{ "kind": "<variant>", ...fields }`. The two `Created*`
/// kinds are global side effects and carry no `runnerId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "codegen", derive(TS), ts(export, export_to = "../../bindings/"))]
#[serde(tag = "kind")]
pub enum JobEvent {
    #[serde(rename_all = "camelCase")]
    JobStarted { runner_id: String, task_count: u64 },
    #[serde(rename_all = "camelCase")]
    JobProgress { runner_id: String, current_task: u64 },
    #[serde(rename_all = "camelCase")]
    JobComplete {
        runner_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    JobFailed {
        runner_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CreatedMedia { media_ids: Vec<String> },
    #[serde(rename_all = "camelCase")]
    CreatedSeries { series_ids: Vec<String> },
}

/// Discriminant of a [`JobEvent`], used for SSE event names and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobEventKind {
    JobStarted,
    JobProgress,
    JobComplete,
    JobFailed,
    CreatedMedia,
    CreatedSeries,
}

impl JobEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobEventKind::JobStarted => "JobStarted",
            JobEventKind::JobProgress => "JobProgress",
            JobEventKind::JobComplete => "JobComplete",
            JobEventKind::JobFailed => "JobFailed",
            JobEventKind::CreatedMedia => "CreatedMedia",
            JobEventKind::CreatedSeries => "CreatedSeries",
        }
    }
}

impl std::fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl JobEvent {
    pub fn kind(&self) -> JobEventKind {
        match self {
            JobEvent::JobStarted { .. } => JobEventKind::JobStarted,
            JobEvent::JobProgress { .. } => JobEventKind::JobProgress,
            JobEvent::JobComplete { .. } => JobEventKind::JobComplete,
            JobEvent::JobFailed { .. } => JobEventKind::JobFailed,
            JobEvent::CreatedMedia { .. } => JobEventKind::CreatedMedia,
            JobEvent::CreatedSeries { .. } => JobEventKind::CreatedSeries,
        }
    }

    /// The job this event belongs to. `None` for global side effects.
    pub fn runner_id(&self) -> Option<&str> {
        match self {
            JobEvent::JobStarted { runner_id, .. }
            | JobEvent::JobProgress { runner_id, .. }
            | JobEvent::JobComplete { runner_id, .. }
            | JobEvent::JobFailed { runner_id, .. } => Some(runner_id),
            JobEvent::CreatedMedia { .. } | JobEvent::CreatedSeries { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::JobComplete { .. } | JobEvent::JobFailed { .. })
    }
}
