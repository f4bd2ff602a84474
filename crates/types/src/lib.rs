// crates/types/src/lib.rs
//! Wire types shared by the jobcast server and its clients.
//!
//! Everything here is plain data: the [`Job`] entity, the [`JobEvent`]
//! envelope pushed to observers, and the [`JobSnapshot`] served on
//! (re)connection.

pub mod event;
pub mod job;

pub use event::{JobEvent, JobEventKind};
pub use job::{Job, JobSnapshot, JobStatus};

/// WebSocket close code sent when a subscriber fell behind and must
/// re-fetch the snapshot before trusting further events.
pub const RESYNC_CLOSE_CODE: u16 = 4000;
