// crates/server-jobs/src/error.rs
use thiserror::Error;

/// Misuse of the registry by a runner or an administrative caller.
///
/// Fatal to the call that produced it, never to other jobs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Runner already registered: {0}")]
    DuplicateRunner(String),

    #[error("Unknown runner: {0}")]
    UnknownRunner(String),
}
