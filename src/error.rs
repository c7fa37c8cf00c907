//! Core error taxonomy.
//!
//! Every fallible core operation returns one of these variants; the API layer
//! maps them onto HTTP status codes. Transient I/O (log-file writes, observer
//! sends) is absorbed at the call site and never surfaces here.

use thiserror::Error;

use crate::store::TaskStatus;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input; the task is not created / the change is rejected.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown task id.
    #[error("task {0} not found")]
    NotFound(i64),

    /// A status transition the state machine does not allow.
    #[error("invalid transition: {from} -> {to}")]
    StateConflict { from: TaskStatus, to: TaskStatus },

    /// Provisioning the isolated working copy failed; carries git stderr.
    #[error("workspace error: {0}")]
    Workspace(String),

    /// The agent process could not be launched or died before any terminal event.
    #[error("executor error: {0}")]
    Executor(String),

    /// Anything else (storage corruption, join failures, ...).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
