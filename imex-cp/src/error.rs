//! Error types for the cohort packager

use thiserror::Error;
use uuid::Uuid;

/// Result type for cohort packager operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Messaging substrate error
    #[error("Messaging error: {0}")]
    Messaging(#[from] imex_common::Error),

    /// Referenced job does not exist in the store
    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    /// A terminal transition was requested for a job not in ReadyForChecks
    #[error("Job {job} cannot be {operation}: not in ReadyForChecks")]
    InvalidJobTransition { job: Uuid, operation: &'static str },

    /// A stored record could not be decoded
    #[error("Corrupt job record: {0}")]
    CorruptRecord(String),

    /// The job watcher has halted after an unexpected fault and refuses
    /// further reconciliation passes
    #[error("Job watcher has halted after a fatal fault")]
    WatcherHalted,

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),
}
