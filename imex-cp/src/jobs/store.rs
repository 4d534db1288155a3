//! Extract job store contract
//!
//! The persistent record of per-job, per-file extraction progress. The
//! store exclusively owns job state: consumers write through the two
//! `record_*` operations, and the watcher transitions jobs only through
//! [`ExtractJobStore::mark_job_completed`] /
//! [`ExtractJobStore::mark_job_failed`], which are atomic with respect to
//! concurrent readers.
//!
//! Message delivery is at-least-once and unordered across stages: a file
//! status may arrive before its job's request announcement, and any message
//! may arrive twice. Both recording operations are idempotent and tolerate
//! either arrival order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use imex_common::messages::{ExtractedFileStatusMessage, ExtractionRequestInfoMessage};

use crate::error::{Error, Result};

/// Lifecycle of one extraction job.
///
/// `InProgress → ReadyForChecks` is the store's own transition, taken when
/// every expected file has reported a terminal status. `ReadyForChecks →
/// Completed | Failed` is taken only by the job watcher, and both are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractJobStatus {
    InProgress,
    ReadyForChecks,
    Completed,
    Failed,
}

impl ExtractJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractJobStatus::InProgress => "InProgress",
            ExtractJobStatus::ReadyForChecks => "ReadyForChecks",
            ExtractJobStatus::Completed => "Completed",
            ExtractJobStatus::Failed => "Failed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "InProgress" => Ok(ExtractJobStatus::InProgress),
            "ReadyForChecks" => Ok(ExtractJobStatus::ReadyForChecks),
            "Completed" => Ok(ExtractJobStatus::Completed),
            "Failed" => Ok(ExtractJobStatus::Failed),
            other => Err(Error::CorruptRecord(format!("unknown job status {other:?}"))),
        }
    }

    /// Whether no further transition is permitted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExtractJobStatus::Completed | ExtractJobStatus::Failed)
    }
}

impl std::fmt::Display for ExtractJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one extraction job as seen by the watcher.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractJobInfo {
    /// Unique id correlating all messages belonging to one extraction request
    pub job_identifier: Uuid,
    pub project_number: String,
    pub extraction_directory: String,
    pub job_submitted_at: DateTime<Utc>,
    pub status: ExtractJobStatus,
    /// How many file reports the request announced; `None` until the
    /// request announcement has been recorded
    pub expected_file_count: Option<u32>,
    /// How many distinct files have reported a terminal status
    pub reported_file_count: u32,
    /// Why the job failed, for jobs in `Failed`
    pub failure_cause: Option<String>,
}

/// Persistent store of per-job, per-file extraction status.
#[async_trait]
pub trait ExtractJobStore: Send + Sync + 'static {
    /// Record the announcement of an extraction request, opening the job
    /// record (or completing a placeholder opened by an early file status).
    /// Idempotent under redelivery.
    async fn record_extraction_request(&self, message: &ExtractionRequestInfoMessage)
        -> Result<()>;

    /// Record one file's terminal status. Opens a placeholder job record if
    /// the request announcement has not arrived yet; flips the job to
    /// `ReadyForChecks` when the final expected file reports. A repeated
    /// report for the same file replaces the previous one rather than
    /// counting twice.
    async fn record_file_status(&self, message: &ExtractedFileStatusMessage) -> Result<()>;

    /// Jobs currently in `ReadyForChecks`, optionally filtered to one job.
    /// Never returns jobs in any other state.
    async fn get_ready_jobs(&self, specific_job: Option<Uuid>) -> Result<Vec<ExtractJobInfo>>;

    /// Atomic terminal transition `ReadyForChecks → Completed`. Calling this
    /// on a job in any other state is a contract violation and returns
    /// [`Error::InvalidJobTransition`] without changing the record.
    async fn mark_job_completed(&self, job_id: Uuid) -> Result<()>;

    /// Atomic terminal transition `ReadyForChecks → Failed`, recording the
    /// cause. Same contract as [`Self::mark_job_completed`].
    async fn mark_job_failed(&self, job_id: Uuid, cause: &str) -> Result<()>;

    /// Snapshot one job, if known.
    async fn get_job(&self, job_id: Uuid) -> Result<Option<ExtractJobInfo>>;
}
