//! In-memory job store
//!
//! The [`ExtractJobStore`] contract over a mutexed map. Backs tests and
//! broker-embedded local runs; durable deployments use
//! [`crate::jobs::SqliteJobStore`].

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use imex_common::messages::{
    ExtractedFileStatus, ExtractedFileStatusMessage, ExtractionRequestInfoMessage,
};

use crate::error::{Error, Result};
use crate::jobs::store::{ExtractJobInfo, ExtractJobStatus, ExtractJobStore};

struct JobRecord {
    project_number: String,
    extraction_directory: String,
    job_submitted_at: DateTime<Utc>,
    status: ExtractJobStatus,
    expected_file_count: Option<u32>,
    /// Terminal status per reported source file path
    files: HashMap<String, ExtractedFileStatus>,
    failure_cause: Option<String>,
}

impl JobRecord {
    fn placeholder(message: &ExtractedFileStatusMessage) -> Self {
        Self {
            project_number: message.extract.project_number.clone(),
            extraction_directory: message.extract.extraction_directory.clone(),
            job_submitted_at: message.extract.job_submitted_at,
            status: ExtractJobStatus::InProgress,
            expected_file_count: None,
            files: HashMap::new(),
            failure_cause: None,
        }
    }

    /// `InProgress → ReadyForChecks` once every expected file has reported.
    fn check_ready(&mut self) {
        if self.status != ExtractJobStatus::InProgress {
            return;
        }
        if let Some(expected) = self.expected_file_count {
            if self.files.len() as u32 >= expected {
                self.status = ExtractJobStatus::ReadyForChecks;
            }
        }
    }

    fn info(&self, job_identifier: Uuid) -> ExtractJobInfo {
        ExtractJobInfo {
            job_identifier,
            project_number: self.project_number.clone(),
            extraction_directory: self.extraction_directory.clone(),
            job_submitted_at: self.job_submitted_at,
            status: self.status,
            expected_file_count: self.expected_file_count,
            reported_file_count: self.files.len() as u32,
            failure_cause: self.failure_cause.clone(),
        }
    }
}

/// Job store held entirely in process memory.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maintenance override: force a job into a status regardless of the
    /// transition rules. Lets operator tooling (and the watcher tests)
    /// re-drive a job through reconciliation.
    pub fn force_status(&self, job_id: Uuid, status: ExtractJobStatus) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let record = jobs.get_mut(&job_id).ok_or(Error::JobNotFound(job_id))?;
        record.status = status;
        Ok(())
    }

    fn terminal_transition(
        &self,
        job_id: Uuid,
        operation: &'static str,
        to: ExtractJobStatus,
        cause: Option<&str>,
    ) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let record = jobs.get_mut(&job_id).ok_or(Error::JobNotFound(job_id))?;
        if record.status != ExtractJobStatus::ReadyForChecks {
            return Err(Error::InvalidJobTransition { job: job_id, operation });
        }
        record.status = to;
        record.failure_cause = cause.map(String::from);
        Ok(())
    }
}

#[async_trait]
impl ExtractJobStore for InMemoryJobStore {
    async fn record_extraction_request(
        &self,
        message: &ExtractionRequestInfoMessage,
    ) -> Result<()> {
        let job_id = message.extract.extraction_job_identifier;
        let mut jobs = self.jobs.lock().unwrap();
        let record = jobs.entry(job_id).or_insert_with(|| JobRecord {
            project_number: String::new(),
            extraction_directory: String::new(),
            job_submitted_at: message.extract.job_submitted_at,
            status: ExtractJobStatus::InProgress,
            expected_file_count: None,
            files: HashMap::new(),
            failure_cause: None,
        });

        // A redelivered announcement for a job already past InProgress has
        // nothing left to contribute.
        if record.status != ExtractJobStatus::InProgress {
            return Ok(());
        }
        record.project_number = message.extract.project_number.clone();
        record.extraction_directory = message.extract.extraction_directory.clone();
        record.job_submitted_at = message.extract.job_submitted_at;
        record.expected_file_count = Some(message.key_value_count);
        record.check_ready();
        Ok(())
    }

    async fn record_file_status(&self, message: &ExtractedFileStatusMessage) -> Result<()> {
        let job_id = message.extract.extraction_job_identifier;
        let mut jobs = self.jobs.lock().unwrap();
        let record = jobs
            .entry(job_id)
            .or_insert_with(|| JobRecord::placeholder(message));

        if record.status.is_terminal() {
            warn!(job = %job_id, file = %message.source_file_path,
                "ignoring file status for a job already finalized");
            return Ok(());
        }
        record.files
            .insert(message.source_file_path.clone(), message.status);
        record.check_ready();
        Ok(())
    }

    async fn get_ready_jobs(&self, specific_job: Option<Uuid>) -> Result<Vec<ExtractJobInfo>> {
        let jobs = self.jobs.lock().unwrap();
        let mut ready: Vec<ExtractJobInfo> = jobs
            .iter()
            .filter(|(id, record)| {
                record.status == ExtractJobStatus::ReadyForChecks
                    && specific_job.map_or(true, |wanted| **id == wanted)
            })
            .map(|(id, record)| record.info(*id))
            .collect();
        ready.sort_by_key(|job| job.job_submitted_at);
        Ok(ready)
    }

    async fn mark_job_completed(&self, job_id: Uuid) -> Result<()> {
        self.terminal_transition(job_id, "completed", ExtractJobStatus::Completed, None)
    }

    async fn mark_job_failed(&self, job_id: Uuid, cause: &str) -> Result<()> {
        self.terminal_transition(job_id, "failed", ExtractJobStatus::Failed, Some(cause))
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ExtractJobInfo>> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs.get(&job_id).map(|record| record.info(job_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imex_common::messages::ExtractMessage;

    fn extract_block(job_id: Uuid) -> ExtractMessage {
        ExtractMessage {
            extraction_job_identifier: job_id,
            project_number: "2026-0099".into(),
            extraction_directory: "2026-0099/images".into(),
            job_submitted_at: Utc::now(),
            is_identifiable_extraction: false,
            is_no_filter_extraction: false,
        }
    }

    fn request(job_id: Uuid, expected: u32) -> ExtractionRequestInfoMessage {
        ExtractionRequestInfoMessage {
            extract: extract_block(job_id),
            key_tag: "SeriesInstanceUID".into(),
            key_value_count: expected,
            extraction_modality: None,
        }
    }

    fn file_status(job_id: Uuid, path: &str) -> ExtractedFileStatusMessage {
        ExtractedFileStatusMessage {
            extract: extract_block(job_id),
            source_file_path: path.into(),
            status: ExtractedFileStatus::Success,
            output_file_path: Some(format!("out/{path}")),
            status_message: None,
        }
    }

    #[tokio::test]
    async fn job_becomes_ready_when_every_expected_file_reports() {
        let store = InMemoryJobStore::new();
        let job_id = Uuid::new_v4();

        store.record_extraction_request(&request(job_id, 2)).await.unwrap();
        store.record_file_status(&file_status(job_id, "a")).await.unwrap();

        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, ExtractJobStatus::InProgress);
        assert!(store.get_ready_jobs(None).await.unwrap().is_empty());

        store.record_file_status(&file_status(job_id, "b")).await.unwrap();
        let ready = store.get_ready_jobs(None).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].status, ExtractJobStatus::ReadyForChecks);
        assert_eq!(ready[0].reported_file_count, 2);
    }

    #[tokio::test]
    async fn file_statuses_may_arrive_before_the_request() {
        let store = InMemoryJobStore::new();
        let job_id = Uuid::new_v4();

        store.record_file_status(&file_status(job_id, "a")).await.unwrap();
        store.record_file_status(&file_status(job_id, "b")).await.unwrap();
        assert!(store.get_ready_jobs(None).await.unwrap().is_empty());

        store.record_extraction_request(&request(job_id, 2)).await.unwrap();
        assert_eq!(store.get_ready_jobs(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn redelivered_file_status_counts_once() {
        let store = InMemoryJobStore::new();
        let job_id = Uuid::new_v4();

        store.record_extraction_request(&request(job_id, 2)).await.unwrap();
        store.record_file_status(&file_status(job_id, "a")).await.unwrap();
        store.record_file_status(&file_status(job_id, "a")).await.unwrap();

        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.reported_file_count, 1);
        assert_eq!(job.status, ExtractJobStatus::InProgress);
    }

    #[tokio::test]
    async fn terminal_transitions_only_from_ready() {
        let store = InMemoryJobStore::new();
        let job_id = Uuid::new_v4();

        store.record_extraction_request(&request(job_id, 1)).await.unwrap();
        let err = store.mark_job_completed(job_id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidJobTransition { .. }));

        store.record_file_status(&file_status(job_id, "a")).await.unwrap();
        store.mark_job_completed(job_id).await.unwrap();
        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, ExtractJobStatus::Completed);

        // Completed is terminal
        let err = store.mark_job_failed(job_id, "too late").await.unwrap_err();
        assert!(matches!(err, Error::InvalidJobTransition { .. }));
        assert!(store.get_ready_jobs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_job_is_reported() {
        let store = InMemoryJobStore::new();
        let err = store.mark_job_completed(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::JobNotFound(_)));
    }

    #[tokio::test]
    async fn ready_query_filters_to_a_specific_job() {
        let store = InMemoryJobStore::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        for job_id in [first, second] {
            store.record_extraction_request(&request(job_id, 1)).await.unwrap();
            store.record_file_status(&file_status(job_id, "a")).await.unwrap();
        }

        let all = store.get_ready_jobs(None).await.unwrap();
        assert_eq!(all.len(), 2);
        let only_second = store.get_ready_jobs(Some(second)).await.unwrap();
        assert_eq!(only_second.len(), 1);
        assert_eq!(only_second[0].job_identifier, second);
    }
}
