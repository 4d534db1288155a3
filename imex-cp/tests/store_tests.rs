//! Integration tests for the SQLite job store

use chrono::Utc;
use uuid::Uuid;

use imex_common::messages::{
    ExtractMessage, ExtractedFileStatus, ExtractedFileStatusMessage, ExtractionRequestInfoMessage,
};
use imex_cp::jobs::{ExtractJobStatus, ExtractJobStore, SqliteJobStore};
use imex_cp::Error;

fn extract_block(job_id: Uuid) -> ExtractMessage {
    ExtractMessage {
        extraction_job_identifier: job_id,
        project_number: "2026-0042".into(),
        extraction_directory: "2026-0042/images".into(),
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
        extraction_modality: Some("CT".into()),
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

async fn open_store(dir: &tempfile::TempDir) -> SqliteJobStore {
    SqliteJobStore::open(&dir.path().join("jobs.db"))
        .await
        .unwrap()
}

#[tokio::test]
async fn job_becomes_ready_when_every_expected_file_reports() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let job_id = Uuid::new_v4();

    store.record_extraction_request(&request(job_id, 2)).await.unwrap();
    store.record_file_status(&file_status(job_id, "a")).await.unwrap();

    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, ExtractJobStatus::InProgress);
    assert_eq!(job.expected_file_count, Some(2));
    assert_eq!(job.reported_file_count, 1);
    assert!(store.get_ready_jobs(None).await.unwrap().is_empty());

    store.record_file_status(&file_status(job_id, "b")).await.unwrap();
    let ready = store.get_ready_jobs(None).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].job_identifier, job_id);
    assert_eq!(ready[0].status, ExtractJobStatus::ReadyForChecks);
    assert_eq!(ready[0].reported_file_count, 2);
    assert_eq!(ready[0].project_number, "2026-0042");
}

#[tokio::test]
async fn file_statuses_may_arrive_before_the_request() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let job_id = Uuid::new_v4();

    // No cross-stage ordering guarantee: statuses land first
    store.record_file_status(&file_status(job_id, "a")).await.unwrap();
    store.record_file_status(&file_status(job_id, "b")).await.unwrap();

    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, ExtractJobStatus::InProgress);
    assert_eq!(job.expected_file_count, None);

    store.record_extraction_request(&request(job_id, 2)).await.unwrap();
    let ready = store.get_ready_jobs(None).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].expected_file_count, Some(2));
}

#[tokio::test]
async fn redelivered_messages_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let job_id = Uuid::new_v4();

    store.record_extraction_request(&request(job_id, 2)).await.unwrap();
    store.record_extraction_request(&request(job_id, 2)).await.unwrap();
    store.record_file_status(&file_status(job_id, "a")).await.unwrap();
    store.record_file_status(&file_status(job_id, "a")).await.unwrap();

    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.reported_file_count, 1);
    assert_eq!(job.status, ExtractJobStatus::InProgress);
}

#[tokio::test]
async fn terminal_transitions_are_conditional() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let job_id = Uuid::new_v4();

    store.record_extraction_request(&request(job_id, 1)).await.unwrap();
    // Not ready yet: the transition is a contract violation
    let err = store.mark_job_completed(job_id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidJobTransition { .. }));

    store.record_file_status(&file_status(job_id, "a")).await.unwrap();
    store.mark_job_completed(job_id).await.unwrap();
    assert_eq!(
        store.get_job(job_id).await.unwrap().unwrap().status,
        ExtractJobStatus::Completed
    );

    // Completed is terminal, and completed jobs are never "ready"
    let err = store.mark_job_failed(job_id, "too late").await.unwrap_err();
    assert!(matches!(err, Error::InvalidJobTransition { .. }));
    assert!(store.get_ready_jobs(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_jobs_record_their_cause() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let job_id = Uuid::new_v4();

    store.record_extraction_request(&request(job_id, 1)).await.unwrap();
    store.record_file_status(&file_status(job_id, "a")).await.unwrap();
    store.mark_job_failed(job_id, "missing file reports").await.unwrap();

    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, ExtractJobStatus::Failed);
    assert_eq!(job.failure_cause.as_deref(), Some("missing file reports"));
}

#[tokio::test]
async fn unknown_job_is_distinguished_from_bad_transition() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let err = store.mark_job_completed(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, Error::JobNotFound(_)));
}

#[tokio::test]
async fn ready_query_filters_to_a_specific_job() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    for job_id in [first, second] {
        store.record_extraction_request(&request(job_id, 1)).await.unwrap();
        store.record_file_status(&file_status(job_id, "a")).await.unwrap();
    }

    assert_eq!(store.get_ready_jobs(None).await.unwrap().len(), 2);
    let only_second = store.get_ready_jobs(Some(second)).await.unwrap();
    assert_eq!(only_second.len(), 1);
    assert_eq!(only_second[0].job_identifier, second);
}

#[tokio::test]
async fn late_file_status_after_finalization_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let job_id = Uuid::new_v4();

    store.record_extraction_request(&request(job_id, 1)).await.unwrap();
    store.record_file_status(&file_status(job_id, "a")).await.unwrap();
    store.mark_job_completed(job_id).await.unwrap();

    store.record_file_status(&file_status(job_id, "b")).await.unwrap();
    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, ExtractJobStatus::Completed);
    assert_eq!(job.reported_file_count, 1);
}

#[tokio::test]
async fn state_survives_a_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let job_id = Uuid::new_v4();
    {
        let store = open_store(&dir).await;
        store.record_extraction_request(&request(job_id, 2)).await.unwrap();
        store.record_file_status(&file_status(job_id, "a")).await.unwrap();
        store.record_file_status(&file_status(job_id, "b")).await.unwrap();
    }

    let reopened = open_store(&dir).await;
    let ready = reopened.get_ready_jobs(None).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].job_identifier, job_id);
    assert_eq!(ready[0].reported_file_count, 2);
    reopened.mark_job_completed(job_id).await.unwrap();
}
