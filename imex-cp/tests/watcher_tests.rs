//! Integration tests for the job completion watcher
//!
//! Covers the reconciliation scenarios: completion, declared verification
//! failure, the single-flight invariant under racing passes, clean stop
//! semantics, and the halt-on-unexpected-fault policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use imex_common::fatal::fatal_channel;
use imex_common::messages::{
    ExtractMessage, ExtractedFileStatus, ExtractedFileStatusMessage, ExtractionRequestInfoMessage,
};
use imex_cp::jobs::{
    ExtractJobInfo, ExtractJobStatus, ExtractJobStore, ExtractJobWatcher, InMemoryJobStore,
    JobCompleteNotifier, JobWatcherOptions,
};
use imex_cp::{Error, Result};

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
        extraction_modality: None,
    }
}

fn file_status(job_id: Uuid, path: &str) -> ExtractedFileStatusMessage {
    ExtractedFileStatusMessage {
        extract: extract_block(job_id),
        source_file_path: path.into(),
        status: ExtractedFileStatus::Success,
        output_file_path: None,
        status_message: None,
    }
}

/// Make a job fully reported and ready for checks.
async fn make_ready(store: &InMemoryJobStore, job_id: Uuid, files: u32) {
    store.record_extraction_request(&request(job_id, files)).await.unwrap();
    for i in 0..files {
        store
            .record_file_status(&file_status(job_id, &format!("file-{i}")))
            .await
            .unwrap();
    }
}

/// Notifier recording every completion it sees, optionally slowly.
struct CountingNotifier {
    completed: Mutex<Vec<Uuid>>,
    delay: Duration,
}

impl CountingNotifier {
    fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            completed: Mutex::new(Vec::new()),
            delay,
        })
    }

    fn completions(&self) -> Vec<Uuid> {
        self.completed.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobCompleteNotifier for CountingNotifier {
    async fn notify_job_completed(&self, job: &ExtractJobInfo) -> anyhow::Result<()> {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        self.completed.lock().unwrap().push(job.job_identifier);
        Ok(())
    }
}

fn options(poll_interval_ms: u64) -> JobWatcherOptions {
    JobWatcherOptions { poll_interval_ms }
}

#[tokio::test]
async fn ready_job_is_completed_and_notified_once() {
    let store = Arc::new(InMemoryJobStore::new());
    let job_id = Uuid::new_v4();
    make_ready(&store, job_id, 2).await;

    let notifier = CountingNotifier::new();
    let (hook, mut faults) = fatal_channel("job-watcher");
    let watcher = ExtractJobWatcher::new(
        Arc::clone(&store) as Arc<dyn ExtractJobStore>,
        Arc::clone(&notifier) as Arc<dyn JobCompleteNotifier>,
        options(60_000),
        hook,
    );

    let summary = watcher.process_jobs(None).await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 0);

    assert_eq!(
        store.get_job(job_id).await.unwrap().unwrap().status,
        ExtractJobStatus::Completed
    );
    assert_eq!(notifier.completions(), vec![job_id]);
    assert!(faults.try_recv().is_none());

    // Re-running is a no-op: completed jobs are never returned as ready
    let summary = watcher.process_jobs(None).await.unwrap();
    assert_eq!(summary, Default::default());
    assert_eq!(notifier.completions().len(), 1);
}

#[tokio::test]
async fn verification_failure_marks_the_job_failed_and_continues() {
    let store = Arc::new(InMemoryJobStore::new());

    // One genuinely complete job and one flipped ready despite a missing
    // file report
    let complete_id = Uuid::new_v4();
    make_ready(&store, complete_id, 1).await;

    let broken_id = Uuid::new_v4();
    store.record_extraction_request(&request(broken_id, 3)).await.unwrap();
    store.record_file_status(&file_status(broken_id, "only-one")).await.unwrap();
    store.force_status(broken_id, ExtractJobStatus::ReadyForChecks).unwrap();

    let notifier = CountingNotifier::new();
    let (hook, mut faults) = fatal_channel("job-watcher");
    let watcher = ExtractJobWatcher::new(
        Arc::clone(&store) as Arc<dyn ExtractJobStore>,
        Arc::clone(&notifier) as Arc<dyn JobCompleteNotifier>,
        options(60_000),
        hook,
    );

    let summary = watcher.process_jobs(None).await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 1);

    let broken = store.get_job(broken_id).await.unwrap().unwrap();
    assert_eq!(broken.status, ExtractJobStatus::Failed);
    assert!(broken.failure_cause.unwrap().contains("missing file reports"));

    // The notifier fired only for the completed job, and the watcher is
    // still healthy
    assert_eq!(notifier.completions(), vec![complete_id]);
    assert!(faults.try_recv().is_none());
    assert!(!watcher.is_halted());
}

#[tokio::test]
async fn periodic_tick_picks_up_jobs_that_become_ready() {
    let store = Arc::new(InMemoryJobStore::new());
    let notifier = CountingNotifier::new();
    let (hook, _faults) = fatal_channel("job-watcher");
    let watcher = ExtractJobWatcher::new(
        Arc::clone(&store) as Arc<dyn ExtractJobStore>,
        Arc::clone(&notifier) as Arc<dyn JobCompleteNotifier>,
        options(20),
        hook,
    );
    watcher.start().await.unwrap();

    let job_id = Uuid::new_v4();
    make_ready(&store, job_id, 1).await;

    timeout(Duration::from_secs(2), async {
        loop {
            let job = store.get_job(job_id).await.unwrap().unwrap();
            if job.status == ExtractJobStatus::Completed {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("tick should complete the job");
    assert_eq!(notifier.completions(), vec![job_id]);
    watcher.stop("test finished").await;
}

#[tokio::test]
async fn racing_passes_issue_at_most_one_transition_per_job() {
    let store = Arc::new(InMemoryJobStore::new());
    let job_id = Uuid::new_v4();
    make_ready(&store, job_id, 1).await;

    let notifier = CountingNotifier::new();
    let (hook, mut faults) = fatal_channel("job-watcher");
    let watcher = Arc::new(ExtractJobWatcher::new(
        Arc::clone(&store) as Arc<dyn ExtractJobStore>,
        Arc::clone(&notifier) as Arc<dyn JobCompleteNotifier>,
        options(1),
        hook,
    ));
    // The periodic tick races the explicit callers below
    watcher.start().await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let watcher = Arc::clone(&watcher);
        handles.push(tokio::spawn(async move {
            watcher.process_jobs(Some(job_id)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    watcher.stop("test finished").await;

    assert_eq!(notifier.completions(), vec![job_id]);
    assert_eq!(
        store.get_job(job_id).await.unwrap().unwrap().status,
        ExtractJobStatus::Completed
    );
    assert!(faults.try_recv().is_none());
}

#[tokio::test]
async fn stop_waits_for_the_inflight_pass() {
    let store = Arc::new(InMemoryJobStore::new());
    let job_id = Uuid::new_v4();
    make_ready(&store, job_id, 1).await;

    let notifier = CountingNotifier::with_delay(Duration::from_millis(200));
    let (hook, _faults) = fatal_channel("job-watcher");
    let watcher = Arc::new(ExtractJobWatcher::new(
        Arc::clone(&store) as Arc<dyn ExtractJobStore>,
        Arc::clone(&notifier) as Arc<dyn JobCompleteNotifier>,
        options(60_000),
        hook,
    ));

    // Kick off a slow pass, then stop while it is mid-notification
    let pass = {
        let watcher = Arc::clone(&watcher);
        tokio::spawn(async move { watcher.process_jobs(None).await })
    };
    sleep(Duration::from_millis(50)).await;
    watcher.stop("shutting down").await;

    // The pass had finished by the time stop returned
    assert_eq!(notifier.completions(), vec![job_id]);
    pass.await.unwrap().unwrap();
}

#[tokio::test]
async fn no_transition_happens_after_stop_returns() {
    let store = Arc::new(InMemoryJobStore::new());
    let notifier = CountingNotifier::new();
    let (hook, _faults) = fatal_channel("job-watcher");
    let watcher = ExtractJobWatcher::new(
        Arc::clone(&store) as Arc<dyn ExtractJobStore>,
        Arc::clone(&notifier) as Arc<dyn JobCompleteNotifier>,
        options(20),
        hook,
    );
    watcher.start().await.unwrap();
    watcher.stop("shutting down").await;

    // The tick is disarmed: a job made ready now stays ready
    let late_id = Uuid::new_v4();
    make_ready(&store, late_id, 1).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        store.get_job(late_id).await.unwrap().unwrap().status,
        ExtractJobStatus::ReadyForChecks
    );
    assert!(notifier.completions().is_empty());
}

/// Store whose ready query can be switched to fail.
struct FailingReadyStore {
    inner: InMemoryJobStore,
    fail: AtomicBool,
}

#[async_trait]
impl ExtractJobStore for FailingReadyStore {
    async fn record_extraction_request(
        &self,
        message: &ExtractionRequestInfoMessage,
    ) -> Result<()> {
        self.inner.record_extraction_request(message).await
    }

    async fn record_file_status(&self, message: &ExtractedFileStatusMessage) -> Result<()> {
        self.inner.record_file_status(message).await
    }

    async fn get_ready_jobs(&self, specific_job: Option<Uuid>) -> Result<Vec<ExtractJobInfo>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::CorruptRecord("simulated store corruption".into()));
        }
        self.inner.get_ready_jobs(specific_job).await
    }

    async fn mark_job_completed(&self, job_id: Uuid) -> Result<()> {
        self.inner.mark_job_completed(job_id).await
    }

    async fn mark_job_failed(&self, job_id: Uuid, cause: &str) -> Result<()> {
        self.inner.mark_job_failed(job_id, cause).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ExtractJobInfo>> {
        self.inner.get_job(job_id).await
    }
}

#[tokio::test]
async fn unexpected_store_fault_halts_the_watcher() {
    let store = Arc::new(FailingReadyStore {
        inner: InMemoryJobStore::new(),
        fail: AtomicBool::new(true),
    });
    let notifier = CountingNotifier::new();
    let (hook, mut faults) = fatal_channel("job-watcher");
    let watcher = ExtractJobWatcher::new(
        Arc::clone(&store) as Arc<dyn ExtractJobStore>,
        notifier as Arc<dyn JobCompleteNotifier>,
        options(60_000),
        hook,
    );

    let err = watcher.process_jobs(None).await.unwrap_err();
    assert!(matches!(err, Error::CorruptRecord(_)));
    assert!(watcher.is_halted());

    let fault = faults.recv().await.expect("fatal should fire");
    assert!(fault.message.contains("job watcher halted"));

    // Halted for good: even a now-healthy store is not consulted again,
    // and no second fatal fires
    store.fail.store(false, Ordering::SeqCst);
    let err = watcher.process_jobs(None).await.unwrap_err();
    assert!(matches!(err, Error::WatcherHalted));
    assert!(faults.try_recv().is_none());
}

#[tokio::test]
async fn start_fails_when_the_first_pass_faults() {
    let store = Arc::new(FailingReadyStore {
        inner: InMemoryJobStore::new(),
        fail: AtomicBool::new(true),
    });
    let notifier = CountingNotifier::new();
    let (hook, mut faults) = fatal_channel("job-watcher");
    let watcher = ExtractJobWatcher::new(
        store as Arc<dyn ExtractJobStore>,
        notifier as Arc<dyn JobCompleteNotifier>,
        options(10),
        hook,
    );

    assert!(watcher.start().await.is_err());
    assert!(watcher.is_halted());
    assert!(faults.recv().await.is_some());
}

/// Store whose terminal transitions always fail.
struct FailingMarkStore {
    inner: InMemoryJobStore,
}

#[async_trait]
impl ExtractJobStore for FailingMarkStore {
    async fn record_extraction_request(
        &self,
        message: &ExtractionRequestInfoMessage,
    ) -> Result<()> {
        self.inner.record_extraction_request(message).await
    }

    async fn record_file_status(&self, message: &ExtractedFileStatusMessage) -> Result<()> {
        self.inner.record_file_status(message).await
    }

    async fn get_ready_jobs(&self, specific_job: Option<Uuid>) -> Result<Vec<ExtractJobInfo>> {
        self.inner.get_ready_jobs(specific_job).await
    }

    async fn mark_job_completed(&self, _job_id: Uuid) -> Result<()> {
        Err(Error::CorruptRecord("simulated write failure".into()))
    }

    async fn mark_job_failed(&self, job_id: Uuid, cause: &str) -> Result<()> {
        self.inner.mark_job_failed(job_id, cause).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ExtractJobInfo>> {
        self.inner.get_job(job_id).await
    }
}

#[tokio::test]
async fn fault_mid_pass_leaves_remaining_jobs_untouched() {
    let store = Arc::new(FailingMarkStore {
        inner: InMemoryJobStore::new(),
    });
    let first = Uuid::new_v4();
    make_ready(&store.inner, first, 1).await;
    // Submitted later, so reconciled after `first`
    sleep(Duration::from_millis(5)).await;
    let second = Uuid::new_v4();
    make_ready(&store.inner, second, 1).await;

    let notifier = CountingNotifier::new();
    let (hook, mut faults) = fatal_channel("job-watcher");
    let watcher = ExtractJobWatcher::new(
        Arc::clone(&store) as Arc<dyn ExtractJobStore>,
        Arc::clone(&notifier) as Arc<dyn JobCompleteNotifier>,
        options(60_000),
        hook,
    );

    assert!(watcher.process_jobs(None).await.is_err());
    assert!(faults.recv().await.is_some());

    // The second job was never reached, and nobody was notified
    assert_eq!(
        store.inner.get_job(second).await.unwrap().unwrap().status,
        ExtractJobStatus::ReadyForChecks
    );
    assert!(notifier.completions().is_empty());
}
