//! Job completion watcher
//!
//! A timer-driven reconciliation loop: periodically asks the job store for
//! jobs in `ReadyForChecks`, verifies each is truly complete, and drives
//! the terminal transition plus completion notification.
//!
//! At most one reconciliation pass executes at a time. The periodic tick
//! and any explicit [`ExtractJobWatcher::process_jobs`] caller serialize on
//! one async mutex, so the single-flight invariant holds regardless of the
//! scheduler's timer semantics. An unexpected fault (a store error, as
//! opposed to a job failing its verification) halts the watcher permanently
//! and escalates through the fatal channel: it may indicate a corrupted
//! reconciliation invariant that would otherwise repeat for every job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use imex_common::FatalHook;

use crate::error::{Error, Result};
use crate::jobs::notifier::JobCompleteNotifier;
use crate::jobs::store::{ExtractJobInfo, ExtractJobStatus, ExtractJobStore};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobWatcherOptions {
    /// Interval between reconciliation passes
    pub poll_interval_ms: u64,
}

impl Default for JobWatcherOptions {
    fn default() -> Self {
        Self {
            poll_interval_ms: 30_000,
        }
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    /// Jobs transitioned to `Completed`
    pub completed: usize,
    /// Jobs transitioned to `Failed`
    pub failed: usize,
    /// Jobs skipped because they were no longer `ReadyForChecks`
    pub skipped: usize,
}

/// Reconciles ready jobs to their terminal state on a periodic tick.
pub struct ExtractJobWatcher {
    inner: Arc<WatcherInner>,
    tick: std::sync::Mutex<Option<TickTask>>,
}

struct TickTask {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct WatcherInner {
    store: Arc<dyn ExtractJobStore>,
    notifier: Arc<dyn JobCompleteNotifier>,
    options: JobWatcherOptions,
    fatal: FatalHook,
    /// Single-flight reconciliation lock
    reconcile: tokio::sync::Mutex<()>,
    halted: AtomicBool,
}

impl ExtractJobWatcher {
    pub fn new(
        store: Arc<dyn ExtractJobStore>,
        notifier: Arc<dyn JobCompleteNotifier>,
        options: JobWatcherOptions,
        fatal: FatalHook,
    ) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                store,
                notifier,
                options,
                fatal,
                reconcile: tokio::sync::Mutex::new(()),
                halted: AtomicBool::new(false),
            }),
            tick: std::sync::Mutex::new(None),
        }
    }

    /// Run one reconciliation pass immediately, then arm the periodic tick.
    ///
    /// An unexpected fault during the first pass halts the watcher and
    /// returns the error without arming the tick.
    pub async fn start(&self) -> Result<PassSummary> {
        let first = self.inner.process_jobs(None).await?;

        let inner = Arc::clone(&self.inner);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let period = Duration::from_millis(self.inner.options.poll_interval_ms.max(1));
        let task = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        // A fault halts the loop permanently
                        if inner.process_jobs(None).await.is_err() {
                            break;
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("job watcher tick loop stopped");
        });

        *self.tick.lock().unwrap() = Some(TickTask {
            shutdown: shutdown_tx,
            task,
        });
        Ok(first)
    }

    /// Run one reconciliation pass on demand, optionally restricted to one
    /// job. Serializes with the periodic tick: for any job id, at most one
    /// terminal transition is ever issued.
    pub async fn process_jobs(&self, specific_job: Option<Uuid>) -> Result<PassSummary> {
        self.inner.process_jobs(specific_job).await
    }

    /// Whether the watcher has halted after an unexpected fault.
    pub fn is_halted(&self) -> bool {
        self.inner.halted.load(Ordering::SeqCst)
    }

    /// Disarm the tick and wait for any in-flight pass to finish.
    ///
    /// After `stop` returns, no further job transition is issued by this
    /// watcher.
    pub async fn stop(&self, reason: &str) {
        info!(reason, "stopping job watcher");
        let tick = self.tick.lock().unwrap().take();
        if let Some(tick) = tick {
            let _ = tick.shutdown.send(true);
            let _ = tick.task.await;
        }
        // An explicit process_jobs caller may still be mid-pass: taking
        // the reconciliation lock guarantees it has finished.
        drop(self.inner.reconcile.lock().await);
    }
}

impl WatcherInner {
    async fn process_jobs(&self, specific_job: Option<Uuid>) -> Result<PassSummary> {
        if self.halted.load(Ordering::SeqCst) {
            return Err(Error::WatcherHalted);
        }
        let _guard = self.reconcile.lock().await;
        // The pass holding the lock before us may have halted the watcher
        if self.halted.load(Ordering::SeqCst) {
            return Err(Error::WatcherHalted);
        }

        let jobs = match self.store.get_ready_jobs(specific_job).await {
            Ok(jobs) => jobs,
            Err(e) => return Err(self.halt("fetching ready jobs failed", e)),
        };

        let mut summary = PassSummary::default();
        for job in jobs {
            // Defensive re-check: a job could race to another state between
            // fetch and process
            if job.status != ExtractJobStatus::ReadyForChecks {
                warn!(job = %job.job_identifier, status = %job.status,
                    "skipping job no longer ready for checks");
                summary.skipped += 1;
                continue;
            }

            match verify_completion(&job) {
                Ok(()) => {
                    if let Err(e) = self.store.mark_job_completed(job.job_identifier).await {
                        return Err(self.halt("marking job completed failed", e));
                    }
                    info!(job = %job.job_identifier, "extraction job completed");
                    // Notification is decoupled from the state transition:
                    // a notifier failure never un-completes the job
                    if let Err(e) = self.notifier.notify_job_completed(&job).await {
                        warn!(job = %job.job_identifier, error = %e,
                            "completion notification failed");
                    }
                    summary.completed += 1;
                }
                Err(cause) => {
                    warn!(job = %job.job_identifier, cause,
                        "extraction job failed verification");
                    if let Err(e) = self.store.mark_job_failed(job.job_identifier, &cause).await
                    {
                        return Err(self.halt("marking job failed failed", e));
                    }
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    fn halt(&self, context: &str, error: Error) -> Error {
        self.halted.store(true, Ordering::SeqCst);
        self.fatal.raise(
            format!("job watcher halted: {context}"),
            Some(error.to_string()),
        );
        error
    }
}

/// Decide whether a ready job is truly complete.
///
/// Re-checks the report counts on the snapshot, defending against a store
/// that flipped a job to `ReadyForChecks` erroneously. `Err` carries the
/// cause recorded on the failed job; this is a declared verification
/// failure, recoverable at the watcher level.
fn verify_completion(job: &ExtractJobInfo) -> std::result::Result<(), String> {
    let Some(expected) = job.expected_file_count else {
        return Err("expected file count was never recorded".into());
    };
    if job.reported_file_count < expected {
        return Err(format!(
            "missing file reports: expected {expected}, reported {}",
            job.reported_file_count
        ));
    }
    Ok(())
}
