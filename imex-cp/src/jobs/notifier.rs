//! Completion notification
//!
//! Invoked by the watcher once a job is confirmed complete. Notification is
//! fire-and-observe: it happens after the terminal transition, and a failed
//! notification never un-completes the job.

use async_trait::async_trait;
use tracing::info;

use crate::jobs::store::ExtractJobInfo;

/// Receives completion notifications from the job watcher.
#[async_trait]
pub trait JobCompleteNotifier: Send + Sync + 'static {
    async fn notify_job_completed(&self, job: &ExtractJobInfo) -> anyhow::Result<()>;
}

/// Notifier that records completion in the worker log. Deployments hook a
/// reporting pipeline in behind the same trait.
pub struct LoggingNotifier;

#[async_trait]
impl JobCompleteNotifier for LoggingNotifier {
    async fn notify_job_completed(&self, job: &ExtractJobInfo) -> anyhow::Result<()> {
        info!(
            job = %job.job_identifier,
            project = %job.project_number,
            files = job.reported_file_count,
            "extraction job complete"
        );
        Ok(())
    }
}
