//! Cohort packager configuration

use std::path::PathBuf;

use serde::Deserialize;

use imex_common::config::ConsumerOptions;

use crate::jobs::JobWatcherOptions;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CohortPackagerOptions {
    /// SQLite database file backing the job store
    pub database_path: PathBuf,
    /// Consumer of extraction request announcements
    pub request_info_consumer: ConsumerOptions,
    /// Consumer of per-file status reports
    pub file_status_consumer: ConsumerOptions,
    pub job_watcher: JobWatcherOptions,
    /// Port the health endpoint listens on
    pub health_port: u16,
}

impl Default for CohortPackagerOptions {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("imex-cp.db"),
            request_info_consumer: ConsumerOptions {
                queue_name: "ExtractRequestInfoQueue".into(),
                prefetch_count: 1,
                requeue_on_fatal: true,
            },
            file_status_consumer: ConsumerOptions {
                queue_name: "ExtractedFileStatusQueue".into(),
                prefetch_count: 16,
                requeue_on_fatal: true,
            },
            job_watcher: JobWatcherOptions::default(),
            health_port: 5741,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_toml_keeps_compiled_defaults() {
        let options: CohortPackagerOptions = toml::from_str(
            r#"
            database_path = "/var/lib/imex/jobs.db"

            [job_watcher]
            poll_interval_ms = 5000
            "#,
        )
        .unwrap();

        assert_eq!(options.database_path, PathBuf::from("/var/lib/imex/jobs.db"));
        assert_eq!(options.job_watcher.poll_interval_ms, 5000);
        assert_eq!(options.request_info_consumer.queue_name, "ExtractRequestInfoQueue");
        assert_eq!(options.file_status_consumer.prefetch_count, 16);
        assert_eq!(options.health_port, 5741);
    }
}
