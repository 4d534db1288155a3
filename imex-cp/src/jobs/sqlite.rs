//! SQLite job store
//!
//! Durable [`ExtractJobStore`] implementation. Schema creation is
//! idempotent at startup; both recording operations run in a transaction so
//! the `InProgress → ReadyForChecks` flip is atomic with the write that
//! triggered it, and the watcher's terminal transitions are conditional
//! single-statement updates, atomic with respect to concurrent readers even
//! when several worker instances share the database file.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use imex_common::messages::{ExtractedFileStatusMessage, ExtractionRequestInfoMessage};

use crate::error::{Error, Result};
use crate::jobs::store::{ExtractJobInfo, ExtractJobStatus, ExtractJobStore};

const READY_FLIP_SQL: &str = r#"
    UPDATE extraction_jobs
    SET status = 'ReadyForChecks', updated_at = ?2
    WHERE job_identifier = ?1
      AND status = 'InProgress'
      AND expected_file_count IS NOT NULL
      AND (SELECT COUNT(*) FROM extraction_job_files f
           WHERE f.job_identifier = ?1) >= expected_file_count
"#;

const JOB_SNAPSHOT_SQL: &str = r#"
    SELECT j.job_identifier, j.project_number, j.extraction_directory,
           j.job_submitted_at, j.status, j.expected_file_count, j.failure_cause,
           (SELECT COUNT(*) FROM extraction_job_files f
            WHERE f.job_identifier = j.job_identifier) AS reported_file_count
    FROM extraction_jobs j
"#;

/// Job store backed by a SQLite database file.
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (creating if needed) the database at `db_path` and ensure the
    /// schema exists.
    pub async fn open(db_path: &Path) -> Result<Self> {
        let newly_created = !db_path.exists();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        if newly_created {
            info!("Initialized new job store: {}", db_path.display());
        } else {
            info!("Opened existing job store: {}", db_path.display());
        }

        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
        // WAL keeps readers (the watcher) unblocked by recording writes
        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

        create_jobs_table(&pool).await?;
        create_job_files_table(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying pool, for diagnostics and tests.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn terminal_transition(
        &self,
        job_id: Uuid,
        operation: &'static str,
        update_sql: &str,
        cause: Option<&str>,
    ) -> Result<()> {
        let mut query = sqlx::query(update_sql).bind(job_id.to_string());
        if let Some(cause) = cause {
            query = query.bind(cause);
        }
        let affected = query
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 1 {
            return Ok(());
        }

        // Distinguish a missing job from a disallowed transition
        let exists: Option<String> =
            sqlx::query_scalar("SELECT status FROM extraction_jobs WHERE job_identifier = ?1")
                .bind(job_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        match exists {
            None => Err(Error::JobNotFound(job_id)),
            Some(_) => Err(Error::InvalidJobTransition { job: job_id, operation }),
        }
    }
}

#[async_trait]
impl ExtractJobStore for SqliteJobStore {
    async fn record_extraction_request(
        &self,
        message: &ExtractionRequestInfoMessage,
    ) -> Result<()> {
        let job_id = message.extract.extraction_job_identifier.to_string();
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        // Open the job record, or complete a placeholder opened by an early
        // file status. The WHERE guard makes a redelivered announcement for
        // a job already past InProgress a no-op.
        sqlx::query(
            r#"
            INSERT INTO extraction_jobs
                (job_identifier, project_number, extraction_directory,
                 job_submitted_at, status, expected_file_count, updated_at)
            VALUES (?1, ?2, ?3, ?4, 'InProgress', ?5, ?6)
            ON CONFLICT(job_identifier) DO UPDATE SET
                project_number = excluded.project_number,
                extraction_directory = excluded.extraction_directory,
                job_submitted_at = excluded.job_submitted_at,
                expected_file_count = excluded.expected_file_count,
                updated_at = excluded.updated_at
            WHERE extraction_jobs.status = 'InProgress'
            "#,
        )
        .bind(&job_id)
        .bind(&message.extract.project_number)
        .bind(&message.extract.extraction_directory)
        .bind(message.extract.job_submitted_at.to_rfc3339())
        .bind(i64::from(message.key_value_count))
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        // Every expected file may already have reported
        sqlx::query(READY_FLIP_SQL)
            .bind(&job_id)
            .bind(&now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn record_file_status(&self, message: &ExtractedFileStatusMessage) -> Result<()> {
        let job_id = message.extract.extraction_job_identifier.to_string();
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO extraction_jobs
                (job_identifier, project_number, extraction_directory,
                 job_submitted_at, status, updated_at)
            VALUES (?1, ?2, ?3, ?4, 'InProgress', ?5)
            ON CONFLICT(job_identifier) DO NOTHING
            "#,
        )
        .bind(&job_id)
        .bind(&message.extract.project_number)
        .bind(&message.extract.extraction_directory)
        .bind(message.extract.job_submitted_at.to_rfc3339())
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM extraction_jobs WHERE job_identifier = ?1")
                .bind(&job_id)
                .fetch_optional(&mut *tx)
                .await?;
        if matches!(status.as_deref(), Some("Completed") | Some("Failed")) {
            warn!(job = %job_id, file = %message.source_file_path,
                "ignoring file status for a job already finalized");
            tx.commit().await?;
            return Ok(());
        }

        // Keyed on (job, path): a redelivered report replaces, not doubles
        sqlx::query(
            r#"
            INSERT INTO extraction_job_files
                (job_identifier, source_file_path, status,
                 output_file_path, status_message, reported_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(job_identifier, source_file_path) DO UPDATE SET
                status = excluded.status,
                output_file_path = excluded.output_file_path,
                status_message = excluded.status_message,
                reported_at = excluded.reported_at
            "#,
        )
        .bind(&job_id)
        .bind(&message.source_file_path)
        .bind(message.status.to_string())
        .bind(&message.output_file_path)
        .bind(&message.status_message)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(READY_FLIP_SQL)
            .bind(&job_id)
            .bind(&now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_ready_jobs(&self, specific_job: Option<Uuid>) -> Result<Vec<ExtractJobInfo>> {
        let sql = format!(
            "{JOB_SNAPSHOT_SQL} WHERE j.status = 'ReadyForChecks'{} ORDER BY j.job_submitted_at",
            if specific_job.is_some() {
                " AND j.job_identifier = ?1"
            } else {
                ""
            }
        );
        let mut query = sqlx::query(&sql);
        if let Some(job_id) = specific_job {
            query = query.bind(job_id.to_string());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn mark_job_completed(&self, job_id: Uuid) -> Result<()> {
        self.terminal_transition(
            job_id,
            "completed",
            r#"
            UPDATE extraction_jobs SET status = 'Completed', updated_at = ?2
            WHERE job_identifier = ?1 AND status = 'ReadyForChecks'
            "#,
            None,
        )
        .await
    }

    async fn mark_job_failed(&self, job_id: Uuid, cause: &str) -> Result<()> {
        self.terminal_transition(
            job_id,
            "failed",
            r#"
            UPDATE extraction_jobs
            SET status = 'Failed', failure_cause = ?2, updated_at = ?3
            WHERE job_identifier = ?1 AND status = 'ReadyForChecks'
            "#,
            Some(cause),
        )
        .await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ExtractJobInfo>> {
        let sql = format!("{JOB_SNAPSHOT_SQL} WHERE j.job_identifier = ?1");
        let row = sqlx::query(&sql)
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }
}

async fn create_jobs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS extraction_jobs (
            job_identifier TEXT PRIMARY KEY,
            project_number TEXT NOT NULL DEFAULT '',
            extraction_directory TEXT NOT NULL DEFAULT '',
            job_submitted_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'InProgress',
            expected_file_count INTEGER,
            failure_cause TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_job_files_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS extraction_job_files (
            job_identifier TEXT NOT NULL,
            source_file_path TEXT NOT NULL,
            status TEXT NOT NULL,
            output_file_path TEXT,
            status_message TEXT,
            reported_at TEXT NOT NULL,
            PRIMARY KEY (job_identifier, source_file_path)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

fn job_from_row(row: &SqliteRow) -> Result<ExtractJobInfo> {
    let job_identifier: String = row.try_get("job_identifier")?;
    let job_identifier = Uuid::parse_str(&job_identifier)
        .map_err(|e| Error::CorruptRecord(format!("job_identifier {job_identifier:?}: {e}")))?;

    let job_submitted_at: String = row.try_get("job_submitted_at")?;
    let job_submitted_at = DateTime::parse_from_rfc3339(&job_submitted_at)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::CorruptRecord(format!("job_submitted_at {job_submitted_at:?}: {e}")))?;

    let status: String = row.try_get("status")?;
    let status = ExtractJobStatus::parse(&status)?;

    let expected_file_count: Option<i64> = row.try_get("expected_file_count")?;
    let expected_file_count = expected_file_count
        .map(|count| {
            u32::try_from(count)
                .map_err(|_| Error::CorruptRecord(format!("expected_file_count {count}")))
        })
        .transpose()?;

    let reported_file_count: i64 = row.try_get("reported_file_count")?;

    Ok(ExtractJobInfo {
        job_identifier,
        project_number: row.try_get("project_number")?,
        extraction_directory: row.try_get("extraction_directory")?,
        job_submitted_at,
        status,
        expected_file_count,
        reported_file_count: reported_file_count as u32,
        failure_cause: row.try_get("failure_cause")?,
    })
}
