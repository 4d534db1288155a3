//! Messages exchanged by the extraction pipeline stages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::QueueMessage;

/// Fields common to every message belonging to an extraction job.
///
/// Flattened into each concrete message so the job identifier travels with
/// every payload from request submission through to per-file status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractMessage {
    /// Unique identifier correlating all messages of one extraction request
    pub extraction_job_identifier: Uuid,
    /// Project reference the extraction belongs to
    pub project_number: String,
    /// Directory (relative to the extraction root) output files land in
    pub extraction_directory: String,
    /// When the job was submitted
    pub job_submitted_at: DateTime<Utc>,
    /// True when files are extracted without anonymisation
    #[serde(default)]
    pub is_identifiable_extraction: bool,
    /// True when file rejection filters are skipped
    #[serde(default)]
    pub is_no_filter_extraction: bool,
}

/// Announces a new extraction request and how many files it covers.
///
/// Consumed by the cohort packager to open a job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRequestInfoMessage {
    #[serde(flatten)]
    pub extract: ExtractMessage,
    /// Tag the cohort was keyed on (e.g. a study or series identifier)
    pub key_tag: String,
    /// Number of key values (and therefore expected file reports)
    pub key_value_count: u32,
    /// Imaging modality restriction, if any
    #[serde(default)]
    pub extraction_modality: Option<String>,
}

/// One image file travelling between pipeline stages, with its tag data
/// serialized as a JSON text block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageFileMessage {
    #[serde(flatten)]
    pub extract: ExtractMessage,
    /// Path of the source image, relative to the archive root
    pub source_file_path: String,
    /// Tag dataset as JSON text; opaque to the substrate
    pub tag_data: String,
}

/// Terminal status of one file within an extraction job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractedFileStatus {
    /// The file was processed and written to the extraction directory
    Success,
    /// The file was rejected by a declared business rule
    Rejected,
    /// Processing failed; the file will not be retried
    Error,
}

impl std::fmt::Display for ExtractedFileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExtractedFileStatus::Success => "Success",
            ExtractedFileStatus::Rejected => "Rejected",
            ExtractedFileStatus::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Reports the terminal per-file status to the cohort packager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFileStatusMessage {
    #[serde(flatten)]
    pub extract: ExtractMessage,
    /// Path of the source image this status refers to
    pub source_file_path: String,
    pub status: ExtractedFileStatus,
    /// Where the output file was written, when one was produced
    #[serde(default)]
    pub output_file_path: Option<String>,
    /// Detail for rejected or failed files
    #[serde(default)]
    pub status_message: Option<String>,
}

impl QueueMessage for ExtractionRequestInfoMessage {}
impl QueueMessage for ImageFileMessage {}
impl QueueMessage for ExtractedFileStatusMessage {}
