//! Queue consumers feeding the job store
//!
//! Both consumers ack only after the store write has committed, so a crash
//! between receipt and commit redelivers rather than loses. A store error
//! is an unexpected stage fault: the consumer stops and escalates rather
//! than retrying, leaving recovery to the supervisor.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use imex_common::consumer::{Acker, MessageProcessor, ProcessingError};
use imex_common::messages::{
    ExtractedFileStatusMessage, ExtractionRequestInfoMessage, MessageHeader,
};

use crate::jobs::ExtractJobStore;

/// Opens a job record for each announced extraction request.
pub struct RequestInfoConsumer {
    store: Arc<dyn ExtractJobStore>,
}

impl RequestInfoConsumer {
    pub fn new(store: Arc<dyn ExtractJobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MessageProcessor for RequestInfoConsumer {
    type Message = ExtractionRequestInfoMessage;

    async fn process_message(
        &self,
        _header: &MessageHeader,
        message: ExtractionRequestInfoMessage,
        acker: Acker,
    ) -> std::result::Result<(), ProcessingError> {
        debug!(
            job = %message.extract.extraction_job_identifier,
            expected_files = message.key_value_count,
            "recording extraction request"
        );
        self.store
            .record_extraction_request(&message)
            .await
            .map_err(|e| ProcessingError::Fatal(e.into()))?;
        acker.ack().await?;
        Ok(())
    }
}

/// Records each file's terminal status against its job.
pub struct FileStatusConsumer {
    store: Arc<dyn ExtractJobStore>,
}

impl FileStatusConsumer {
    pub fn new(store: Arc<dyn ExtractJobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MessageProcessor for FileStatusConsumer {
    type Message = ExtractedFileStatusMessage;

    async fn process_message(
        &self,
        _header: &MessageHeader,
        message: ExtractedFileStatusMessage,
        acker: Acker,
    ) -> std::result::Result<(), ProcessingError> {
        debug!(
            job = %message.extract.extraction_job_identifier,
            file = %message.source_file_path,
            status = %message.status,
            "recording file status"
        );
        self.store
            .record_file_status(&message)
            .await
            .map_err(|e| ProcessingError::Fatal(e.into()))?;
        acker.ack().await?;
        Ok(())
    }
}
