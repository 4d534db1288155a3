//! Identifier mapper stage
//!
//! Rewrites the configured identifier tag in each image file message and
//! hands the result to the batched relay. The ack for the consumed
//! delivery is deferred: the relay issues it only after the batch carrying
//! the mapped message is confirmed, so a crash mid-batch redelivers rather
//! than loses.
//!
//! Malformed tag data and unmappable identifiers are declared rejections:
//! the message is nacked without requeue and the stage keeps consuming. A
//! swapper backend failure is an unexpected fault and stops the stage.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use imex_common::consumer::{Acker, MessageProcessor, ProcessingError};
use imex_common::messages::{ImageFileMessage, MessageHeader};
use imex_common::relay::BatchRelay;

use crate::config::SwapperOptions;
use crate::swapper::IdentifierSwapper;

pub struct IdentifierMapperConsumer {
    swapper: Arc<dyn IdentifierSwapper>,
    relay: Arc<BatchRelay<ImageFileMessage>>,
    options: SwapperOptions,
}

impl IdentifierMapperConsumer {
    pub fn new(
        swapper: Arc<dyn IdentifierSwapper>,
        relay: Arc<BatchRelay<ImageFileMessage>>,
        options: SwapperOptions,
    ) -> Self {
        Self {
            swapper,
            relay,
            options,
        }
    }
}

#[async_trait]
impl MessageProcessor for IdentifierMapperConsumer {
    type Message = ImageFileMessage;

    async fn process_message(
        &self,
        header: &MessageHeader,
        mut message: ImageFileMessage,
        acker: Acker,
    ) -> std::result::Result<(), ProcessingError> {
        let mut tags: Value = serde_json::from_str(&message.tag_data)
            .map_err(|e| ProcessingError::rejected(format!("malformed tag data: {e}")))?;
        let Some(dataset) = tags.as_object_mut() else {
            return Err(ProcessingError::rejected("tag data is not a JSON object"));
        };

        let tag = &self.options.identifier_tag;
        let identifier = match dataset.get(tag) {
            Some(Value::String(value)) if !value.trim().is_empty() => value.clone(),
            _ => {
                return Err(ProcessingError::rejected(format!(
                    "missing or blank {tag} tag"
                )))
            }
        };

        let substitution = self
            .swapper
            .substitute(&identifier)
            .await
            .map_err(|e| ProcessingError::Fatal(e.into()))?;
        let Some(pseudonym) = substitution else {
            return Err(ProcessingError::rejected(format!(
                "no substitution for {tag} value"
            )));
        };

        dataset.insert(tag.clone(), Value::String(pseudonym));
        message.tag_data =
            serde_json::to_string(&tags).map_err(imex_common::Error::from)?;

        debug!(
            job = %message.extract.extraction_job_identifier,
            file = %message.source_file_path,
            "identifier substituted, relaying downstream"
        );
        self.relay.relay(message, header.clone(), acker).await?;
        Ok(())
    }
}
