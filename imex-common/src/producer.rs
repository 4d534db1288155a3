//! Producer with publisher confirms
//!
//! Publishing alone is fire-and-forget; the producer upgrades it to an
//! at-least-once handoff by tracking every publish in a pending-confirm set
//! and blocking in [`Producer::wait_for_confirms`] until the broker has
//! confirmed the lot. Batching several `send_message` calls before one
//! confirm wait amortizes the added latency (the batched-relay pattern in
//! [`crate::relay`]).
//!
//! A nacked or returned (unroutable) publish signals topology
//! misconfiguration, not a transient fault: it escalates through the fatal
//! error channel and is never silently dropped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{BrokerChannel, ConfirmEvent};
use crate::config::ProducerOptions;
use crate::error::{Error, Result};
use crate::fatal::FatalHook;
use crate::messages::{MessageHeader, ProducerIdentity, QueueMessage};

struct PendingPublish {
    message_guid: Uuid,
    routing_key: String,
}

struct ProducerInner {
    confirms: mpsc::UnboundedReceiver<ConfirmEvent>,
    pending: BTreeMap<u64, PendingPublish>,
}

/// Publishes messages to one exchange with confirm tracking.
///
/// Safe to share across tasks: access to the underlying channel is
/// serialized internally (a broker channel is not safe for uncoordinated
/// concurrent publishes).
pub struct Producer {
    options: ProducerOptions,
    identity: ProducerIdentity,
    channel: Arc<dyn BrokerChannel>,
    fatal: FatalHook,
    inner: Mutex<ProducerInner>,
}

impl Producer {
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        options: ProducerOptions,
        identity: ProducerIdentity,
        fatal: FatalHook,
    ) -> Result<Self> {
        options.verify_populated()?;
        let confirms = channel.confirm_listener();
        Ok(Self {
            options,
            identity,
            channel,
            fatal,
            inner: Mutex::new(ProducerInner {
                confirms,
                pending: BTreeMap::new(),
            }),
        })
    }

    /// Serialize and publish a message, returning its envelope.
    ///
    /// When `in_response_to` is given, the new envelope's parent chain is
    /// the prior chain with the prior message's id appended. The publish is
    /// registered in the pending-confirm set; the broker's confirmation is
    /// collected by a later [`Self::wait_for_confirms`].
    pub async fn send_message<M: QueueMessage>(
        &self,
        message: &M,
        in_response_to: Option<&MessageHeader>,
        routing_key: Option<&str>,
    ) -> Result<MessageHeader> {
        if self.fatal.is_raised() {
            return Err(Error::Faulted(self.fatal.component().to_string()));
        }

        let body = serde_json::to_vec(message)?;
        let header = match in_response_to {
            Some(parent) => MessageHeader::in_response_to(&self.identity, parent),
            None => MessageHeader::new(&self.identity),
        };
        let mut header_map = std::collections::HashMap::new();
        header.populate_header_map(&mut header_map);

        let routing_key = routing_key.unwrap_or(&self.options.routing_key);

        let mut inner = self.inner.lock().await;
        let mut attempt = 0u32;
        let publish_seq = loop {
            match self
                .channel
                .publish(
                    &self.options.exchange_name,
                    routing_key,
                    header_map.clone(),
                    body.clone(),
                )
                .await
            {
                Ok(seq) => break seq,
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.options.max_publish_attempts {
                        self.fatal.raise(
                            format!(
                                "publish failed after {attempt} attempts on exchange {}",
                                self.options.exchange_name
                            ),
                            Some(e.to_string()),
                        );
                        return Err(e);
                    }
                    warn!(attempt, error = %e, "publish failed, retrying");
                    tokio::time::sleep(Duration::from_millis(
                        self.options.publish_retry_delay_ms,
                    ))
                    .await;
                }
            }
        };

        inner.pending.insert(
            publish_seq,
            PendingPublish {
                message_guid: header.message_guid,
                routing_key: routing_key.to_string(),
            },
        );
        debug!(
            publish_seq,
            message_guid = %header.message_guid,
            routing_key,
            "message published"
        );
        Ok(header)
    }

    /// Block until every outstanding publish has been confirmed.
    ///
    /// A broker nack or an unroutable return escalates through the fatal
    /// channel and returns the underlying error; so does exhausting the
    /// configured confirm-wait attempts.
    pub async fn wait_for_confirms(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let ProducerInner { confirms, pending } = &mut *inner;

        let mut attempts = 0u32;
        loop {
            // Apply any events already buffered, including stale
            // nacks/returns from a previous batch.
            while let Ok(event) = confirms.try_recv() {
                self.apply_confirm(pending, event)?;
            }
            if pending.is_empty() {
                return Ok(());
            }

            let wait = Duration::from_millis(self.options.confirm_timeout_ms);
            match tokio::time::timeout(wait, confirms.recv()).await {
                Ok(Some(event)) => self.apply_confirm(pending, event)?,
                Ok(None) => {
                    self.fatal
                        .raise("confirm stream closed with publishes outstanding", None);
                    return Err(Error::Broker("confirm stream closed".into()));
                }
                Err(_) => {
                    attempts += 1;
                    warn!(
                        attempts,
                        outstanding = pending.len(),
                        "timed out waiting for publish confirms"
                    );
                    if attempts >= self.options.max_confirm_attempts {
                        self.fatal.raise(
                            format!("no publish confirms after {attempts} attempts"),
                            None,
                        );
                        return Err(Error::ConfirmTimeout { attempts });
                    }
                }
            }
        }
    }

    /// Number of publishes not yet confirmed.
    pub async fn pending_confirms(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    fn apply_confirm(
        &self,
        pending: &mut BTreeMap<u64, PendingPublish>,
        event: ConfirmEvent,
    ) -> Result<()> {
        match event {
            ConfirmEvent::Ack {
                publish_seq,
                multiple,
            } => {
                if multiple {
                    pending.retain(|&seq, _| seq > publish_seq);
                } else {
                    pending.remove(&publish_seq);
                }
                Ok(())
            }
            ConfirmEvent::Nack { publish_seq, .. } => {
                let guid = pending
                    .remove(&publish_seq)
                    .map(|p| p.message_guid.to_string())
                    .unwrap_or_else(|| "<unknown>".into());
                self.fatal.raise(
                    format!("broker nacked publish seq {publish_seq} (message {guid})"),
                    None,
                );
                Err(Error::PublishNacked { publish_seq })
            }
            ConfirmEvent::Return {
                routing_key,
                reason,
            } => {
                self.fatal.raise(
                    format!(
                        "message returned as unroutable on exchange {} (routing key {routing_key})",
                        self.options.exchange_name
                    ),
                    Some(reason),
                );
                Err(Error::Unroutable {
                    exchange: self.options.exchange_name.clone(),
                    routing_key,
                })
            }
        }
    }
}
