//! Consumer delivery lifecycle
//!
//! Drives each delivery through decode → process → ack/nack. Decode
//! failures are poison messages: a payload that cannot be parsed will never
//! succeed on retry, so it is rejected without requeue and without fatal
//! escalation. Errors from the stage-specific processor are split by the
//! processor itself: a declared [`ProcessingError::Rejected`] nacks and
//! moves on, while [`ProcessingError::Fatal`] stops the consumer: stage
//! semantics are stage-specific, and a generic retry could repeat partial
//! side effects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broker::{BrokerChannel, Delivery};
use crate::config::ConsumerOptions;
use crate::error::{Error, Result};
use crate::fatal::FatalHook;
use crate::messages::{MessageHeader, QueueMessage};

/// How a stage processor failed to handle a message.
#[derive(Debug)]
pub enum ProcessingError {
    /// Declared business rejection: the delivery is nacked without requeue,
    /// logged, and the consumer keeps going.
    Rejected { reason: String },
    /// Unexpected stage fault: the delivery is nacked (requeue per the
    /// consumer's configured policy), the fatal channel fires, and the
    /// consumer stops.
    Fatal(anyhow::Error),
}

impl ProcessingError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

impl From<anyhow::Error> for ProcessingError {
    fn from(e: anyhow::Error) -> Self {
        Self::Fatal(e)
    }
}

impl From<Error> for ProcessingError {
    fn from(e: Error) -> Self {
        Self::Fatal(e.into())
    }
}

/// Stage-specific message handling plugged into a [`QueueConsumer`].
#[async_trait]
pub trait MessageProcessor: Send + Sync + 'static {
    type Message: QueueMessage;

    /// Handle one decoded message.
    ///
    /// The processor owns the positive path: call [`Acker::ack`] once the
    /// message's effects are durable (immediately, or deferred as the
    /// batched relay does). On `Err`, the consumer issues the nack.
    async fn process_message(
        &self,
        header: &MessageHeader,
        message: Self::Message,
        acker: Acker,
    ) -> std::result::Result<(), ProcessingError>;
}

/// Handle for acknowledging exactly one delivery.
///
/// Clones share a finalization latch: across all clones, only one
/// `ack`/`nack` reaches the broker; a second attempt returns
/// [`Error::DeliveryAlreadyFinalized`] without touching the channel.
#[derive(Clone)]
pub struct Acker {
    channel: Arc<dyn BrokerChannel>,
    delivery_tag: u64,
    finalized: Arc<AtomicBool>,
}

impl Acker {
    pub fn new(channel: Arc<dyn BrokerChannel>, delivery_tag: u64) -> Self {
        Self {
            channel,
            delivery_tag,
            finalized: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.finalize()?;
        self.channel.ack(self.delivery_tag).await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.finalize()?;
        self.channel.nack(self.delivery_tag, requeue).await
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    fn finalize(&self) -> Result<()> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return Err(Error::DeliveryAlreadyFinalized {
                delivery_tag: self.delivery_tag,
            });
        }
        Ok(())
    }
}

/// Consumes one queue, driving deliveries through a [`MessageProcessor`].
pub struct QueueConsumer<P: MessageProcessor> {
    options: ConsumerOptions,
    channel: Arc<dyn BrokerChannel>,
    processor: Arc<P>,
    fatal: FatalHook,
}

impl<P: MessageProcessor> QueueConsumer<P> {
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        options: ConsumerOptions,
        processor: Arc<P>,
        fatal: FatalHook,
    ) -> Result<Self> {
        options.verify_populated()?;
        Ok(Self {
            options,
            channel,
            processor,
            fatal,
        })
    }

    /// Begin consuming. The returned handle stops the loop cooperatively.
    pub async fn start(self) -> Result<ConsumerHandle> {
        let deliveries = self
            .channel
            .consume(&self.options.queue_name, self.options.prefetch_count)
            .await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(deliveries, shutdown_rx));
        Ok(ConsumerHandle {
            shutdown: shutdown_tx,
            task,
        })
    }

    async fn run(self, mut deliveries: mpsc::Receiver<Delivery>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let delivery = tokio::select! {
                delivery = deliveries.recv() => match delivery {
                    Some(d) => d,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            // A fatally-faulted consumer must not process further deliveries
            if self.fatal.is_raised() {
                break;
            }
            if !self.handle_delivery(delivery).await {
                break;
            }
        }
        debug!(queue = %self.options.queue_name, "consumer loop stopped");
    }

    /// Returns false when the consumer must stop.
    async fn handle_delivery(&self, delivery: Delivery) -> bool {
        let acker = Acker::new(Arc::clone(&self.channel), delivery.delivery_tag);

        let header = match MessageHeader::from_header_map(&delivery.headers) {
            Ok(header) => header,
            Err(e) => {
                warn!(
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "rejecting delivery with undecodable envelope"
                );
                self.reject_poison(&acker).await;
                return true;
            }
        };

        let message: P::Message = match serde_json::from_slice(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    message_guid = %header.message_guid,
                    error = %e,
                    "rejecting undecodable message body"
                );
                self.reject_poison(&acker).await;
                return true;
            }
        };

        match self
            .processor
            .process_message(&header, message, acker.clone())
            .await
        {
            Ok(()) => true,
            Err(ProcessingError::Rejected { reason }) => {
                warn!(
                    message_guid = %header.message_guid,
                    reason,
                    "message rejected by processor"
                );
                if !acker.is_finalized() {
                    if let Err(e) = acker.nack(false).await {
                        warn!(error = %e, "failed to nack rejected delivery");
                    }
                }
                true
            }
            Err(ProcessingError::Fatal(e)) => {
                if !acker.is_finalized() {
                    if let Err(nack_err) = acker.nack(self.options.requeue_on_fatal).await {
                        warn!(error = %nack_err, "failed to nack delivery during fatal stop");
                    }
                }
                self.fatal.raise(
                    format!(
                        "unhandled error processing message {} from queue {}",
                        header.message_guid, self.options.queue_name
                    ),
                    Some(format!("{e:#}")),
                );
                false
            }
        }
    }

    async fn reject_poison(&self, acker: &Acker) {
        // Poison policy: no requeue (it will never parse), no fatal
        if let Err(e) = acker.nack(false).await {
            warn!(error = %e, "failed to nack poison delivery");
        }
    }
}

/// Handle to a running consumer loop.
pub struct ConsumerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Request the loop to stop and wait for it to finish. The delivery in
    /// progress, if any, completes first.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }

    /// Whether the loop has already exited (e.g. after a fatal fault).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
