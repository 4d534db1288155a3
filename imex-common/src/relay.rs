//! Batched publish-then-confirm relay
//!
//! Stages that republish every message they consume pay one confirm
//! round-trip per message unless publishes are batched. The relay queues
//! outbound messages together with the acker of the delivery that produced
//! them, then drains the queue under an exclusive drain lock: publish up to
//! `max_batch` messages, wait for their confirms once, and only then ack
//! the consumed deliveries. Acks after confirms preserves at-least-once:
//! a crash between publish and ack redelivers rather than loses.
//!
//! Liveness does not depend on lock contention: the drainer loops until the
//! queue is empty and, after releasing the lock, re-checks for items that
//! raced in during its final empty check; a periodic flush task bounds how
//! long a quiet queue can sit undrained.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::consumer::Acker;
use crate::error::Result;
use crate::messages::{MessageHeader, QueueMessage};
use crate::producer::Producer;

/// Tuning for one [`BatchRelay`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayOptions {
    /// Maximum messages published per confirm round-trip
    pub max_batch: usize,
    /// Upper bound on how long an enqueued message waits for a drain
    pub max_flush_interval_ms: u64,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            max_batch: 64,
            max_flush_interval_ms: 1000,
        }
    }
}

struct PendingItem<M> {
    message: M,
    in_response_to: MessageHeader,
    acker: Acker,
}

/// Batches outbound publishes and defers consumer acks until the batch is
/// confirmed.
pub struct BatchRelay<M: QueueMessage> {
    producer: Arc<Producer>,
    options: RelayOptions,
    pending: Mutex<VecDeque<PendingItem<M>>>,
    drain_lock: tokio::sync::Mutex<()>,
}

impl<M: QueueMessage> BatchRelay<M> {
    pub fn new(producer: Arc<Producer>, options: RelayOptions) -> Self {
        Self {
            producer,
            options,
            pending: Mutex::new(VecDeque::new()),
            drain_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Queue one outbound message. The acker belongs to the consumed
    /// delivery that produced it and is only acked after the batch
    /// containing this message is confirmed.
    pub fn enqueue(&self, message: M, in_response_to: MessageHeader, acker: Acker) {
        self.pending.lock().unwrap().push_back(PendingItem {
            message,
            in_response_to,
            acker,
        });
    }

    /// Queue one message and drive a drain.
    pub async fn relay(&self, message: M, in_response_to: MessageHeader, acker: Acker) -> Result<()> {
        self.enqueue(message, in_response_to, acker);
        self.flush().await
    }

    /// Drain the queue if nobody else is doing so.
    ///
    /// Exactly one drainer runs at a time. When the lock is contended this
    /// returns immediately: the active drainer's post-release re-check
    /// guarantees items enqueued before the failed `try_lock` are drained.
    pub async fn flush(&self) -> Result<()> {
        loop {
            let Ok(guard) = self.drain_lock.try_lock() else {
                return Ok(());
            };
            self.drain().await?;
            drop(guard);

            // Items may have raced in during the final empty check above;
            // they observed the lock held, so they are visible here.
            if self.pending.lock().unwrap().is_empty() {
                return Ok(());
            }
        }
    }

    /// Number of messages waiting for a drain.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    async fn drain(&self) -> Result<()> {
        loop {
            let batch: Vec<PendingItem<M>> = {
                let mut pending = self.pending.lock().unwrap();
                let take = pending.len().min(self.options.max_batch);
                pending.drain(..take).collect()
            };
            if batch.is_empty() {
                return Ok(());
            }
            debug!(batch_len = batch.len(), "draining relay batch");

            for item in &batch {
                self.producer
                    .send_message(&item.message, Some(&item.in_response_to), None)
                    .await?;
            }
            self.producer.wait_for_confirms().await?;

            // The batch is durable at the broker: release the consumed
            // deliveries.
            for item in batch {
                item.acker.ack().await?;
            }
        }
    }

    /// Spawn the periodic flush task bounding the batch window.
    pub fn spawn_flush_task(self: &Arc<Self>) -> RelayFlushHandle {
        let relay = Arc::clone(self);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = Duration::from_millis(self.options.max_flush_interval_ms.max(1));

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = relay.flush().await {
                            // The producer has already escalated fatally
                            error!(error = %e, "relay flush failed, stopping flush task");
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
        });

        RelayFlushHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle to a running periodic flush task.
pub struct RelayFlushHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RelayFlushHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}
