//! Broker channel contract
//!
//! The pipeline publishes and consumes over a topic-routed exchange/queue
//! model. Workers talk to the broker exclusively through [`BrokerChannel`],
//! an object-safe async contract; the embedded [`memory`] implementation
//! backs single-node runs and every integration test, and a networked
//! client is a deployment concern implementing the same trait.

pub mod memory;

pub use memory::{InMemoryBroker, MemoryChannel};

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// One message handed to a consumer by the broker.
///
/// The `delivery_tag` is a per-channel monotonically increasing handle that
/// must be used to ack or nack exactly this delivery, exactly once. A
/// delivery neither acked nor nacked when its channel closes is in doubt
/// and will be redelivered.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    /// True when the broker has delivered this message before
    pub redelivered: bool,
    pub routing_key: String,
    /// String-keyed metadata block carrying the message envelope
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Publisher-confirm events emitted by the broker, in publish order.
#[derive(Debug, Clone)]
pub enum ConfirmEvent {
    /// The broker has taken responsibility for the publish
    Ack { publish_seq: u64, multiple: bool },
    /// The broker refused the publish
    Nack { publish_seq: u64, multiple: bool },
    /// The publish was returned as unroutable (topology misconfiguration)
    Return { routing_key: String, reason: String },
}

/// A single broker channel: the unit of publishing, consuming, and
/// acknowledgement. Channels are not safe for uncoordinated concurrent
/// publishes by the broker protocol's own rules; the [`crate::Producer`]
/// serializes access internally.
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Publish a message, returning its per-channel publish sequence number
    /// for correlation with [`ConfirmEvent`]s.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Result<u64>;

    /// Register a listener for publisher-confirm events. Events are
    /// delivered to every listener registered at emit time.
    fn confirm_listener(&self) -> mpsc::UnboundedReceiver<ConfirmEvent>;

    /// Start consuming from `queue`. At most `prefetch` deliveries are
    /// outstanding (delivered but not yet acked/nacked) at any moment,
    /// which is the channel's backpressure against the broker.
    async fn consume(&self, queue: &str, prefetch: usize) -> Result<mpsc::Receiver<Delivery>>;

    /// Acknowledge one delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Reject one delivery, optionally requeueing it for redelivery.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    /// Close the channel; in-doubt deliveries are requeued.
    async fn close(&self) -> Result<()>;
}
