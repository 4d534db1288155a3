//! Embedded in-process broker
//!
//! A topic-routed exchange/queue broker living inside the worker process.
//! It implements the full delivery contract the substrate relies on:
//! per-channel monotonic delivery tags, a real prefetch window (no more
//! than `prefetch` unacknowledged deliveries outstanding), nack-requeue
//! redelivery at the queue head, requeue of in-doubt deliveries on channel
//! close, and publisher confirm/return events.
//!
//! Used directly for single-node deployments and by every integration
//! test; a networked broker client implements the same [`BrokerChannel`]
//! trait.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, warn};

use super::{BrokerChannel, ConfirmEvent, Delivery};
use crate::error::{Error, Result};

/// Match a topic binding pattern against a routing key.
///
/// `*` matches exactly one dot-separated word, `#` matches zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn rec(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                if pattern.len() == 1 {
                    return true;
                }
                (0..=key.len()).any(|skip| rec(&pattern[1..], &key[skip..]))
            }
            (Some(&"*"), Some(_)) => rec(&pattern[1..], &key[1..]),
            (Some(&word), Some(&key_word)) if word == key_word => rec(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    rec(&pattern, &key)
}

#[derive(Clone)]
struct QueuedMessage {
    routing_key: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    redelivered: bool,
}

struct QueueState {
    name: String,
    messages: Mutex<VecDeque<QueuedMessage>>,
    notify: Notify,
}

impl QueueState {
    fn push_back(&self, msg: QueuedMessage) {
        self.messages.lock().unwrap().push_back(msg);
        self.notify.notify_one();
    }

    fn push_front(&self, msg: QueuedMessage) {
        self.messages.lock().unwrap().push_front(msg);
        self.notify.notify_one();
    }

    fn pop_front(&self) -> Option<QueuedMessage> {
        self.messages.lock().unwrap().pop_front()
    }

    fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

struct Binding {
    pattern: String,
    queue: String,
}

#[derive(Default)]
struct Exchange {
    bindings: Vec<Binding>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Arc<QueueState>>,
}

/// The embedded broker: a registry of exchanges, queues, and bindings.
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrokerState::default()),
        })
    }

    /// Declare a topic exchange. Idempotent.
    pub fn declare_exchange(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .exchanges
            .entry(name.to_string())
            .or_default();
    }

    /// Declare a queue. Idempotent.
    pub fn declare_queue(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .queues
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(QueueState {
                    name: name.to_string(),
                    messages: Mutex::new(VecDeque::new()),
                    notify: Notify::new(),
                })
            });
    }

    /// Bind a declared queue to a declared exchange under a topic pattern.
    pub fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.queues.contains_key(queue) {
            return Err(Error::Broker(format!("queue not declared: {queue}")));
        }
        let ex = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| Error::UnknownExchange(exchange.to_string()))?;
        let exists = ex
            .bindings
            .iter()
            .any(|b| b.pattern == pattern && b.queue == queue);
        if !exists {
            ex.bindings.push(Binding {
                pattern: pattern.to_string(),
                queue: queue.to_string(),
            });
        }
        Ok(())
    }

    /// Number of messages currently waiting in a queue (delivered-but-unacked
    /// messages are not counted).
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Open a new channel against this broker.
    pub fn open_channel(self: &Arc<Self>) -> Arc<MemoryChannel> {
        let (closed_tx, closed_rx) = watch::channel(false);
        Arc::new(MemoryChannel {
            inner: Arc::new(ChannelInner {
                broker: Arc::clone(self),
                publish_seq: AtomicU64::new(0),
                next_delivery_tag: AtomicU64::new(0),
                confirm_listeners: Mutex::new(Vec::new()),
                unacked: Mutex::new(HashMap::new()),
                closed_tx,
                closed_rx,
            }),
        })
    }

    fn queue(&self, name: &str) -> Result<Arc<QueueState>> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Broker(format!("queue not declared: {name}")))
    }

    /// Resolve the set of queues a publish routes to.
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<Arc<QueueState>>> {
        let state = self.state.lock().unwrap();
        let ex = state
            .exchanges
            .get(exchange)
            .ok_or_else(|| Error::UnknownExchange(exchange.to_string()))?;

        let mut targets: Vec<Arc<QueueState>> = Vec::new();
        for binding in &ex.bindings {
            if topic_matches(&binding.pattern, routing_key) {
                if let Some(queue) = state.queues.get(&binding.queue) {
                    if !targets.iter().any(|q| q.name == queue.name) {
                        targets.push(Arc::clone(queue));
                    }
                }
            }
        }
        Ok(targets)
    }
}

/// Per-consumer prefetch window: count of outstanding (unacked) deliveries.
struct Window {
    count: AtomicUsize,
    notify: Notify,
}

impl Window {
    fn release(&self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

struct UnackedDelivery {
    queue: Arc<QueueState>,
    message: QueuedMessage,
    window: Arc<Window>,
}

impl UnackedDelivery {
    fn requeue(self) {
        let mut message = self.message;
        message.redelivered = true;
        self.window.release();
        self.queue.push_front(message);
    }
}

struct ChannelInner {
    broker: Arc<InMemoryBroker>,
    publish_seq: AtomicU64,
    next_delivery_tag: AtomicU64,
    confirm_listeners: Mutex<Vec<mpsc::UnboundedSender<ConfirmEvent>>>,
    unacked: Mutex<HashMap<u64, UnackedDelivery>>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl ChannelInner {
    fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    fn emit(&self, event: ConfirmEvent) {
        self.confirm_listeners
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn take_unacked(&self, delivery_tag: u64) -> Result<UnackedDelivery> {
        self.unacked
            .lock()
            .unwrap()
            .remove(&delivery_tag)
            .ok_or(Error::DeliveryAlreadyFinalized { delivery_tag })
    }

    /// Requeue every in-doubt delivery, oldest first at the queue head.
    fn requeue_all_unacked(&self) {
        let mut entries: Vec<(u64, UnackedDelivery)> =
            self.unacked.lock().unwrap().drain().collect();
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, entry) in entries {
            entry.requeue();
        }
    }
}

/// One channel over the embedded broker.
pub struct MemoryChannel {
    inner: Arc<ChannelInner>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Result<u64> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(Error::Broker("channel is closed".into()));
        }

        let publish_seq = inner.publish_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let targets = inner.broker.route(exchange, routing_key)?;

        if targets.is_empty() {
            // Unroutable: the broker returns the message, then still
            // confirms the publish it took responsibility for.
            warn!(exchange, routing_key, "publish matched no binding");
            inner.emit(ConfirmEvent::Return {
                routing_key: routing_key.to_string(),
                reason: format!("no binding matched on exchange {exchange}"),
            });
            inner.emit(ConfirmEvent::Ack {
                publish_seq,
                multiple: false,
            });
            return Ok(publish_seq);
        }

        let message = QueuedMessage {
            routing_key: routing_key.to_string(),
            headers,
            body,
            redelivered: false,
        };
        for queue in &targets {
            queue.push_back(message.clone());
        }
        inner.emit(ConfirmEvent::Ack {
            publish_seq,
            multiple: false,
        });
        Ok(publish_seq)
    }

    fn confirm_listener(&self) -> mpsc::UnboundedReceiver<ConfirmEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.confirm_listeners.lock().unwrap().push(tx);
        rx
    }

    async fn consume(&self, queue: &str, prefetch: usize) -> Result<mpsc::Receiver<Delivery>> {
        let inner = Arc::clone(&self.inner);
        if inner.is_closed() {
            return Err(Error::Broker("channel is closed".into()));
        }
        let queue = inner.broker.queue(queue)?;
        let (tx, rx) = mpsc::channel(prefetch.max(1));

        let window = Arc::new(Window {
            count: AtomicUsize::new(0),
            notify: Notify::new(),
        });
        let mut closed_rx = inner.closed_rx.clone();

        tokio::spawn(async move {
            loop {
                if *closed_rx.borrow() {
                    break;
                }
                if !wait_for_slot(&window, prefetch, &mut closed_rx).await {
                    break;
                }
                let Some(message) = next_message(&queue, &mut closed_rx).await else {
                    break;
                };

                let delivery_tag = inner.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
                window.count.fetch_add(1, Ordering::SeqCst);
                inner.unacked.lock().unwrap().insert(
                    delivery_tag,
                    UnackedDelivery {
                        queue: Arc::clone(&queue),
                        message: message.clone(),
                        window: Arc::clone(&window),
                    },
                );

                let delivery = Delivery {
                    delivery_tag,
                    redelivered: message.redelivered,
                    routing_key: message.routing_key.clone(),
                    headers: message.headers.clone(),
                    body: message.body.clone(),
                };
                if tx.send(delivery).await.is_err() {
                    // Consumer dropped the stream: the delivery is in doubt
                    if let Some(entry) = inner.unacked.lock().unwrap().remove(&delivery_tag) {
                        entry.requeue();
                    }
                    break;
                }
            }
            debug!(queue = %queue.name, "delivery loop finished");
        });

        Ok(rx)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let entry = self.inner.take_unacked(delivery_tag)?;
        entry.window.release();
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let entry = self.inner.take_unacked(delivery_tag)?;
        if requeue {
            entry.requeue();
        } else {
            debug!(
                queue = %entry.queue.name,
                delivery_tag,
                "delivery rejected without requeue"
            );
            entry.window.release();
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed_tx.send_replace(true) {
            return Ok(());
        }
        self.inner.requeue_all_unacked();
        Ok(())
    }
}

async fn wait_for_slot(
    window: &Arc<Window>,
    prefetch: usize,
    closed: &mut watch::Receiver<bool>,
) -> bool {
    if prefetch == 0 {
        return true;
    }
    loop {
        if *closed.borrow() {
            return false;
        }
        let notified = window.notify.notified();
        if window.count.load(Ordering::SeqCst) < prefetch {
            return true;
        }
        tokio::select! {
            _ = notified => {}
            changed = closed.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

async fn next_message(
    queue: &Arc<QueueState>,
    closed: &mut watch::Receiver<bool>,
) -> Option<QueuedMessage> {
    loop {
        if *closed.borrow() {
            return None;
        }
        let notified = queue.notify.notified();
        if let Some(message) = queue.pop_front() {
            return Some(message);
        }
        tokio::select! {
            _ = notified => {}
            changed = closed.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
        }
    }
}
