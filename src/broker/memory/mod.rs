//! In-process message broker for standalone mode.
//!
//! Implements the subset of AMQP 0.9.1 routing the crate relies on:
//! the default exchange, fanout exchanges, competing consumers
//! with round-robin dispatch, per-channel prefetch, manual acknowledgment
//! with requeue on channel close, and exclusive/auto-delete queues.
//!
//! Exclusive queues belong to the declaring channel rather than the
//! connection, so closing that channel deletes them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use super::{
    Acknowledger, Broker, BrokerChannel, BrokerError, ConsumeOptions, Delivery, DeliveryStream,
    Envelope, ExchangeKind, QueueHandle, QueueOptions, Result, DEFAULT_EXCHANGE,
};

/// Prefix for broker-generated queue names.
const GENERATED_QUEUE_PREFIX: &str = "mem.gen-";

type Shared = Arc<Mutex<State>>;

/// In-memory broker. Clones share the same queues and exchanges.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Shared,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Number of messages waiting in a queue, or `None` if it does not exist.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.ready.len())
    }

    /// Whether a queue currently exists.
    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Number of consumers attached to a queue.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }
}

fn lock(state: &Shared) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = self.lock();
        if state.closed {
            return Err(BrokerError::Connection("broker is closed".to_string()));
        }
        state.next_channel += 1;
        let id = state.next_channel;
        state.channels.insert(id, ChannelState::default());
        debug!(channel = id, "Opened in-memory channel");

        Ok(Arc::new(MemoryChannel {
            id,
            state: Arc::clone(&self.state),
        }))
    }

    async fn close(&self) -> Result<()> {
        let handle = Arc::downgrade(&self.state);
        let mut state = self.lock();
        state.closed = true;
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            state.close_channel(id, &handle);
        }
        info!("In-memory broker closed");
        Ok(())
    }
}

// ============================================================================
// Broker state
// ============================================================================

#[derive(Default)]
struct State {
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, ExchangeState>,
    channels: HashMap<u64, ChannelState>,
    next_channel: u64,
    next_queue: u64,
    next_consumer: u64,
    next_tag: u64,
    closed: bool,
}

struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
    bindings: Vec<(String, String)>,
}

struct QueueState {
    options: QueueOptions,
    owner: u64,
    ready: VecDeque<Message>,
    consumers: Vec<Consumer>,
    cursor: usize,
}

#[derive(Clone)]
struct Message {
    envelope: Envelope,
    redelivered: bool,
}

struct Consumer {
    channel: u64,
    auto_ack: bool,
    tx: mpsc::UnboundedSender<Result<Delivery>>,
}

#[derive(Default)]
struct ChannelState {
    prefetch: Option<u16>,
    unacked: HashMap<u64, (String, Message)>,
    owned_queues: Vec<String>,
}

impl State {
    fn ensure_open(&self, channel: u64) -> Result<()> {
        if self.channels.contains_key(&channel) {
            Ok(())
        } else {
            Err(BrokerError::Closed)
        }
    }

    /// Hand ready messages to consumers until the queue is empty or every
    /// consumer is at its prefetch limit.
    fn dispatch(&mut self, queue: &str, handle: &Weak<Mutex<State>>) {
        let State {
            queues,
            channels,
            next_tag,
            ..
        } = self;
        let Some(q) = queues.get_mut(queue) else {
            return;
        };

        loop {
            q.consumers.retain(|c| !c.tx.is_closed());
            if q.ready.is_empty() || q.consumers.is_empty() {
                break;
            }

            let count = q.consumers.len();
            let chosen = (0..count)
                .map(|offset| (q.cursor + offset) % count)
                .find(|&idx| {
                    let consumer = &q.consumers[idx];
                    if consumer.auto_ack {
                        return true;
                    }
                    match channels.get(&consumer.channel) {
                        Some(ch) => match ch.prefetch {
                            Some(limit) if limit > 0 => ch.unacked.len() < limit as usize,
                            _ => true,
                        },
                        None => false,
                    }
                });
            let Some(idx) = chosen else {
                break;
            };
            let Some(message) = q.ready.pop_front() else {
                break;
            };
            q.cursor = (idx + 1) % count;

            let consumer = &q.consumers[idx];
            let acker: Option<Box<dyn Acknowledger>> = if consumer.auto_ack {
                None
            } else {
                *next_tag += 1;
                let tag = *next_tag;
                if let Some(ch) = channels.get_mut(&consumer.channel) {
                    ch.unacked.insert(tag, (queue.to_string(), message.clone()));
                }
                Some(Box::new(MemoryAcker {
                    state: handle.clone(),
                    channel: consumer.channel,
                    tag,
                }))
            };

            let delivery = Delivery::new(message.envelope.clone(), message.redelivered, acker);
            if consumer.tx.send(Ok(delivery)).is_err() {
                // Receiver went away between the liveness check and the send.
                if !consumer.auto_ack {
                    let tag = *next_tag;
                    if let Some(ch) = channels.get_mut(&consumer.channel) {
                        ch.unacked.remove(&tag);
                    }
                }
                q.ready.push_front(message);
            }
        }
    }

    fn settle(
        &mut self,
        channel: u64,
        tag: u64,
        requeue: Option<bool>,
        handle: &Weak<Mutex<State>>,
    ) -> Result<()> {
        let ch = self.channels.get_mut(&channel).ok_or(BrokerError::Closed)?;
        let (queue, mut message) = ch
            .unacked
            .remove(&tag)
            .ok_or_else(|| BrokerError::Ack(format!("unknown delivery tag {}", tag)))?;

        if requeue == Some(true) {
            if let Some(q) = self.queues.get_mut(&queue) {
                message.redelivered = true;
                q.ready.push_front(message);
            }
        }
        self.dispatch(&queue, handle);
        Ok(())
    }

    fn close_channel(&mut self, channel: u64, handle: &Weak<Mutex<State>>) {
        let Some(ch) = self.channels.remove(&channel) else {
            return;
        };

        let mut touched: HashSet<String> = HashSet::new();
        for (name, q) in self.queues.iter_mut() {
            let before = q.consumers.len();
            q.consumers.retain(|c| c.channel != channel);
            if q.consumers.len() != before {
                touched.insert(name.clone());
            }
        }

        // Requeue in reverse delivery order so the oldest ends up at the front.
        let mut unacked: Vec<(u64, (String, Message))> = ch.unacked.into_iter().collect();
        unacked.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, (queue, mut message)) in unacked {
            if let Some(q) = self.queues.get_mut(&queue) {
                message.redelivered = true;
                q.ready.push_front(message);
                touched.insert(queue);
            }
        }

        for name in ch.owned_queues {
            let removable = self
                .queues
                .get(&name)
                .map(|q| q.options.exclusive || q.options.auto_delete)
                .unwrap_or(false);
            if removable {
                self.delete_queue(&name);
                touched.remove(&name);
            }
        }

        for name in touched {
            self.dispatch(&name, handle);
        }
        debug!(channel, "Closed in-memory channel");
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|(queue, _)| queue != name);
        }
        debug!(queue = %name, "Deleted queue");
    }

    /// Queues a publish to `exchange` with `routing_key` lands in.
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }

        let ex = self.exchanges.get(exchange).ok_or_else(|| {
            BrokerError::Publish(format!("no exchange '{}' in vhost", exchange))
        })?;

        // Fanout only: the routing key is ignored.
        let mut targets: Vec<String> = Vec::new();
        for (queue, _) in &ex.bindings {
            if !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }
        Ok(targets)
    }
}

// ============================================================================
// Channel
// ============================================================================

/// A channel on the in-memory broker. Dropping it closes it.
pub struct MemoryChannel {
    id: u64,
    state: Shared,
}

impl MemoryChannel {
    fn handle(&self) -> Weak<Mutex<State>> {
        Arc::downgrade(&self.state)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<QueueHandle> {
        let mut state = lock(&self.state);
        state.ensure_open(self.id)?;

        let name = if name.is_empty() {
            state.next_queue += 1;
            format!("{}{}", GENERATED_QUEUE_PREFIX, state.next_queue)
        } else {
            name.to_string()
        };

        if let Some(existing) = state.queues.get(&name) {
            if existing.options.exclusive && existing.owner != self.id {
                return Err(BrokerError::Declare(format!(
                    "queue '{}' is locked by another channel",
                    name
                )));
            }
            if existing.options != options {
                return Err(BrokerError::Declare(format!(
                    "inequivalent arguments for queue '{}'",
                    name
                )));
            }
            return Ok(QueueHandle::new(name));
        }

        state.queues.insert(
            name.clone(),
            QueueState {
                options,
                owner: self.id,
                ready: VecDeque::new(),
                consumers: Vec::new(),
                cursor: 0,
            },
        );
        if let Some(ch) = state.channels.get_mut(&self.id) {
            ch.owned_queues.push(name.clone());
        }
        debug!(queue = %name, ?options, "Declared queue");
        Ok(QueueHandle::new(name))
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        let mut state = lock(&self.state);
        state.ensure_open(self.id)?;

        if name == DEFAULT_EXCHANGE {
            return Err(BrokerError::Declare(
                "the default exchange cannot be declared".to_string(),
            ));
        }

        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind || existing.durable != durable => {
                Err(BrokerError::Declare(format!(
                    "inequivalent arguments for exchange '{}'",
                    name
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        durable,
                        bindings: Vec::new(),
                    },
                );
                debug!(exchange = %name, ?kind, durable, "Declared exchange");
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &QueueHandle,
        exchange: &str,
        routing_key: &str,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        state.ensure_open(self.id)?;

        if !state.queues.contains_key(queue.name()) {
            return Err(BrokerError::Declare(format!("no queue '{}'", queue.name())));
        }
        let ex = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::Declare(format!("no exchange '{}'", exchange)))?;

        let binding = (queue.name().to_string(), routing_key.to_string());
        if !ex.bindings.contains(&binding) {
            ex.bindings.push(binding);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let mut state = lock(&self.state);
        let ch = state.channels.get_mut(&self.id).ok_or(BrokerError::Closed)?;
        ch.prefetch = Some(count);
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, envelope: Envelope) -> Result<()> {
        let handle = self.handle();
        let mut state = lock(&self.state);
        state.ensure_open(self.id)?;

        let targets = state.route(exchange, routing_key)?;
        if targets.is_empty() {
            debug!(exchange = %exchange, routing_key = %routing_key, "Message unroutable, dropped");
            return Ok(());
        }

        for queue in targets {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_back(Message {
                    envelope: envelope.clone(),
                    redelivered: false,
                });
            }
            state.dispatch(&queue, &handle);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &QueueHandle,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream> {
        let handle = self.handle();
        let mut state = lock(&self.state);
        state.ensure_open(self.id)?;

        state.next_consumer += 1;
        let tag = state.next_consumer;
        let (tx, rx) = mpsc::unbounded_channel();

        let q = state
            .queues
            .get_mut(queue.name())
            .ok_or_else(|| BrokerError::Consume(format!("no queue '{}'", queue.name())))?;
        q.consumers.push(Consumer {
            channel: self.id,
            auto_ack: options.auto_ack,
            tx,
        });
        debug!(
            queue = %queue.name(),
            consumer = tag,
            auto_ack = options.auto_ack,
            "Consumer attached"
        );

        state.dispatch(queue.name(), &handle);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn close(&self) -> Result<()> {
        let handle = self.handle();
        lock(&self.state).close_channel(self.id, &handle);
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        let handle = self.handle();
        lock(&self.state).close_channel(self.id, &handle);
    }
}

struct MemoryAcker {
    state: Weak<Mutex<State>>,
    channel: u64,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<()> {
        let state = self.state.upgrade().ok_or(BrokerError::Closed)?;
        let handle = Arc::downgrade(&state);
        let mut guard = lock(&state);
        guard.settle(self.channel, self.tag, requeue, &handle)
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(None)
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.settle(Some(requeue))
    }
}
