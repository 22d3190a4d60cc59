//! Fan-out log pipeline.
//!
//! Publishers send fire-and-forget events to a durable fan-out exchange.
//! Each subscriber binds its own exclusive, auto-delete queue, so every
//! bound subscriber receives a copy and events published while a subscriber
//! is not bound never reach it. A subscriber hands events to a single
//! long-lived sink writer through a bounded channel. When the writer falls
//! behind, the subscriber stops pulling from its queue until there is room.

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{
    Broker, BrokerChannel, BrokerError, ConsumeOptions, Delivery, DeliveryStream, Envelope,
    ExchangeKind, QueueOptions, Result,
};
use crate::sink::{LogRecord, LogSink};

/// Well-known fan-out exchange shared by publishers and subscribers.
pub const DEFAULT_LOG_EXCHANGE: &str = "logs";

/// Log pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    /// Fan-out exchange name.
    pub exchange: String,
    /// Events a subscriber may queue for its sink writer before it stops
    /// reading from the broker.
    pub buffer: usize,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            exchange: DEFAULT_LOG_EXCHANGE.to_string(),
            buffer: 1024,
        }
    }
}

async fn declare_log_exchange(channel: &dyn BrokerChannel, exchange: &str) -> Result<()> {
    channel
        .declare_exchange(exchange, ExchangeKind::Fanout, true)
        .await
}

// ============================================================================
// Publisher
// ============================================================================

/// Publishes log events on one long-lived channel.
pub struct LogPublisher {
    channel: Arc<dyn BrokerChannel>,
    exchange: String,
}

impl LogPublisher {
    /// Open a channel and declare the exchange.
    pub async fn new(broker: Arc<dyn Broker>, config: LogsConfig) -> Result<Self> {
        let channel = broker.open_channel().await?;
        declare_log_exchange(channel.as_ref(), &config.exchange).await?;
        Ok(Self {
            channel,
            exchange: config.exchange,
        })
    }

    /// Publish one event as a persistent message. Fan-out ignores the routing key.
    pub async fn publish(&self, message: impl Into<Bytes>) -> Result<()> {
        self.channel
            .publish(&self.exchange, "", Envelope::new(message).persistent())
            .await
    }

    /// Publish several events in order. Returns how many were sent.
    pub async fn publish_batch<I, M>(&self, messages: I) -> Result<usize>
    where
        I: IntoIterator<Item = M>,
        M: Into<Bytes>,
    {
        let mut sent = 0;
        for message in messages {
            self.publish(message).await?;
            sent += 1;
        }
        debug!(exchange = %self.exchange, count = sent, "Published log batch");
        Ok(sent)
    }

    pub async fn close(&self) -> Result<()> {
        self.channel.close().await
    }
}

// ============================================================================
// Subscriber
// ============================================================================

/// Bound queue plus its feed.
type Binding = (Arc<dyn BrokerChannel>, DeliveryStream);

/// Persists every event seen while bound.
pub struct LogSubscriber {
    broker: Arc<dyn Broker>,
    config: LogsConfig,
    sink: Arc<dyn LogSink>,
    bound: watch::Sender<bool>,
}

impl LogSubscriber {
    pub fn new(broker: Arc<dyn Broker>, config: LogsConfig, sink: Arc<dyn LogSink>) -> Self {
        let (bound, _) = watch::channel(false);
        Self {
            broker,
            config,
            sink,
            bound,
        }
    }

    /// Resolves once the subscriber's queue is bound to the exchange.
    pub async fn ready(&self) {
        let mut bound = self.bound.subscribe();
        // The sender lives as long as `self`.
        let _ = bound.wait_for(|bound| *bound).await;
    }

    /// Whether the subscriber's queue is currently bound.
    pub fn is_bound(&self) -> bool {
        *self.bound.borrow()
    }

    /// Consume events until `shutdown` fires.
    ///
    /// Failing to bind the first time is returned as an error. Transport
    /// faults after that are retried with exponential backoff and jitter;
    /// events published in the meantime are lost. Events already handed to
    /// the sink writer are flushed before this returns.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let (tx, rx) = mpsc::channel(self.config.buffer.max(1));
        let writer = tokio::spawn(write_records(Arc::clone(&self.sink), rx));

        let outcome = self.consume_with_reconnect(&tx, &shutdown).await;

        drop(tx);
        if let Err(e) = writer.await {
            error!(error = %e, "Sink writer task failed");
        }
        self.bound.send_replace(false);
        info!(exchange = %self.config.exchange, "Log subscriber stopped");
        outcome
    }

    async fn consume_with_reconnect(
        &self,
        tx: &mpsc::Sender<LogRecord>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();
        let mut backoff = backoff_builder.build();
        let mut connected_once = false;

        while !shutdown.is_cancelled() {
            match self.bind().await {
                Ok((channel, feed)) => {
                    connected_once = true;
                    backoff = backoff_builder.build();
                    self.bound.send_replace(true);
                    info!(exchange = %self.config.exchange, "Log subscriber bound");

                    let outcome = self.forward(feed, tx, shutdown).await;
                    self.bound.send_replace(false);
                    if let Err(e) = channel.close().await {
                        debug!(error = %e, "Failed to close subscriber channel");
                    }
                    match outcome {
                        Ok(()) => break,
                        Err(e) => {
                            error!(error = %e, "Log subscriber lost its channel, reconnecting")
                        }
                    }
                }
                Err(e) if !connected_once => return Err(e),
                Err(e) => error!(error = %e, "Failed to bind log subscriber"),
            }

            let delay = backoff.next().unwrap_or(Duration::from_secs(30));
            debug!(backoff_ms = %delay.as_millis(), "Log subscriber waiting before reconnect");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        Ok(())
    }

    async fn bind(&self) -> Result<Binding> {
        let channel = self.broker.open_channel().await?;
        declare_log_exchange(channel.as_ref(), &self.config.exchange).await?;
        let queue = channel.declare_queue("", QueueOptions::ephemeral()).await?;
        channel.bind_queue(&queue, &self.config.exchange, "").await?;
        let feed = channel.consume(&queue, ConsumeOptions::auto_ack()).await?;
        debug!(queue = %queue.name(), "Bound log queue");
        Ok((channel, feed))
    }

    /// Hand deliveries to the writer until shutdown (`Ok`) or a fault (`Err`).
    async fn forward(
        &self,
        mut feed: DeliveryStream,
        tx: &mpsc::Sender<LogRecord>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        loop {
            let item = tokio::select! {
                _ = shutdown.cancelled() => {
                    // Auto-acked deliveries already buffered would otherwise be lost.
                    while let Some(Some(Ok(delivery))) = feed.next().now_or_never() {
                        enqueue(tx, delivery).await;
                    }
                    return Ok(());
                }
                item = feed.next() => item,
            };
            match item {
                Some(Ok(delivery)) => enqueue(tx, delivery).await,
                Some(Err(e)) => return Err(e),
                None => return Err(BrokerError::Closed),
            }
        }
    }
}

/// Waits for room in the writer queue. Drops the event only if the writer is gone.
async fn enqueue(tx: &mpsc::Sender<LogRecord>, delivery: Delivery) {
    let record = LogRecord::new(String::from_utf8_lossy(&delivery.envelope.payload));
    if tx.send(record).await.is_err() {
        error!("Sink writer is gone, dropping log event");
    }
}

/// Single writer: one sink handle for the life of the subscriber.
async fn write_records(sink: Arc<dyn LogSink>, mut rx: mpsc::Receiver<LogRecord>) {
    while let Some(record) = rx.recv().await {
        if let Err(e) = sink.append(record).await {
            warn!(error = %e, "Failed to persist log event");
        }
    }
}
