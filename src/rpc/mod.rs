//! Request/reply over the message broker.
//!
//! A call opens its own channel, declares a broker-named exclusive reply
//! queue, starts consuming it, and only then publishes the request to the
//! shared work queue. Replies are matched by correlation token; anything
//! else arriving on the reply queue is discarded. The wait is bounded by the
//! configured timeout and can be cancelled.
//!
//! ```text
//! caller                         broker                        worker
//!   | declare reply queue (excl.)  |                              |
//!   | consume reply queue          |                              |
//!   | publish(rpc_queue, {corr, reply_to}) --------------------> |
//!   |                              |  <------ publish(reply_to, {corr})
//!   | <-------- reply {corr}       |                              |
//!   | close channel (queue deleted)|                              |
//! ```

mod token;

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use crate::broker::{
    Broker, BrokerChannel, BrokerError, ConsumeOptions, Envelope, QueueOptions, DEFAULT_EXCHANGE,
};

pub use token::{correlation_token, TOKEN_LENGTH};

/// Well-known work queue shared by callers and workers.
pub const DEFAULT_WORK_QUEUE: &str = "rpc_queue";

/// Errors surfaced to RPC callers.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("No matching reply within {0:?}")]
    Timeout(Duration),

    #[error("Malformed reply payload: {0}")]
    Decode(String),

    #[error("Call cancelled")]
    Cancelled,

    #[error("Reply channel closed before a matching reply arrived")]
    ReplyChannelClosed,

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Result type for RPC calls.
pub type Result<T> = std::result::Result<T, RpcError>;

/// RPC client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Work queue requests are published to.
    pub work_queue: String,
    /// How long a call waits for its reply.
    pub timeout_ms: u64,
    /// Extra attempts at opening the call's channel on connection faults.
    pub connect_retries: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            work_queue: DEFAULT_WORK_QUEUE.to_string(),
            timeout_ms: 30_000,
            connect_retries: 0,
        }
    }
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

/// Blocking-call facade over the broker.
///
/// Calls share nothing but the broker handle, so one client can serve any
/// number of concurrent callers.
#[derive(Clone)]
pub struct RpcClient {
    broker: Arc<dyn Broker>,
    config: RpcConfig,
}

impl RpcClient {
    pub fn new(broker: Arc<dyn Broker>, config: RpcConfig) -> Self {
        Self { broker, config }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Send a raw payload and wait for the correlated reply.
    pub async fn call(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        self.call_with_cancel(payload, CancellationToken::new()).await
    }

    /// Like [`call`](Self::call), but returns `RpcError::Cancelled` as soon as
    /// `cancel` fires, including while the channel is still being opened.
    pub async fn call_with_cancel(
        &self,
        payload: impl Into<Bytes>,
        cancel: CancellationToken,
    ) -> Result<Bytes> {
        self.send(Envelope::new(payload), cancel).await
    }

    /// Compute `fib(n)` on a remote worker.
    pub async fn fibonacci(&self, n: u32) -> Result<u64> {
        let reply = self
            .send(Envelope::text(n), CancellationToken::new())
            .await?;
        decode_integer(&reply)
    }

    async fn send(&self, request: Envelope, cancel: CancellationToken) -> Result<Bytes> {
        let correlation_id = correlation_token();
        let span = tracing::info_span!("rpc.call", correlation_id = %correlation_id);

        async {
            let channel = tokio::select! {
                _ = cancel.cancelled() => return Err(RpcError::Cancelled),
                opened = self.open_channel() => opened?,
            };
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(RpcError::Cancelled),
                outcome = self.exchange(channel.as_ref(), request, &correlation_id) => outcome,
            };

            // The reply queue is exclusive and auto-delete: closing the
            // channel removes it on every path.
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Failed to close RPC channel");
            }
            outcome
        }
        .instrument(span)
        .await
    }

    /// Open the call's channel, retrying connection faults with backoff.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(self.config.connect_retries)
            .with_jitter()
            .build();

        let mut last_error = None;
        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }
            match self.broker.open_channel().await {
                Ok(channel) => return Ok(channel),
                Err(e) if e.is_transport() => {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.config.connect_retries,
                        error = %e,
                        "Failed to open RPC channel"
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_error
            .unwrap_or_else(|| BrokerError::Connection("no attempt made".to_string()))
            .into())
    }

    async fn exchange(
        &self,
        channel: &dyn BrokerChannel,
        request: Envelope,
        correlation_id: &str,
    ) -> Result<Bytes> {
        let reply_queue = channel.declare_queue("", QueueOptions::ephemeral()).await?;

        // Listen before publishing so a fast reply cannot slip past.
        let mut feed = channel
            .consume(&reply_queue, ConsumeOptions::auto_ack())
            .await?;

        let request = request
            .with_correlation_id(correlation_id)
            .with_reply_to(reply_queue.name());
        channel
            .publish(DEFAULT_EXCHANGE, &self.config.work_queue, request)
            .await?;
        debug!(
            work_queue = %self.config.work_queue,
            reply_to = %reply_queue.name(),
            "Published RPC request"
        );

        let wait = async {
            while let Some(item) = feed.next().await {
                let delivery = item?;
                match delivery.envelope.correlation_id.as_deref() {
                    Some(id) if id == correlation_id => return Ok(delivery.envelope.payload),
                    other => debug!(received = ?other, "Discarding reply for another call"),
                }
            }
            Err(RpcError::ReplyChannelClosed)
        };

        let timeout = self.config.timeout();
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = self.config.timeout_ms, "RPC call timed out");
                Err(RpcError::Timeout(timeout))
            }
        }
    }
}

/// Parse a decimal text payload.
pub fn decode_integer(payload: &[u8]) -> Result<u64> {
    std::str::from_utf8(payload)
        .ok()
        .and_then(|text| text.trim().parse::<u64>().ok())
        .ok_or_else(|| RpcError::Decode(String::from_utf8_lossy(payload).into_owned()))
}
