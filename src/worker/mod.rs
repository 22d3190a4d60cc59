//! RPC worker: consumes the work queue, computes, replies, acknowledges.
//!
//! Each worker holds at most `prefetch` (default 1) unacknowledged requests,
//! so running more workers scales throughput horizontally. The reply is
//! published before the request is acknowledged: a worker that dies in
//! between leaves the request unacknowledged and the broker hands it to
//! another worker (at-least-once processing). Shutting down mid-computation
//! rejects the in-flight request with requeue.

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{
    Broker, BrokerChannel, BrokerError, ConsumeOptions, Delivery, DeliveryStream, Envelope,
    QueueOptions, DEFAULT_EXCHANGE,
};

/// Errors raised while serving a request.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Request payload is not an integer: {0:?}")]
    Decode(String),

    #[error("Request has no reply_to address")]
    MissingReplyTo,

    #[error("Input {input} exceeds the limit of {max}")]
    InputOutOfRange { input: u64, max: u64 },

    #[error("Computation failed: {0}")]
    Compute(String),

    #[error("Shut down while computing; request returned to the queue")]
    Interrupted,

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Result type for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Not consuming: starting up, between requests, or reconnecting.
    Idle,
    /// Waiting for the next request.
    Fetching,
    /// Running the computation.
    Computing,
    /// Publishing the reply and acknowledging the request.
    Replying,
    /// Shut down.
    Stopped,
}

/// A pure function of an integer input.
pub trait Compute: Send + Sync + 'static {
    fn compute(&self, input: u64) -> u64;
}

/// Naive recursive Fibonacci. Deliberately CPU-bound.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fibonacci;

impl Compute for Fibonacci {
    fn compute(&self, input: u64) -> u64 {
        fib(input)
    }
}

/// `fib(0) = 0`, `fib(1) = 1`, `fib(n) = fib(n-1) + fib(n-2)`.
pub fn fib(n: u64) -> u64 {
    match n {
        0 => 0,
        1 => 1,
        n => fib(n - 1) + fib(n - 2),
    }
}

/// Worker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Unacknowledged requests a worker may hold.
    pub prefetch: u16,
    /// Largest accepted input; anything above is rejected like bad input.
    /// The default keeps naive `fib(n)` to about a second of CPU. Values
    /// above 93 overflow `u64`.
    pub max_input: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            prefetch: 1,
            max_input: 40,
        }
    }
}

/// An open channel and its feed from the work queue.
type Consumer = (Arc<dyn BrokerChannel>, DeliveryStream);

/// A decoded request.
#[derive(Debug, PartialEq, Eq)]
struct Request {
    input: u64,
    reply_to: String,
    correlation_id: Option<String>,
}

/// Long-lived consumer of the work queue.
pub struct RpcWorker {
    broker: Arc<dyn Broker>,
    work_queue: String,
    config: WorkerConfig,
    compute: Arc<dyn Compute>,
    state: watch::Sender<WorkerState>,
}

impl RpcWorker {
    pub fn new(
        broker: Arc<dyn Broker>,
        work_queue: impl Into<String>,
        config: WorkerConfig,
        compute: Arc<dyn Compute>,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            broker,
            work_queue: work_queue.into(),
            config,
            compute,
            state,
        }
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    /// Serve requests until `shutdown` fires.
    ///
    /// Failing to connect the first time is returned as an error. Transport
    /// faults after that are retried with exponential backoff and jitter.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();
        let mut backoff = backoff_builder.build();
        let mut connected_once = false;

        while !shutdown.is_cancelled() {
            self.set_state(WorkerState::Idle);
            match self.setup().await {
                Ok((channel, feed)) => {
                    connected_once = true;
                    backoff = backoff_builder.build();
                    info!(
                        queue = %self.work_queue,
                        prefetch = self.config.prefetch,
                        "Awaiting RPC requests"
                    );

                    let outcome = self.serve(channel.as_ref(), feed, &shutdown).await;
                    if let Err(e) = channel.close().await {
                        debug!(error = %e, "Failed to close worker channel");
                    }
                    match outcome {
                        Ok(()) => break,
                        Err(e) => error!(error = %e, "Worker lost its channel, reconnecting"),
                    }
                }
                Err(e) if !connected_once => {
                    self.set_state(WorkerState::Stopped);
                    return Err(e.into());
                }
                Err(e) => error!(error = %e, "Failed to set up worker"),
            }

            let delay = backoff.next().unwrap_or(Duration::from_secs(30));
            debug!(backoff_ms = %delay.as_millis(), "Worker waiting before reconnect");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(WorkerState::Stopped);
        info!(queue = %self.work_queue, "Worker stopped");
        Ok(())
    }

    async fn setup(&self) -> std::result::Result<Consumer, BrokerError> {
        let channel = self.broker.open_channel().await?;
        let queue = channel
            .declare_queue(&self.work_queue, QueueOptions::shared())
            .await?;
        channel.set_prefetch(self.config.prefetch).await?;
        let feed = channel.consume(&queue, ConsumeOptions::manual_ack()).await?;
        Ok((channel, feed))
    }

    /// Process deliveries until shutdown (`Ok`) or a transport fault (`Err`).
    async fn serve(
        &self,
        channel: &dyn BrokerChannel,
        mut feed: DeliveryStream,
        shutdown: &CancellationToken,
    ) -> std::result::Result<(), BrokerError> {
        loop {
            self.set_state(WorkerState::Fetching);
            let item = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                item = feed.next() => item,
            };
            let delivery = match item {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => return Err(e),
                None => return Err(BrokerError::Closed),
            };

            match self.handle(channel, delivery, shutdown).await {
                Ok(()) => {}
                Err(WorkerError::Interrupted) => return Ok(()),
                Err(WorkerError::Broker(e)) => return Err(e),
                Err(e) => warn!(error = %e, "Skipped request"),
            }
            self.set_state(WorkerState::Idle);
        }
    }

    async fn handle(
        &self,
        channel: &dyn BrokerChannel,
        delivery: Delivery,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let request = match self.decode(&delivery.envelope) {
            Ok(request) => request,
            Err(e) => {
                // Redelivering a malformed request would fail the same way.
                delivery.reject(false).await?;
                return Err(e);
            }
        };

        self.set_state(WorkerState::Computing);
        debug!(input = request.input, redelivered = delivery.redelivered, "Computing");
        let compute = Arc::clone(&self.compute);
        let input = request.input;
        let task = tokio::task::spawn_blocking(move || compute.compute(input));
        let joined = tokio::select! {
            _ = shutdown.cancelled() => {
                // The blocking thread runs on; its result is discarded.
                delivery.reject(true).await?;
                info!(input, "Returned in-flight request to the queue on shutdown");
                return Err(WorkerError::Interrupted);
            }
            joined = task => joined,
        };
        let output = match joined {
            Ok(output) => output,
            Err(e) => {
                delivery.reject(false).await?;
                return Err(WorkerError::Compute(e.to_string()));
            }
        };

        self.set_state(WorkerState::Replying);
        let mut reply = Envelope::text(output);
        reply.correlation_id = request.correlation_id;
        channel
            .publish(DEFAULT_EXCHANGE, &request.reply_to, reply)
            .await?;
        delivery.ack().await?;

        info!(input, output, "Served request");
        Ok(())
    }

    fn decode(&self, envelope: &Envelope) -> Result<Request> {
        let reply_to = envelope
            .reply_to
            .clone()
            .filter(|r| !r.is_empty())
            .ok_or(WorkerError::MissingReplyTo)?;

        let input = std::str::from_utf8(&envelope.payload)
            .ok()
            .and_then(|text| text.trim().parse::<u64>().ok())
            .ok_or_else(|| {
                WorkerError::Decode(String::from_utf8_lossy(&envelope.payload).into_owned())
            })?;

        let max = self.config.max_input;
        if input > max {
            return Err(WorkerError::InputOutOfRange { input, max });
        }

        Ok(Request {
            input,
            reply_to,
            correlation_id: envelope.correlation_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests;
