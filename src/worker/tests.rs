use super::*;
use async_trait::async_trait;
use bytes::Bytes;
use crate::broker::{ExchangeKind, MemoryBroker, QueueHandle};
use crate::rpc::DEFAULT_WORK_QUEUE;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

/// Iterative reference implementation.
fn fib_reference(n: u64) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a + b;
        a = b;
        b = next;
    }
    a
}

struct CountingCompute {
    calls: Arc<AtomicUsize>,
}

impl Compute for CountingCompute {
    fn compute(&self, input: u64) -> u64 {
        self.calls.fetch_add(1, Ordering::SeqCst);
        input * 2
    }
}

/// Holds its thread until released, or for three seconds at most.
struct StallingCompute {
    release: Arc<AtomicBool>,
}

impl Compute for StallingCompute {
    fn compute(&self, input: u64) -> u64 {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !self.release.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        input
    }
}

/// Broker whose channels fail every publish. The first failure fires `failed`.
struct PublishFailingBroker {
    inner: MemoryBroker,
    failed: CancellationToken,
}

#[async_trait]
impl Broker for PublishFailingBroker {
    async fn open_channel(&self) -> crate::broker::Result<Arc<dyn BrokerChannel>> {
        Ok(Arc::new(PublishFailingChannel {
            inner: self.inner.open_channel().await?,
            failed: self.failed.clone(),
        }))
    }

    async fn close(&self) -> crate::broker::Result<()> {
        self.inner.close().await
    }
}

struct PublishFailingChannel {
    inner: Arc<dyn BrokerChannel>,
    failed: CancellationToken,
}

#[async_trait]
impl BrokerChannel for PublishFailingChannel {
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> crate::broker::Result<QueueHandle> {
        self.inner.declare_queue(name, options).await
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> crate::broker::Result<()> {
        self.inner.declare_exchange(name, kind, durable).await
    }

    async fn bind_queue(
        &self,
        queue: &QueueHandle,
        exchange: &str,
        routing_key: &str,
    ) -> crate::broker::Result<()> {
        self.inner.bind_queue(queue, exchange, routing_key).await
    }

    async fn set_prefetch(&self, count: u16) -> crate::broker::Result<()> {
        self.inner.set_prefetch(count).await
    }

    async fn publish(
        &self,
        _exchange: &str,
        _routing_key: &str,
        _envelope: Envelope,
    ) -> crate::broker::Result<()> {
        self.failed.cancel();
        Err(BrokerError::Channel("connection reset by peer".to_string()))
    }

    async fn consume(
        &self,
        queue: &QueueHandle,
        options: ConsumeOptions,
    ) -> crate::broker::Result<DeliveryStream> {
        self.inner.consume(queue, options).await
    }

    async fn close(&self) -> crate::broker::Result<()> {
        self.inner.close().await
    }
}

async fn wait_for_state(worker: &RpcWorker, wanted: WorkerState) {
    let mut state = worker.state();
    tokio::time::timeout(Duration::from_secs(1), state.wait_for(|s| *s == wanted))
        .await
        .unwrap_or_else(|_| panic!("worker never reached {:?}", wanted))
        .unwrap();
}

/// Take the next message off the work queue on a fresh channel. The delivery
/// is settled through that channel, so keep it open until then.
async fn take_from_work_queue(broker: &MemoryBroker) -> (Arc<dyn BrokerChannel>, Delivery) {
    let channel = broker.open_channel().await.unwrap();
    let mut feed = channel
        .consume(
            &QueueHandle::new(DEFAULT_WORK_QUEUE),
            ConsumeOptions::manual_ack(),
        )
        .await
        .unwrap();
    let delivery = tokio::time::timeout(Duration::from_secs(1), feed.next())
        .await
        .expect("work queue is empty")
        .expect("feed ended")
        .unwrap();
    (channel, delivery)
}

fn spawn_worker(
    broker: &MemoryBroker,
    compute: Arc<dyn Compute>,
) -> (Arc<RpcWorker>, CancellationToken) {
    let worker = Arc::new(RpcWorker::new(
        Arc::new(broker.clone()),
        DEFAULT_WORK_QUEUE,
        WorkerConfig::default(),
        compute,
    ));
    let shutdown = CancellationToken::new();
    let runner = Arc::clone(&worker);
    let token = shutdown.clone();
    tokio::spawn(async move { runner.run(token).await });
    (worker, shutdown)
}

async fn wait_for_consumer(broker: &MemoryBroker, consumers: usize) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while broker.consumer_count(DEFAULT_WORK_QUEUE) < consumers {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("worker never attached to the work queue");
}

/// A caller-side reply queue plus the channel that owns it.
struct Caller {
    channel: Arc<dyn BrokerChannel>,
    queue: QueueHandle,
    feed: DeliveryStream,
}

impl Caller {
    async fn new(broker: &MemoryBroker) -> Self {
        let channel = broker.open_channel().await.unwrap();
        let queue = channel
            .declare_queue("", QueueOptions::ephemeral())
            .await
            .unwrap();
        let feed = channel
            .consume(&queue, ConsumeOptions::auto_ack())
            .await
            .unwrap();
        Self {
            channel,
            queue,
            feed,
        }
    }

    async fn request(&self, payload: &str, correlation_id: &str) {
        let envelope = Envelope::new(payload.to_string())
            .with_correlation_id(correlation_id)
            .with_reply_to(self.queue.name());
        self.channel
            .publish(DEFAULT_EXCHANGE, DEFAULT_WORK_QUEUE, envelope)
            .await
            .unwrap();
    }

    async fn reply(&mut self) -> Envelope {
        tokio::time::timeout(Duration::from_secs(2), self.feed.next())
            .await
            .expect("Timed out waiting for reply")
            .expect("Reply feed ended")
            .expect("Delivery error")
            .envelope
    }
}

#[test]
fn test_fib_known_values() {
    assert_eq!(fib(0), 0);
    assert_eq!(fib(1), 1);
    assert_eq!(fib(10), 55);
    assert_eq!(fib(20), 6765);
}

#[test]
fn test_fib_matches_reference_up_to_twenty() {
    for n in 0..=20 {
        assert_eq!(Fibonacci.compute(n), fib_reference(n), "fib({})", n);
    }
}

#[test]
fn test_decode_rules() {
    let worker = RpcWorker::new(
        Arc::new(MemoryBroker::new()),
        DEFAULT_WORK_QUEUE,
        WorkerConfig::default(),
        Arc::new(Fibonacci),
    );

    let ok = Envelope::text(12)
        .with_reply_to("reply")
        .with_correlation_id("c");
    assert_eq!(
        worker.decode(&ok).unwrap(),
        Request {
            input: 12,
            reply_to: "reply".to_string(),
            correlation_id: Some("c".to_string()),
        }
    );

    let no_reply = Envelope::text(12);
    assert!(matches!(
        worker.decode(&no_reply),
        Err(WorkerError::MissingReplyTo)
    ));

    let garbage = Envelope::new("twelve").with_reply_to("reply");
    assert!(matches!(worker.decode(&garbage), Err(WorkerError::Decode(_))));

    let huge = Envelope::text(41).with_reply_to("reply");
    assert!(matches!(
        worker.decode(&huge),
        Err(WorkerError::InputOutOfRange { input: 41, max: 40 })
    ));
}

#[tokio::test]
async fn test_worker_replies_with_same_correlation_id() {
    let broker = MemoryBroker::new();
    let (_worker, shutdown) = spawn_worker(&broker, Arc::new(Fibonacci));
    wait_for_consumer(&broker, 1).await;

    let mut caller = Caller::new(&broker).await;
    caller.request("10", "corr-10").await;
    let reply = caller.reply().await;

    assert_eq!(&reply.payload[..], b"55");
    assert_eq!(reply.correlation_id.as_deref(), Some("corr-10"));
    assert_eq!(reply.content_type.as_deref(), Some(crate::broker::TEXT_PLAIN));
    shutdown.cancel();
}

#[tokio::test]
async fn test_malformed_request_is_skipped_not_fatal() {
    let broker = MemoryBroker::new();
    let (_worker, shutdown) = spawn_worker(&broker, Arc::new(Fibonacci));
    wait_for_consumer(&broker, 1).await;

    let mut caller = Caller::new(&broker).await;
    caller.request("not-a-number", "bad").await;
    caller.request("20", "good").await;
    let reply = caller.reply().await;

    assert_eq!(reply.correlation_id.as_deref(), Some("good"));
    assert_eq!(&reply.payload[..], b"6765");
    // Rejected without requeue: nothing left behind.
    assert_eq!(broker.queue_depth(DEFAULT_WORK_QUEUE), Some(0));
    shutdown.cancel();
}

#[tokio::test]
async fn test_prefetch_one_still_drains_queue() {
    let broker = MemoryBroker::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let (_worker, shutdown) = spawn_worker(
        &broker,
        Arc::new(CountingCompute {
            calls: Arc::clone(&calls),
        }),
    );
    wait_for_consumer(&broker, 1).await;

    let mut caller = Caller::new(&broker).await;
    for n in 0..5 {
        caller.request(&n.to_string(), &format!("c{}", n)).await;
    }
    for n in 0..5u64 {
        let reply = caller.reply().await;
        assert_eq!(reply.correlation_id, Some(format!("c{}", n)));
        assert_eq!(reply.payload, Bytes::from((n * 2).to_string()));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 5);
    shutdown.cancel();
}

#[tokio::test]
async fn test_competing_workers_process_each_request_once() {
    let broker = MemoryBroker::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut shutdowns = Vec::new();
    for _ in 0..3 {
        let compute = Arc::new(CountingCompute {
            calls: Arc::clone(&calls),
        });
        let (_worker, shutdown) = spawn_worker(&broker, compute);
        shutdowns.push(shutdown);
    }
    wait_for_consumer(&broker, 3).await;

    let mut caller = Caller::new(&broker).await;
    for n in 0..12 {
        caller.request(&n.to_string(), &n.to_string()).await;
    }
    let mut seen = Vec::new();
    for _ in 0..12 {
        seen.push(caller.reply().await.correlation_id.unwrap());
    }
    seen.sort_by_key(|id| id.parse::<u32>().unwrap());

    let expected: Vec<String> = (0..12).map(|n: u32| n.to_string()).collect();
    assert_eq!(seen, expected);
    assert_eq!(calls.load(Ordering::SeqCst), 12);
    for shutdown in shutdowns {
        shutdown.cancel();
    }
}

#[tokio::test]
async fn test_shutdown_moves_to_stopped() {
    let broker = MemoryBroker::new();
    let (worker, shutdown) = spawn_worker(&broker, Arc::new(Fibonacci));
    wait_for_consumer(&broker, 1).await;
    let mut state = worker.state();

    shutdown.cancel();

    tokio::time::timeout(
        Duration::from_secs(1),
        state.wait_for(|s| *s == WorkerState::Stopped),
    )
    .await
    .expect("worker did not stop")
    .unwrap();
    assert_eq!(broker.consumer_count(DEFAULT_WORK_QUEUE), 0);
}

#[tokio::test]
async fn test_startup_failure_is_fatal() {
    let broker = MemoryBroker::new();
    broker.close().await.unwrap();
    let worker = RpcWorker::new(
        Arc::new(broker),
        DEFAULT_WORK_QUEUE,
        WorkerConfig::default(),
        Arc::new(Fibonacci),
    );

    let result = worker.run(CancellationToken::new()).await;

    assert!(matches!(
        result,
        Err(WorkerError::Broker(BrokerError::Connection(_)))
    ));
    assert_eq!(*worker.state().borrow(), WorkerState::Stopped);
}

#[tokio::test]
async fn test_shutdown_during_compute_requeues_request() {
    let broker = MemoryBroker::new();
    let release = Arc::new(AtomicBool::new(false));
    let (worker, shutdown) = spawn_worker(
        &broker,
        Arc::new(StallingCompute {
            release: Arc::clone(&release),
        }),
    );
    wait_for_consumer(&broker, 1).await;

    let caller = Caller::new(&broker).await;
    caller.request("7", "slow").await;
    wait_for_state(&worker, WorkerState::Computing).await;

    let started = Instant::now();
    shutdown.cancel();
    let mut state = worker.state();
    tokio::time::timeout(
        Duration::from_secs(1),
        state.wait_for(|s| *s == WorkerState::Stopped),
    )
    .await
    .expect("worker ignored shutdown while computing")
    .unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(broker.queue_depth(DEFAULT_WORK_QUEUE), Some(1));
    let (_channel, delivery) = take_from_work_queue(&broker).await;
    assert!(delivery.redelivered);
    assert_eq!(&delivery.envelope.payload[..], b"7");
    assert_eq!(delivery.envelope.correlation_id.as_deref(), Some("slow"));
    delivery.ack().await.unwrap();
    release.store(true, Ordering::SeqCst);
}

#[tokio::test]
async fn test_failed_reply_leaves_request_for_another_worker() {
    let broker = MemoryBroker::new();
    let failed = CancellationToken::new();
    let first = Arc::new(RpcWorker::new(
        Arc::new(PublishFailingBroker {
            inner: broker.clone(),
            failed: failed.clone(),
        }),
        DEFAULT_WORK_QUEUE,
        WorkerConfig::default(),
        Arc::new(Fibonacci),
    ));
    // Stop the first worker as soon as its reply fails, so it cannot retry.
    let runner = Arc::clone(&first);
    let token = failed.clone();
    let first_run = tokio::spawn(async move { runner.run(token).await });
    wait_for_consumer(&broker, 1).await;

    let mut caller = Caller::new(&broker).await;
    caller.request("10", "corr-10").await;
    tokio::time::timeout(Duration::from_secs(1), failed.cancelled())
        .await
        .expect("reply was never attempted");
    wait_for_state(&first, WorkerState::Stopped).await;
    assert!(first_run.await.unwrap().is_ok());

    // Not acknowledged: the request went back to the queue, marked as seen.
    assert_eq!(broker.queue_depth(DEFAULT_WORK_QUEUE), Some(1));
    let (inspect, delivery) = take_from_work_queue(&broker).await;
    assert!(delivery.redelivered);
    delivery.reject(true).await.unwrap();
    inspect.close().await.unwrap();

    let (_second, shutdown) = spawn_worker(&broker, Arc::new(Fibonacci));
    let reply = caller.reply().await;

    assert_eq!(reply.correlation_id.as_deref(), Some("corr-10"));
    assert_eq!(&reply.payload[..], b"55");
    assert_eq!(broker.queue_depth(DEFAULT_WORK_QUEUE), Some(0));
    shutdown.cancel();
}
