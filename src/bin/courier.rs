//! courier: command-line front end
//!
//! Computes Fibonacci numbers on a remote worker, publishes log messages,
//! and reads the persisted log tail.
//!
//! With the in-memory broker there is no other process to talk to, so the
//! worker and log subscriber are started inside this process.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use courier::broker::{init_broker, Broker, BrokerType};
use courier::config::Config;
use courier::logs::{LogPublisher, LogSubscriber};
use courier::rpc::{decode_integer, RpcClient};
use courier::sink::{init_sink, LogSink, MAX_RECENT};
use courier::utils::bootstrap::{init_tracing, shutdown_on_ctrl_c};
use courier::worker::{Fibonacci, RpcWorker, WorkerState};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "courier", about = "RPC and fan-out logging over a message broker")]
struct Cli {
    /// YAML configuration file
    #[arg(long, short, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compute fib(n) on a worker
    Fib {
        /// Input, at most the worker's max_input
        n: u32,
    },
    /// Publish messages to the log exchange
    Log {
        /// One event per message
        #[arg(required = true)]
        messages: Vec<String>,
    },
    /// Show the most recent persisted log messages
    Logs {
        /// Records to show
        #[arg(long, default_value_t = MAX_RECENT)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_tracing();
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    match cli.command {
        Command::Fib { n } => cmd_fib(&config, n).await,
        Command::Log { messages } => cmd_log(&config, messages).await,
        Command::Logs { limit } => cmd_logs(&config, limit).await,
    }
}

fn embedded(config: &Config) -> bool {
    config.broker.broker_type == BrokerType::Memory
}

async fn cmd_fib(config: &Config, n: u32) -> Result<(), BoxError> {
    let broker = init_broker(&config.broker).await?;
    let shutdown = shutdown_on_ctrl_c();

    if embedded(config) {
        start_worker(config, Arc::clone(&broker), shutdown.clone()).await;
    }

    let client = RpcClient::new(Arc::clone(&broker), config.rpc.clone());
    let outcome = client.call_with_cancel(n.to_string(), shutdown.clone()).await;
    shutdown.cancel();
    broker.close().await?;

    let result = decode_integer(&outcome?)?;
    info!(n, result, "Computed");
    println!("fib({}) = {}", n, result);
    Ok(())
}

async fn start_worker(config: &Config, broker: Arc<dyn Broker>, shutdown: CancellationToken) {
    let worker = Arc::new(RpcWorker::new(
        broker,
        config.rpc.work_queue.clone(),
        config.worker.clone(),
        Arc::new(Fibonacci),
    ));
    let mut state = worker.state();

    let runner = Arc::clone(&worker);
    tokio::spawn(async move {
        if let Err(e) = runner.run(shutdown).await {
            error!(error = %e, "Embedded worker failed");
        }
    });

    // Requests published before the work queue exists are unroutable.
    let _ = state
        .wait_for(|s| matches!(s, WorkerState::Fetching | WorkerState::Stopped))
        .await;
}

async fn cmd_log(config: &Config, messages: Vec<String>) -> Result<(), BoxError> {
    let broker = init_broker(&config.broker).await?;

    let embedded_subscriber = if embedded(config) {
        let sink = init_sink(&config.sink).await?;
        let subscriber = Arc::new(LogSubscriber::new(
            Arc::clone(&broker),
            config.logs.clone(),
            sink,
        ));
        let shutdown = CancellationToken::new();
        let runner = Arc::clone(&subscriber);
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { runner.run(token).await });
        subscriber.ready().await;
        Some((shutdown, handle))
    } else {
        None
    };

    let publisher = LogPublisher::new(Arc::clone(&broker), config.logs.clone()).await?;
    let sent = publisher.publish_batch(messages).await?;
    publisher.close().await?;
    info!(count = sent, exchange = %config.logs.exchange, "Published log messages");

    if let Some((shutdown, handle)) = embedded_subscriber {
        shutdown.cancel();
        handle.await??;
    }
    broker.close().await?;
    Ok(())
}

async fn cmd_logs(config: &Config, limit: usize) -> Result<(), BoxError> {
    let sink: Arc<dyn LogSink> = init_sink(&config.sink).await?;
    let recent = sink.recent(limit).await?;

    println!(
        "showing {} of {} log messages",
        recent.records.len(),
        recent.total_count
    );
    for record in recent.records {
        println!("{}", record.message);
    }
    Ok(())
}
