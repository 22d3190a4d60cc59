//! courier-worker: Fibonacci RPC worker
//!
//! Consumes the shared work queue, replies to each caller's private reply
//! queue, and also runs a log subscriber that persists the fan-out log
//! stream into the configured sink. Run several instances to scale.
//!
//! ## Architecture
//! ```text
//! [rpc_queue] -> [courier-worker] -> [reply_to queue]
//! [logs exchange] -> [courier-worker] -> [Sink]
//! ```

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use courier::broker::init_broker;
use courier::config::Config;
use courier::logs::LogSubscriber;
use courier::sink::init_sink;
use courier::utils::bootstrap::{init_tracing, shutdown_on_ctrl_c};
use courier::worker::{Fibonacci, RpcWorker};

#[derive(Parser)]
#[command(name = "courier-worker", about = "Fibonacci RPC worker and log subscriber")]
struct Cli {
    /// YAML configuration file
    #[arg(long, short)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    info!("Starting courier-worker");

    let broker = init_broker(&config.broker).await?;
    let sink = init_sink(&config.sink).await?;
    let shutdown = shutdown_on_ctrl_c();

    let worker = RpcWorker::new(
        Arc::clone(&broker),
        config.rpc.work_queue.clone(),
        config.worker.clone(),
        Arc::new(Fibonacci),
    );
    let subscriber = LogSubscriber::new(Arc::clone(&broker), config.logs.clone(), sink);

    info!("Worker running, press Ctrl+C to exit");

    // Either task ending takes the other down with it.
    let (worker_result, subscriber_result) = tokio::join!(
        async {
            let result = worker.run(shutdown.clone()).await;
            shutdown.cancel();
            result
        },
        async {
            let result = subscriber.run(shutdown.clone()).await;
            shutdown.cancel();
            result
        },
    );

    broker.close().await?;
    worker_result?;
    subscriber_result?;
    Ok(())
}
