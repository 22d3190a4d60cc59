//! courier-log-server: Log subscriber
//!
//! Binds an exclusive queue to the fan-out log exchange and persists every
//! event it sees into the configured sink. Events published while it is
//! down are not replayed.

use clap::Parser;
use tracing::{error, info};

use courier::broker::init_broker;
use courier::config::Config;
use courier::logs::LogSubscriber;
use courier::sink::init_sink;
use courier::utils::bootstrap::{init_tracing, shutdown_on_ctrl_c};

#[derive(Parser)]
#[command(name = "courier-log-server", about = "Persist the fan-out log stream")]
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

    info!(exchange = %config.logs.exchange, "Starting courier-log-server");

    let broker = init_broker(&config.broker).await?;
    let sink = init_sink(&config.sink).await?;
    let subscriber = LogSubscriber::new(broker.clone(), config.logs, sink);

    info!("Log server running, press Ctrl+C to exit");
    let result = subscriber.run(shutdown_on_ctrl_c()).await;

    broker.close().await?;
    Ok(result?)
}
