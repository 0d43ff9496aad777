//! Command line entry point shared by worker binaries
//!
//! `run(MyWorker)` parses `MQ_CONFIG [-w WORKER_CONFIG]`, connects to the
//! broker and processes messages until SIGINT or SIGTERM.

use crate::broker::{BrokerLink, DeliveryHandler};
use crate::config::{BrokerConfig, WorkerConfig};
use crate::dispatch::{MessageDispatcher, Worker};
use crate::error::WorkerResult;
use crate::observability::metrics;
use crate::transport::{AmqpTransport, Transport};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

/// Worker command line
#[derive(Debug, Parser)]
#[command(version, about = "Consume and process messages from a worker queue")]
pub struct RunnerArgs {
    /// The message queue configuration file
    #[arg(value_name = "MQ_CONFIG")]
    pub mq_config: PathBuf,

    /// Optional path to a worker specific configuration file
    #[arg(short = 'w', long = "worker-config", value_name = "FILE")]
    pub worker_config: Option<PathBuf>,
}

/// Run `worker` with arguments from the process command line
pub async fn run<W: Worker>(worker: W) -> WorkerResult<()> {
    run_with_args(worker, RunnerArgs::parse()).await
}

pub async fn run_with_args<W: Worker>(worker: W, args: RunnerArgs) -> WorkerResult<()> {
    let broker_config = BrokerConfig::load_from_file(&args.mq_config)?;
    let worker_config = match &args.worker_config {
        Some(path) => {
            info!("Loading worker configuration from: {}", path.display());
            WorkerConfig::load_from_file(path)?
        }
        None => WorkerConfig::default(),
    };

    let dispatcher = MessageDispatcher::new(worker, worker_config);
    info!(
        "Connection params set as {}",
        broker_config.redacted_uri()
    );

    let transport = Arc::new(AmqpTransport::new(&broker_config)?);
    let link = BrokerLink::new(transport, dispatcher.queue_identity(), dispatcher.app_id());
    info!(queue = %link.queue(), "Starting worker {}", dispatcher.worker().name());

    serve(&link, &dispatcher).await
}

/// Drive `link` until it closes, turning SIGINT/SIGTERM into a shutdown request
pub async fn serve<T, H>(link: &BrokerLink<T>, handler: &H) -> WorkerResult<()>
where
    T: Transport,
    H: DeliveryHandler,
{
    let run = link.run_forever(handler);
    tokio::pin!(run);

    let result = tokio::select! {
        result = &mut run => result,
        received = shutdown_signal() => {
            info!("Received {}, shutting down gracefully...", received);
            link.request_shutdown();
            run.await
        }
    };

    match serde_json::to_string(&metrics().get_metrics()) {
        Ok(snapshot) => info!(metrics = %snapshot, "Worker stopped"),
        Err(e) => error!(error = %e, "Worker stopped; metrics snapshot unavailable"),
    }
    result
}

/// Resolves with the signal name once SIGINT or SIGTERM arrives
async fn shutdown_signal() -> &'static str {
    let signals = signal::unix::signal(signal::unix::SignalKind::interrupt()).and_then(|sigint| {
        signal::unix::signal(signal::unix::SignalKind::terminate()).map(|sigterm| (sigint, sigterm))
    });

    match signals {
        Ok((mut sigint, mut sigterm)) => tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        },
        Err(e) => {
            error!(error = %e, "Could not install signal handlers; stop the worker by closing its connection");
            std::future::pending().await
        }
    }
}
