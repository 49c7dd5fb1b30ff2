//! Kafka eventing data-plane process
//!
//! Watches the projected contract file and keeps the receiver and dispatcher
//! tables in sync with it until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use kafka_eventing_dataplane::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// Kafka eventing data plane
#[derive(Parser, Debug)]
#[command(name = "kafka-eventing-dataplane")]
#[command(about = "Watches the routing contract and fans it out to local components")]
#[command(version)]
struct Args {
    /// Path of the mounted contract file
    #[arg(long, env = "CONTRACT_PATH", default_value = "/etc/kafka-eventing/data")]
    contract_path: PathBuf,

    /// Local bus address for contract updates
    #[arg(long, env = "CONTRACT_ADDRESS", default_value = kafka_eventing_dataplane::CONTRACT_ADDRESS)]
    bus_address: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        contract = %args.contract_path.display(),
        "Starting Kafka eventing data plane"
    );

    let bus = Arc::new(ContractBus::new(args.bus_address));
    let receiver = Arc::new(Receiver::new());
    let dispatcher = Arc::new(Dispatcher::new());
    let receiver_task = spawn_receiver(Arc::clone(&receiver), bus.subscribe());
    let dispatcher_task = spawn_dispatcher(Arc::clone(&dispatcher), bus.subscribe());

    let watcher = ContractWatcher::new(FileSource::new(args.contract_path), Arc::clone(&bus));
    watcher.start().context("Failed to start contract watcher")?;

    shutdown_signal().await;
    info!("Shutdown signal received, draining");

    watcher.close().await;
    bus.close();
    let _ = tokio::join!(receiver_task, dispatcher_task);

    info!(
        routes = receiver.route_count(),
        consumers = dispatcher.consumer_count(),
        "Data plane stopped"
    );
    Ok(())
}

fn init_logging(args: &Args) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
