//! imex-cp (Cohort Packager) - Extraction job completion tracking
//!
//! Consumes extraction-request announcements and per-file status reports
//! into the SQLite job store, runs the completion watcher, and exits with a
//! logged reason when any component faults fatally.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use imex_common::broker::InMemoryBroker;
use imex_common::config::load_options;
use imex_common::consumer::QueueConsumer;
use imex_common::{api, fatal_channel, FatalError};
use imex_cp::config::CohortPackagerOptions;
use imex_cp::consumers::{FileStatusConsumer, RequestInfoConsumer};
use imex_cp::jobs::{ExtractJobStore, ExtractJobWatcher, LoggingNotifier, SqliteJobStore};

const MODULE: &str = "imex-cp";
const REQUEST_EXCHANGE: &str = "ExtractRequestExchange";
const FILE_STATUS_EXCHANGE: &str = "ExtractedFileStatusExchange";

#[derive(Parser)]
#[command(name = "imex-cp", version, about = "IMEX cohort packager worker")]
struct Args {
    /// Configuration file; falls back to IMEX_CONFIG_DIR, then the user
    /// config directory
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!(
        "Starting IMEX Cohort Packager ({MODULE}) v{}",
        env!("CARGO_PKG_VERSION")
    );

    let args = Args::parse();
    let options: CohortPackagerOptions = load_options(MODULE, args.config.as_deref())?;

    let store: Arc<dyn ExtractJobStore> =
        Arc::new(SqliteJobStore::open(&options.database_path).await?);
    info!("Job store: {}", options.database_path.display());

    // Single-node topology on the embedded broker; a networked deployment
    // swaps in a broker client behind the same channel contract.
    let broker = InMemoryBroker::new();
    broker.declare_exchange(REQUEST_EXCHANGE);
    broker.declare_exchange(FILE_STATUS_EXCHANGE);
    broker.declare_queue(&options.request_info_consumer.queue_name);
    broker.declare_queue(&options.file_status_consumer.queue_name);
    broker.bind_queue(
        &options.request_info_consumer.queue_name,
        REQUEST_EXCHANGE,
        "extract.request.#",
    )?;
    broker.bind_queue(
        &options.file_status_consumer.queue_name,
        FILE_STATUS_EXCHANGE,
        "extract.status.#",
    )?;

    let (request_hook, mut request_faults) = fatal_channel("request-info-consumer");
    let request_consumer = QueueConsumer::new(
        broker.open_channel(),
        options.request_info_consumer.clone(),
        Arc::new(RequestInfoConsumer::new(Arc::clone(&store))),
        request_hook,
    )?;
    let request_handle = request_consumer.start().await?;

    let (status_hook, mut status_faults) = fatal_channel("file-status-consumer");
    let status_consumer = QueueConsumer::new(
        broker.open_channel(),
        options.file_status_consumer.clone(),
        Arc::new(FileStatusConsumer::new(Arc::clone(&store))),
        status_hook,
    )?;
    let status_handle = status_consumer.start().await?;

    let (watcher_hook, mut watcher_faults) = fatal_channel("job-watcher");
    let watcher = ExtractJobWatcher::new(
        Arc::clone(&store),
        Arc::new(LoggingNotifier),
        options.job_watcher.clone(),
        watcher_hook,
    );
    watcher.start().await?;
    info!(
        "Job watcher polling every {} ms",
        options.job_watcher.poll_interval_ms
    );

    let _health = tokio::spawn(api::serve_health(
        options.health_port,
        MODULE,
        env!("CARGO_PKG_VERSION"),
    ));

    let fault: Option<FatalError> = tokio::select! {
        fault = request_faults.recv() => fault,
        fault = status_faults.recv() => fault,
        fault = watcher_faults.recv() => fault,
        _ = tokio::signal::ctrl_c() => None,
    };

    // Supervised shutdown: let the in-flight tick and deliveries finish
    watcher.stop("host shutting down").await;
    request_handle.stop().await;
    status_handle.stop().await;

    match fault {
        Some(fault) => {
            error!("exiting after fatal fault: {fault}");
            anyhow::bail!("fatal fault in {}", fault.component);
        }
        None => {
            info!("shutdown requested, exiting");
            Ok(())
        }
    }
}
