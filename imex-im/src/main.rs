//! imex-im (Identifier Mapper) - Identifier substitution worker
//!
//! Wires the mapper stage: inbound image file queue, hashing swapper,
//! batched relay to the mapped-file exchange, health endpoint, and
//! fatal-driven shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

use imex_common::broker::InMemoryBroker;
use imex_common::config::load_options;
use imex_common::consumer::QueueConsumer;
use imex_common::messages::ProducerIdentity;
use imex_common::relay::BatchRelay;
use imex_common::{api, fatal_channel, FatalError, Producer};
use imex_im::config::IdentifierMapperOptions;
use imex_im::{HashingSwapper, IdentifierMapperConsumer};

const MODULE: &str = "imex-im";
const SOURCE_EXCHANGE: &str = "ExtractFileExchange";
const MAPPED_QUEUE: &str = "MappedImageFileQueue";

#[derive(Parser)]
#[command(name = "imex-im", version, about = "IMEX identifier mapper worker")]
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
        "Starting IMEX Identifier Mapper ({MODULE}) v{}",
        env!("CARGO_PKG_VERSION")
    );

    let args = Args::parse();
    let options: IdentifierMapperOptions = load_options(MODULE, args.config.as_deref())?;

    // Single-node topology on the embedded broker; a networked deployment
    // swaps in a broker client behind the same channel contract.
    let broker = InMemoryBroker::new();
    broker.declare_exchange(SOURCE_EXCHANGE);
    broker.declare_queue(&options.consumer.queue_name);
    broker.bind_queue(&options.consumer.queue_name, SOURCE_EXCHANGE, "extract.file.#")?;
    broker.declare_exchange(&options.producer.exchange_name);
    broker.declare_queue(MAPPED_QUEUE);
    broker.bind_queue(MAPPED_QUEUE, &options.producer.exchange_name, "extract.file.#")?;

    let (producer_hook, mut producer_faults) = fatal_channel("mapped-file-producer");
    let producer = Arc::new(Producer::new(
        broker.open_channel(),
        options.producer.clone(),
        ProducerIdentity::current(MODULE),
        producer_hook,
    )?);
    let relay = Arc::new(BatchRelay::new(Arc::clone(&producer), options.relay.clone()));
    let flush = relay.spawn_flush_task();

    let swapper = Arc::new(HashingSwapper::new(
        options.swapper.pseudonym_prefix.clone(),
    ));
    let (consumer_hook, mut consumer_faults) = fatal_channel("image-file-consumer");
    let consumer = QueueConsumer::new(
        broker.open_channel(),
        options.consumer.clone(),
        Arc::new(IdentifierMapperConsumer::new(
            swapper,
            Arc::clone(&relay),
            options.swapper.clone(),
        )),
        consumer_hook,
    )?;
    let consumer_handle = consumer.start().await?;

    let _health = tokio::spawn(api::serve_health(
        options.health_port,
        MODULE,
        env!("CARGO_PKG_VERSION"),
    ));

    let fault: Option<FatalError> = tokio::select! {
        fault = consumer_faults.recv() => fault,
        fault = producer_faults.recv() => fault,
        _ = tokio::signal::ctrl_c() => None,
    };

    // Supervised shutdown: stop consuming, then drain the relay so nothing
    // already accepted is stranded unpublished
    consumer_handle.stop().await;
    flush.stop().await;
    if let Err(e) = relay.flush().await {
        warn!(error = %e, "final relay drain failed");
    }

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
