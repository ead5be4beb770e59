//! Publish each command line argument as a message.
//!
//! Usage: `simple_producer [config.toml] <payload>...`. Without a config file the producer targets
//! the `demo` topic on `localhost:9092`.

use anyhow::Context;
use kafka_producer::{Producer, ProducerConfig, ProducerOptions};
use tracing_subscriber::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error,kafka_producer=trace")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false) // Too verbose, so disable target.
                .with_level(true) // Shows tracing level: debug, info, error &c.
                .compact(),
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing tracing")?;

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config = match args.first() {
        Some(path) if path.ends_with(".toml") => {
            let config = ProducerConfig::from_path(path)?;
            args.remove(0);
            config
        }
        _ => ProducerConfig::new("demo", ProducerOptions::default()),
    };
    anyhow::ensure!(!args.is_empty(), "usage: simple_producer [config.toml] <payload>...");

    let producer = Producer::from_config(config)?;
    producer.connect().await.context("error connecting to broker")?;
    producer.send(args, None).await.context("error producing messages")?;
    tracing::info!(topic = producer.topic(), "messages sent");
    Ok(())
}
