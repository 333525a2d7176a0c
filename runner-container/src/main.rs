use anyhow::{Context, Result};
use bridge_core::config::Settings;
use bridge_core::source::Source;
use bridge_core::source::kafka::KafkaSource;
use bridge_core::telemetry::init_tracing;
use tracing::{error, info, warn};

/// Long-running consumer for container hosting (EKS, ECS, ...).
///
/// What it does at a high-level:
///     Load config from the environment (KAFKA_BROKERS, KAFKA_TOPICS, ...).
///     Main loop runs until a shutdown signal is received:
///         - receive messages and ack them
///         - log source events
///     On shutdown: stop, then close.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let settings = Settings::from_env();
    let source = KafkaSource::start(&settings)
        .await
        .context("Failed to start Kafka source")?;

    let messages = source.receive();
    let events = source.events();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            Some(message) = messages.recv() => {
                info!(id = message.id(), bytes = message.payload().len(), "Received message");
                source.ack(&message)?;
            }
            Some(event) = events.recv() => {
                warn!("Source event: {}", event);
            }
        }
    }

    source.stop()?;
    if let Err(e) = source.close().await {
        error!("Failed to close Kafka source: {}", e);
        return Err(e.into());
    }

    let metrics = serde_json::to_string(&source.metrics())?;
    info!("Kafka source closed. Final metrics: {}", metrics);
    Ok(())
}
