use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::runtime::Handle;
use tracing::{info, warn};

use consume_core::broker::kafka::KafkaBroker;
use consume_core::{
    BrokerClient, ConsumeConfig, Envelope, PipelineConfig, SubscribeOutcome, TypedPayload,
    subscribe,
};

/// The event type this runner consumes. Other types sharing the topics are
/// skipped and acknowledged by the pipeline itself.
#[derive(Debug, Deserialize)]
struct AuditEvent {
    actor: String,
    action: String,
}

impl TypedPayload for AuditEvent {
    const TYPE_TAG: &'static str = "audit-event";
}

/// Entry point for running a long-lived consumer on container hosting
/// services like AWS EKS, ECS, etc. Loads config, subscribes, and consumes
/// until a shutdown signal arrives.
#[tokio::main]
async fn main() -> Result<()> {
    consume_core::telemetry::init_tracing();

    let config = ConsumeConfig::from_env().context("Failed to load CONSUME_CONFIG")?;
    config.validate().context("Invalid configuration")?;

    let broker = Arc::new(KafkaBroker::new(config.broker.clone()));
    broker
        .health_check()
        .await
        .context("Broker health check failed")?;

    let pipeline_config = PipelineConfig::resolve(&config.subscription, &config.defaults);
    let (outcome, handle) = subscribe(
        Handle::current(),
        broker,
        pipeline_config,
        |envelope: Envelope<AuditEvent>| async move {
            info!(
                actor = %envelope.payload.actor,
                action = %envelope.payload.action,
                "Handled audit event"
            );
            Ok(envelope.offset)
        },
    )
    .await?;

    match outcome {
        SubscribeOutcome::Acknowledged => info!("Subscription acknowledged, consuming"),
        SubscribeOutcome::TimedOut => {
            warn!("Subscription not acknowledged yet, consuming in background")
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received, stopping pipeline");

    handle.stop();
    handle.stopped().await;

    let report = handle.metrics();
    info!(
        "Final pipeline metrics: {}",
        serde_json::to_string(&report)?
    );
    Ok(())
}
