use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::batcher::OffsetBatcher;
use crate::broker::{BrokerSubscription, RawRecord};
use crate::config::PipelineConfig;
use crate::decode::{DecodeOutcome, Deserializer, FilterOutcome, TypeFilter, TypedPayload};
use crate::errors::PipelineError;
use crate::offset::{Envelope, Offset};
use crate::telemetry::PipelineMetrics;

/// Caller-supplied processing logic. Invoked once per matching message; must
/// return the offset it has taken responsibility for, or fail the pipeline.
/// Retries, if desired, are the stage's own business, as is tolerating the
/// duplicate deliveries inherent in at-least-once consumption.
#[async_trait]
pub trait ProcessingStage<T: TypedPayload>: Send + Sync + 'static {
    async fn process(&self, envelope: Envelope<T>) -> anyhow::Result<Offset>;
}

#[async_trait]
impl<T, F, Fut> ProcessingStage<T> for F
where
    T: TypedPayload,
    F: Fn(Envelope<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Offset>> + Send,
{
    async fn process(&self, envelope: Envelope<T>) -> anyhow::Result<Offset> {
        (self)(envelope).await
    }
}

/// One end-to-end dataflow: record source -> deserializer -> type filter ->
/// processing stage -> offset batcher.
///
/// Records are handled strictly in received order, one at a time, so
/// per-partition delivery order is broker order. The bounded channel into
/// the batcher backpressures the whole chain when commits fall behind.
pub struct ConsumptionStream<T: TypedPayload> {
    subscription: BrokerSubscription,
    stage: Arc<dyn ProcessingStage<T>>,
    config: PipelineConfig,
    runtime: Handle,
    metrics: Arc<PipelineMetrics>,
}

impl<T: TypedPayload> ConsumptionStream<T> {
    pub fn new(
        subscription: BrokerSubscription,
        stage: Arc<dyn ProcessingStage<T>>,
        config: PipelineConfig,
        runtime: Handle,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            subscription,
            stage,
            config,
            runtime,
            metrics,
        }
    }

    /// Drives the dataflow to completion. `started` fires once the broker
    /// confirms the subscription. Returns `Ok` only after a stop request has
    /// been honored and pending commits drained; every other exit is a
    /// failure for the supervisor to handle.
    pub async fn run(
        self,
        started: watch::Sender<bool>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), PipelineError> {
        let ConsumptionStream {
            subscription,
            stage,
            config,
            runtime,
            metrics,
        } = self;
        let BrokerSubscription {
            mut records,
            mut confirmed,
            committer,
        } = subscription;

        let filter = TypeFilter::<T>::new();
        let (offsets_tx, batcher) = OffsetBatcher::new(
            committer,
            config.batch_size,
            config.batch_interval,
            runtime.clone(),
            metrics.clone(),
        );
        let mut batcher_task = runtime.spawn(batcher.run());
        let mut confirmation_pending = true;
        let mut stop_observable = true;

        loop {
            tokio::select! {
                changed = confirmed.changed(), if confirmation_pending => {
                    match changed {
                        Ok(()) if *confirmed.borrow() => {
                            confirmation_pending = false;
                            let _ = started.send(true);
                            info!("Broker confirmed subscription; stream started");
                        }
                        Ok(()) => {}
                        // confirmation side dropped; nothing more to wait for
                        Err(_) => confirmation_pending = false,
                    }
                }
                changed = stop.changed(), if stop_observable => {
                    match changed {
                        Ok(()) if *stop.borrow() => {
                            info!("Stop requested; draining pipeline");
                            break;
                        }
                        Ok(()) => {}
                        // handle dropped without stopping; keep consuming
                        Err(_) => stop_observable = false,
                    }
                }
                joined = &mut batcher_task => {
                    // the batcher never exits first unless a commit failed
                    return Err(batcher_exit(joined));
                }
                received = records.next() => match received {
                    Some(Ok(record)) => {
                        if let Err(e) =
                            handle_record(record, &filter, stage.as_ref(), &offsets_tx, &metrics).await
                        {
                            batcher_task.abort();
                            return Err(e);
                        }
                    }
                    Some(Err(e)) => {
                        batcher_task.abort();
                        return Err(PipelineError::Broker(e));
                    }
                    None => {
                        batcher_task.abort();
                        return Err(PipelineError::SourceExhausted);
                    }
                },
            }
        }

        // cancel the subscription, then let the batcher flush and drain
        drop(records);
        drop(offsets_tx);
        match batcher_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Commit drain failed during shutdown: {}", e),
            Err(e) => warn!("Commit drain aborted during shutdown: {}", e),
        }
        Ok(())
    }
}

async fn handle_record<T: TypedPayload>(
    record: RawRecord,
    filter: &TypeFilter<T>,
    stage: &dyn ProcessingStage<T>,
    offsets: &mpsc::Sender<Offset>,
    metrics: &PipelineMetrics,
) -> Result<(), PipelineError> {
    metrics.incr_received();

    let envelope = match Deserializer::decode(record) {
        DecodeOutcome::Decoded(envelope) => envelope,
        DecodeOutcome::Skipped(offset) => {
            metrics.incr_decode_failures();
            return ack(offsets, offset).await;
        }
    };

    let envelope = match filter.filter(envelope) {
        FilterOutcome::Matched(envelope) => envelope,
        FilterOutcome::Skipped(offset) => {
            metrics.incr_type_skipped();
            return ack(offsets, offset).await;
        }
    };

    let offset = stage
        .process(envelope)
        .await
        .map_err(|e| PipelineError::Processing {
            reason: format!("{e:#}"),
        })?;
    metrics.incr_processed();
    ack(offsets, offset).await
}

async fn ack(offsets: &mpsc::Sender<Offset>, offset: Offset) -> Result<(), PipelineError> {
    offsets.send(offset).await.map_err(|_| PipelineError::Commit {
        reason: "offset batcher stopped accepting acknowledgements".to_string(),
    })
}

fn batcher_exit(
    joined: Result<Result<(), PipelineError>, tokio::task::JoinError>,
) -> PipelineError {
    match joined {
        Ok(Ok(())) => PipelineError::Commit {
            reason: "offset batcher exited early".to_string(),
        },
        Ok(Err(e)) => e,
        Err(e) => PipelineError::Commit {
            reason: format!("commit task aborted: {e}"),
        },
    }
}
