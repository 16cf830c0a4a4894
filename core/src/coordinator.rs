use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::broker::BrokerClient;
use crate::config::PipelineConfig;
use crate::decode::TypedPayload;
use crate::errors::PipelineError;
use crate::stream::ProcessingStage;
use crate::supervisor::{PipelineState, SupervisedRunner};
use crate::telemetry::{MetricsSnapshot, PipelineMetrics};

/// Whether the broker confirmed the subscription within the acknowledge
/// timeout. A timeout is a caller-visible signal only; the pipeline keeps
/// running in the background either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Acknowledged,
    TimedOut,
}

/// Caller's handle to a running pipeline: lifecycle observation and
/// graceful shutdown. Dropping the handle leaves the pipeline running.
pub struct PipelineHandle {
    state: watch::Receiver<PipelineState>,
    stop: watch::Sender<bool>,
    metrics: Arc<PipelineMetrics>,
}

impl PipelineHandle {
    /// Requests graceful shutdown: the active subscription is cancelled,
    /// in-flight commits drain, and no further restart is scheduled.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Watch channel of lifecycle transitions, including each restart's
    /// cause, for monitoring.
    pub fn state(&self) -> watch::Receiver<PipelineState> {
        self.state.clone()
    }

    pub fn current_state(&self) -> PipelineState {
        self.state.borrow().clone()
    }

    /// Resolves once the runner has fully wound down.
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        loop {
            if *state.borrow() == PipelineState::Stopped {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

/// Starts a supervised pipeline for `config` and waits for either its first
/// transition to Running or the configured acknowledge timeout, whichever
/// resolves first. The loser of that race is left running: a timed-out
/// subscription still consumes in the background, and the returned handle
/// is the way to stop or observe it.
pub async fn subscribe<T: TypedPayload>(
    runtime: Handle,
    broker: Arc<dyn BrokerClient>,
    config: PipelineConfig,
    stage: impl ProcessingStage<T>,
) -> Result<(SubscribeOutcome, PipelineHandle), PipelineError> {
    config.validate()?;

    let client_id = config.next_client_id();
    let ack_timeout = config.ack_timeout;
    let metrics = Arc::new(PipelineMetrics::default());
    let (state_tx, state_rx) = watch::channel(PipelineState::Starting);
    let (stop_tx, stop_rx) = watch::channel(false);

    let runner = SupervisedRunner::new(
        broker,
        config,
        client_id.clone(),
        Arc::new(stage),
        runtime.clone(),
        state_tx,
        stop_rx,
        metrics.clone(),
    );
    runtime.spawn(runner.run());

    let mut state = state_rx.clone();
    let outcome = match timeout(ack_timeout, wait_running(&mut state)).await {
        Ok(()) => {
            info!(client_id = %client_id, "Subscription acknowledged");
            SubscribeOutcome::Acknowledged
        }
        Err(_) => {
            warn!(
                client_id = %client_id,
                timeout_ms = ack_timeout.as_millis() as u64,
                "Subscription not acknowledged in time; pipeline keeps running"
            );
            SubscribeOutcome::TimedOut
        }
    };

    Ok((
        outcome,
        PipelineHandle {
            state: state_rx,
            stop: stop_tx,
            metrics,
        },
    ))
}

async fn wait_running(state: &mut watch::Receiver<PipelineState>) {
    loop {
        if matches!(*state.borrow(), PipelineState::Running) {
            return;
        }
        if state.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
