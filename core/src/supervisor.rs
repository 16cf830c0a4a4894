use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use tracing::{error, info, warn};

use crate::broker::{BrokerClient, SubscriptionSpec};
use crate::config::PipelineConfig;
use crate::decode::TypedPayload;
use crate::errors::PipelineError;
use crate::stream::{ConsumptionStream, ProcessingStage};
use crate::telemetry::PipelineMetrics;

/// Pipeline lifecycle as observed through the state channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineState {
    Starting,
    Running,
    Restarting { attempt: u32, cause: String },
    Stopped,
}

/// How long an instance must stay running before the restart counter resets.
/// Short-lived successes keep escalating the delay; one sustained healthy
/// run forgives the history.
const HEALTHY_RESET_AFTER: Duration = Duration::from_secs(60);

/// Owns one live [`ConsumptionStream`] at a time inside a restart policy:
/// on failure the instance is fully torn down and a fresh one is built after
/// an exponentially growing, jittered delay. A stop request wins in every
/// state, including mid-delay, and never schedules another restart.
pub struct SupervisedRunner<T: TypedPayload> {
    broker: Arc<dyn BrokerClient>,
    config: PipelineConfig,
    client_id: String,
    stage: Arc<dyn ProcessingStage<T>>,
    runtime: Handle,
    state: watch::Sender<PipelineState>,
    stop: watch::Receiver<bool>,
    metrics: Arc<PipelineMetrics>,
}

enum InstanceExit {
    Stopped,
    Failed {
        error: PipelineError,
        healthy_for: Duration,
    },
}

impl<T: TypedPayload> SupervisedRunner<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        broker: Arc<dyn BrokerClient>,
        config: PipelineConfig,
        client_id: String,
        stage: Arc<dyn ProcessingStage<T>>,
        runtime: Handle,
        state: watch::Sender<PipelineState>,
        stop: watch::Receiver<bool>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            broker,
            config,
            client_id,
            stage,
            runtime,
            state,
            stop,
            metrics,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            self.state.send_replace(PipelineState::Starting);

            match self.run_instance().await {
                InstanceExit::Stopped => break,
                InstanceExit::Failed { error, healthy_for } => {
                    if !error.is_restartable() {
                        error!("Pipeline failed without a restart path: {}", error);
                        break;
                    }
                    if healthy_for >= HEALTHY_RESET_AFTER {
                        attempt = 0;
                    }

                    let delay =
                        restart_delay(self.config.min_backoff, self.config.max_backoff, attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Pipeline failed, restarting after backoff: {}",
                        error
                    );
                    self.metrics.incr_restarts();
                    self.state.send_replace(PipelineState::Restarting {
                        attempt,
                        cause: error.to_string(),
                    });
                    attempt = attempt.saturating_add(1);

                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = wait_stop(&mut self.stop) => break,
                    }
                }
            }

            if *self.stop.borrow() {
                break;
            }
        }

        self.state.send_replace(PipelineState::Stopped);
        info!("Pipeline stopped");
    }

    /// Builds and drives one stream instance to its exit. The prior instance
    /// is fully discarded before this is called again; only the restart
    /// counter survives across instances.
    async fn run_instance(&mut self) -> InstanceExit {
        let spec = SubscriptionSpec {
            group_id: self.config.group_id.clone(),
            topics: self.config.topics.clone(),
            client_id: self.client_id.clone(),
            properties: self.config.properties.clone(),
        };

        let subscription = tokio::select! {
            result = self.broker.subscribe(&spec) => match result {
                Ok(subscription) => subscription,
                Err(e) => {
                    return InstanceExit::Failed {
                        error: PipelineError::Broker(e),
                        healthy_for: Duration::ZERO,
                    };
                }
            },
            _ = wait_stop(&mut self.stop) => return InstanceExit::Stopped,
        };

        let stream = ConsumptionStream::new(
            subscription,
            self.stage.clone(),
            self.config.clone(),
            self.runtime.clone(),
            self.metrics.clone(),
        );
        let (started_tx, mut started_rx) = watch::channel(false);
        let mut task = self
            .runtime
            .spawn(stream.run(started_tx, self.stop.clone()));

        let mut running_since: Option<Instant> = None;
        let mut start_observable = true;

        loop {
            tokio::select! {
                changed = started_rx.changed(), if start_observable => {
                    match changed {
                        Ok(()) if *started_rx.borrow() => {
                            start_observable = false;
                            running_since = Some(Instant::now());
                            self.state.send_replace(PipelineState::Running);
                        }
                        Ok(()) => {}
                        Err(_) => start_observable = false,
                    }
                }
                joined = &mut task => {
                    let healthy_for = running_since
                        .map(|since| since.elapsed())
                        .unwrap_or(Duration::ZERO);
                    let stopped = *self.stop.borrow();

                    return match joined {
                        Ok(Ok(())) if stopped => InstanceExit::Stopped,
                        Ok(Ok(())) => InstanceExit::Failed {
                            error: PipelineError::SourceExhausted,
                            healthy_for,
                        },
                        Ok(Err(error)) if stopped => {
                            warn!("Pipeline failed while stopping: {}", error);
                            InstanceExit::Stopped
                        }
                        Ok(Err(error)) => InstanceExit::Failed { error, healthy_for },
                        Err(e) => InstanceExit::Failed {
                            error: PipelineError::Processing {
                                reason: format!("pipeline task panicked: {e}"),
                            },
                            healthy_for,
                        },
                    };
                }
            }
        }
    }
}

/// Resolves once a stop has been requested; never resolves if the handle was
/// dropped without one.
async fn wait_stop(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow() {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Exponential backoff bounded by `max`, with ±20% uniform jitter so a herd
/// of pipelines does not reconnect in lockstep.
fn restart_delay(min: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = min.saturating_mul(2u32.saturating_pow(attempt)).min(max);
    let jittered = exp.mul_f64(rand::thread_rng().gen_range(0.8..=1.2));
    jittered.min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_delay_grows_exponentially_within_jitter_band() {
        let min = Duration::from_millis(500);
        let max = Duration::from_secs(30);

        for attempt in 0..6 {
            let expected = min * 2u32.pow(attempt);
            let delay = restart_delay(min, max, attempt);
            assert!(delay >= expected.mul_f64(0.8), "attempt {attempt}: {delay:?}");
            assert!(delay <= expected.mul_f64(1.2), "attempt {attempt}: {delay:?}");
        }
    }

    #[test]
    fn test_restart_delay_never_exceeds_max() {
        let min = Duration::from_millis(500);
        let max = Duration::from_secs(30);

        for attempt in 0..64 {
            assert!(restart_delay(min, max, attempt) <= max);
        }
    }

    #[test]
    fn test_restart_delay_saturates_on_huge_attempts() {
        let min = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        assert!(restart_delay(min, max, u32::MAX) <= max);
    }
}
