use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::broker::OffsetCommitter;
use crate::errors::PipelineError;
use crate::offset::{Offset, OffsetBatch};
use crate::telemetry::PipelineMetrics;

/// Upper bound on commits in flight at once. Further closed batches queue
/// behind the semaphore instead of spawning unbounded work.
pub const MAX_INFLIGHT_COMMITS: usize = 3;

/// Accumulates acknowledged offsets and commits them as bounded batches.
///
/// A batch closes when it reaches `batch_size` offsets or `batch_interval`
/// has elapsed since it opened, whichever comes first. Closed batches are
/// committed asynchronously, at most [`MAX_INFLIGHT_COMMITS`] at a time and
/// always issued in batch order, so per-partition committed offsets are
/// non-decreasing. Any commit failure terminates the batcher, and with it
/// the pipeline instance.
pub struct OffsetBatcher {
    rx: mpsc::Receiver<Offset>,
    committer: Arc<dyn OffsetCommitter>,
    batch_size: usize,
    batch_interval: Duration,
    runtime: Handle,
    metrics: Arc<PipelineMetrics>,
}

impl OffsetBatcher {
    /// Builds a batcher and the bounded sender feeding it. The channel bound
    /// is what backpressures the stream when commits fall behind.
    pub fn new(
        committer: Arc<dyn OffsetCommitter>,
        batch_size: usize,
        batch_interval: Duration,
        runtime: Handle,
        metrics: Arc<PipelineMetrics>,
    ) -> (mpsc::Sender<Offset>, Self) {
        let (tx, rx) = mpsc::channel(batch_size.max(16));
        (
            tx,
            Self {
                rx,
                committer,
                batch_size,
                batch_interval,
                runtime,
                metrics,
            },
        )
    }

    /// Runs until the offset channel closes, then flushes the open batch and
    /// drains in-flight commits.
    pub async fn run(mut self) -> Result<(), PipelineError> {
        let limiter = Arc::new(Semaphore::new(MAX_INFLIGHT_COMMITS));
        let mut inflight: JoinSet<Result<(), PipelineError>> = JoinSet::new();
        let mut batch = OffsetBatch::default();
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                received = self.rx.recv() => match received {
                    Some(offset) => {
                        if batch.is_empty() {
                            deadline = Some(Instant::now() + self.batch_interval);
                        }
                        batch.fold(offset);
                        if batch.folded() >= self.batch_size {
                            self.dispatch(&mut inflight, &limiter, std::mem::take(&mut batch)).await?;
                            deadline = None;
                        }
                    }
                    None => break,
                },
                _ = batch_timer(deadline) => {
                    if !batch.is_empty() {
                        self.dispatch(&mut inflight, &limiter, std::mem::take(&mut batch)).await?;
                    }
                    deadline = None;
                }
                Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                    commit_result(joined)?;
                }
            }
        }

        if !batch.is_empty() {
            self.dispatch(&mut inflight, &limiter, batch).await?;
        }
        while let Some(joined) = inflight.join_next().await {
            commit_result(joined)?;
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        inflight: &mut JoinSet<Result<(), PipelineError>>,
        limiter: &Arc<Semaphore>,
        batch: OffsetBatch,
    ) -> Result<(), PipelineError> {
        let permit = limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Commit {
                reason: "commit limiter closed".to_string(),
            })?;

        let committer = self.committer.clone();
        let metrics = self.metrics.clone();
        inflight.spawn_on(
            async move {
                let _permit = permit;
                let folded = batch.folded();
                committer
                    .commit(&batch)
                    .await
                    .map_err(|e| PipelineError::Commit {
                        reason: e.to_string(),
                    })?;
                metrics.record_commit(folded as u64);
                debug!(
                    offsets = folded,
                    partitions = batch.partition_count(),
                    "Committed offset batch"
                );
                Ok(())
            },
            &self.runtime,
        );
        Ok(())
    }
}

async fn batch_timer(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn commit_result(
    joined: Result<Result<(), PipelineError>, JoinError>,
) -> Result<(), PipelineError> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(PipelineError::Commit {
            reason: format!("commit task aborted: {e}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::time::advance;

    use crate::errors::BrokerError;

    #[derive(Default)]
    struct RecordingCommitter {
        commits: Mutex<Vec<(OffsetBatch, Instant)>>,
        fail: bool,
    }

    #[async_trait]
    impl OffsetCommitter for RecordingCommitter {
        async fn commit(&self, batch: &OffsetBatch) -> Result<(), BrokerError> {
            if self.fail {
                return Err(BrokerError::OffsetCommit {
                    reason: "broker unavailable".to_string(),
                });
            }
            self.commits
                .lock()
                .unwrap()
                .push((batch.clone(), Instant::now()));
            Ok(())
        }
    }

    fn spawn_batcher(
        committer: Arc<RecordingCommitter>,
        batch_size: usize,
        batch_interval: Duration,
    ) -> (
        mpsc::Sender<Offset>,
        tokio::task::JoinHandle<Result<(), PipelineError>>,
    ) {
        let (tx, batcher) = OffsetBatcher::new(
            committer,
            batch_size,
            batch_interval,
            Handle::current(),
            Arc::new(PipelineMetrics::default()),
        );
        (tx, tokio::spawn(batcher.run()))
    }

    async fn wait_for_commits(committer: &RecordingCommitter, count: usize) {
        for _ in 0..1000 {
            if committer.commits.lock().unwrap().len() >= count {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("expected {count} commit(s)");
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger_commits_without_waiting() {
        let committer = Arc::new(RecordingCommitter::default());
        let started = Instant::now();
        let (tx, task) = spawn_batcher(committer.clone(), 100, Duration::from_secs(5));

        for i in 0..100 {
            tx.send(Offset::new("events", 0, i)).await.unwrap();
        }
        wait_for_commits(&committer, 1).await;

        let commits = committer.commits.lock().unwrap();
        assert_eq!(commits.len(), 1);
        let (batch, at) = &commits[0];
        assert_eq!(batch.folded(), 100);
        // committed at once, not at the interval deadline
        assert_eq!(*at, started);
        drop(commits);

        drop(tx);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_trigger_commits_partial_batch() {
        let committer = Arc::new(RecordingCommitter::default());
        let started = Instant::now();
        let (tx, task) = spawn_batcher(committer.clone(), 100, Duration::from_secs(5));

        for i in 0..50 {
            tx.send(Offset::new("events", 0, i)).await.unwrap();
        }
        // let the batcher drain the channel before time moves
        tokio::task::yield_now().await;
        advance(Duration::from_secs(5)).await;
        wait_for_commits(&committer, 1).await;

        let commits = committer.commits.lock().unwrap();
        assert_eq!(commits.len(), 1);
        let (batch, at) = &commits[0];
        assert_eq!(batch.folded(), 50);
        assert!(*at >= started + Duration::from_secs(5));
        drop(commits);

        drop(tx);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_merges_to_highest_offset_per_partition() {
        let committer = Arc::new(RecordingCommitter::default());
        let (tx, task) = spawn_batcher(committer.clone(), 4, Duration::from_secs(5));

        tx.send(Offset::new("events", 0, 3)).await.unwrap();
        tx.send(Offset::new("events", 0, 4)).await.unwrap();
        tx.send(Offset::new("events", 1, 9)).await.unwrap();
        tx.send(Offset::new("events", 0, 5)).await.unwrap();
        wait_for_commits(&committer, 1).await;

        let commits = committer.commits.lock().unwrap();
        let (batch, _) = &commits[0];
        let mut marks: Vec<_> = batch.partitions().collect();
        marks.sort();
        assert_eq!(marks, vec![("events", 0, 5), ("events", 1, 9)]);
        drop(commits);

        drop(tx);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_remainder_flushes_on_close() {
        let committer = Arc::new(RecordingCommitter::default());
        let (tx, task) = spawn_batcher(committer.clone(), 100, Duration::from_secs(5));

        tx.send(Offset::new("events", 0, 1)).await.unwrap();
        drop(tx);

        task.await.unwrap().unwrap();
        assert_eq!(committer.commits.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_failure_is_fatal() {
        let committer = Arc::new(RecordingCommitter {
            fail: true,
            ..Default::default()
        });
        let (tx, task) = spawn_batcher(committer, 1, Duration::from_secs(5));

        tx.send(Offset::new("events", 0, 1)).await.unwrap();
        drop(tx);

        let result = task.await.unwrap();
        assert!(matches!(result, Err(PipelineError::Commit { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_sequence_is_non_decreasing_per_partition() {
        let committer = Arc::new(RecordingCommitter::default());
        let (tx, task) = spawn_batcher(committer.clone(), 2, Duration::from_secs(5));

        for i in 0..6 {
            tx.send(Offset::new("events", 0, i)).await.unwrap();
        }
        wait_for_commits(&committer, 3).await;

        let commits = committer.commits.lock().unwrap();
        let committed: Vec<i64> = commits
            .iter()
            .flat_map(|(batch, _)| batch.partitions().map(|(_, _, o)| o).collect::<Vec<_>>())
            .collect();
        assert!(committed.windows(2).all(|pair| pair[0] <= pair[1]));
        drop(commits);

        drop(tx);
        task.await.unwrap().unwrap();
    }
}
