use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "consume_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Counters for one pipeline instance, shared across its stages and surviving
/// restarts. Readers take a `snapshot`.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    records_received: AtomicU64,
    decode_failures: AtomicU64,
    type_skipped: AtomicU64,
    processed: AtomicU64,
    batches_committed: AtomicU64,
    offsets_committed: AtomicU64,
    restarts: AtomicU64,
}

impl PipelineMetrics {
    pub(crate) fn incr_received(&self) {
        self.records_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_decode_failures(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_type_skipped(&self) {
        self.type_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self, offsets: u64) {
        self.batches_committed.fetch_add(1, Ordering::Relaxed);
        self.offsets_committed.fetch_add(offsets, Ordering::Relaxed);
    }

    pub(crate) fn incr_restarts(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            taken_at: Utc::now(),
            records_received: self.records_received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            type_skipped: self.type_skipped.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            offsets_committed: self.offsets_committed.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub records_received: u64,
    pub decode_failures: u64,
    pub type_skipped: u64,
    pub processed: u64,
    pub batches_committed: u64,
    pub offsets_committed: u64,
    pub restarts: u64,
}
