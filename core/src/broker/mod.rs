pub mod kafka;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::watch;

use crate::errors::BrokerError;
use crate::offset::{Offset, OffsetBatch};

/// A record as delivered by the broker, before deserialization.
pub struct RawRecord {
    pub offset: Offset,
    /// raw payload bytes e.g. kafka message body
    pub payload: Vec<u8>,
    /// Optional key/value headers for metadata.
    pub headers: HashMap<String, Vec<u8>>,
}

/// What one subscription asks the underlying client library for.
#[derive(Debug, Clone)]
pub struct SubscriptionSpec {
    pub group_id: String,
    pub topics: Vec<String>,
    pub client_id: String,
    /// Broker-specific properties, forwarded verbatim.
    pub properties: HashMap<String, String>,
}

pub type RecordStream = BoxStream<'static, Result<RawRecord, BrokerError>>;

/// A live subscription: the record source, a confirmation signal, and the
/// handle for committing progress back to the broker.
pub struct BrokerSubscription {
    pub records: RecordStream,
    /// Flips to true once the broker has confirmed the subscription is
    /// active (partitions assigned).
    pub confirmed: watch::Receiver<bool>,
    pub committer: Arc<dyn OffsetCommitter>,
}

/// The wire-level client the engine consumes. Group coordination, partition
/// assignment and network I/O all live behind this seam.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn subscribe(&self, spec: &SubscriptionSpec) -> Result<BrokerSubscription, BrokerError>;

    async fn health_check(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    /// Durably records the batch's per-partition high-water marks with the
    /// broker. A failure here is fatal to the pipeline instance.
    async fn commit(&self, batch: &OffsetBatch) -> Result<(), BrokerError>;
}
