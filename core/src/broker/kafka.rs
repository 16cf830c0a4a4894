use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::ClientConfig;
use rdkafka::client::ClientContext;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::TopicPartitionList;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broker::{
    BrokerClient, BrokerSubscription, OffsetCommitter, RawRecord, SubscriptionSpec,
};
use crate::config::BrokerOptions;
use crate::errors::BrokerError;
use crate::offset::{Offset, OffsetBatch};

/// Kafka binding of the broker seam, built on rdkafka's `StreamConsumer`.
///
/// Commits are always manual (`enable.auto.commit=false`); the engine's
/// offset batcher decides when progress is durable.
pub struct KafkaBroker {
    options: BrokerOptions,
}

impl KafkaBroker {
    pub fn new(options: BrokerOptions) -> Self {
        Self { options }
    }

    fn base_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &self.options.bootstrap_servers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set(
                "auto.offset.reset",
                self.options.auto_offset_reset.as_deref().unwrap_or("earliest"),
            );

        if let Some(timeout) = self.options.session_timeout_ms {
            client_config.set("session.timeout.ms", timeout.to_string());
        }

        if let Some(heartbeat) = self.options.heartbeat_interval_ms {
            client_config.set("heartbeat.interval.ms", heartbeat.to_string());
        }

        if let Some(security_protocol) = &self.options.security_protocol {
            client_config.set("security.protocol", security_protocol);
        }

        if let Some(sasl_mechanisms) = &self.options.sasl_mechanisms {
            client_config.set("sasl.mechanisms", sasl_mechanisms);
        }

        if let Some(sasl_username) = &self.options.sasl_username {
            client_config.set("sasl.username", sasl_username);
        }

        if let Some(sasl_password) = &self.options.sasl_password {
            client_config.set("sasl.password", sasl_password);
        }

        if let Some(ssl_ca_location) = &self.options.ssl_ca_location {
            client_config.set("ssl.ca.location", ssl_ca_location);
        }

        client_config
    }
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    async fn subscribe(&self, spec: &SubscriptionSpec) -> Result<BrokerSubscription, BrokerError> {
        let mut client_config = self.base_config();
        client_config
            .set("group.id", &spec.group_id)
            .set("client.id", &spec.client_id)
            .set("enable.auto.commit", "false");

        for (key, value) in &spec.properties {
            client_config.set(key, value);
        }

        let (confirmed_tx, confirmed_rx) = watch::channel(false);
        let consumer: StreamConsumer<AssignmentContext> = client_config
            .create_with_context(AssignmentContext {
                confirmed: confirmed_tx,
            })
            .map_err(|e| BrokerError::ConsumerCreation {
                reason: e.to_string(),
            })?;

        let topics: Vec<&str> = spec.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| BrokerError::Subscription {
                topics: spec.topics.clone(),
                reason: e.to_string(),
            })?;

        info!(
            group_id = %spec.group_id,
            client_id = %spec.client_id,
            "Subscribed to Kafka topics: {:?}",
            spec.topics
        );

        let consumer = Arc::new(consumer);
        let committer = Arc::new(KafkaCommitter {
            consumer: consumer.clone(),
        });

        let records = futures::stream::unfold(consumer, |consumer| async move {
            let item = match consumer.recv().await {
                Ok(message) => Ok(convert_record(&message)),
                Err(e) => Err(BrokerError::Reception {
                    reason: e.to_string(),
                }),
            };
            Some((item, consumer))
        })
        .boxed();

        Ok(BrokerSubscription {
            records,
            confirmed: confirmed_rx,
            committer,
        })
    }

    async fn health_check(&self) -> Result<(), BrokerError> {
        let client_config = self.base_config();
        tokio::task::spawn_blocking(move || {
            let consumer: BaseConsumer =
                client_config
                    .create()
                    .map_err(|e| BrokerError::HealthCheck {
                        reason: e.to_string(),
                    })?;

            let metadata = consumer
                .fetch_metadata(None, Duration::from_secs(10))
                .map_err(|e| BrokerError::HealthCheck {
                    reason: e.to_string(),
                })?;

            if metadata.brokers().is_empty() {
                return Err(BrokerError::HealthCheck {
                    reason: "no brokers in cluster metadata".to_string(),
                });
            }

            info!(
                "Health check passed, cluster reports {} broker(s)",
                metadata.brokers().len()
            );
            Ok(())
        })
        .await
        .map_err(|e| BrokerError::HealthCheck {
            reason: e.to_string(),
        })?
    }
}

/// Consumer context that flips the confirmation signal on the first
/// partition assignment.
struct AssignmentContext {
    confirmed: watch::Sender<bool>,
}

impl ClientContext for AssignmentContext {}

impl ConsumerContext for AssignmentContext {
    fn post_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(tpl) if tpl.count() > 0 => {
                info!("Partitions assigned: {}", tpl.count());
                let _ = self.confirmed.send(true);
            }
            Rebalance::Assign(_) => {}
            Rebalance::Revoke(tpl) => {
                debug!("Partitions revoked: {}", tpl.count());
            }
            Rebalance::Error(e) => {
                warn!("Rebalance error: {}", e);
            }
        }
    }
}

struct KafkaCommitter {
    consumer: Arc<StreamConsumer<AssignmentContext>>,
}

#[async_trait]
impl OffsetCommitter for KafkaCommitter {
    async fn commit(&self, batch: &OffsetBatch) -> Result<(), BrokerError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tpl = TopicPartitionList::new();
        for (topic, partition, offset) in batch.partitions() {
            // the broker expects the next offset to consume, not the last handled one
            tpl.add_partition_offset(topic, partition, rdkafka::Offset::Offset(offset + 1))
                .map_err(|e| BrokerError::OffsetCommit {
                    reason: e.to_string(),
                })?;
        }

        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| BrokerError::OffsetCommit {
                reason: e.to_string(),
            })?;

        debug!(
            "Committed {} partition offset(s) across {} acknowledgement(s)",
            batch.partition_count(),
            batch.folded()
        );

        Ok(())
    }
}

fn convert_record(message: &BorrowedMessage<'_>) -> RawRecord {
    let mut headers = HashMap::new();
    if let Some(header_map) = message.headers() {
        for header in header_map.iter() {
            if let Some(value) = header.value {
                headers.insert(header.key.to_string(), value.to_vec());
            }
        }
    }

    RawRecord {
        offset: Offset::new(message.topic(), message.partition(), message.offset()),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
    }
}
