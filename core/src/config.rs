use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Process-wide configuration: broker connection options plus the defaults
/// that individual subscriptions start from.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumeConfig {
    pub broker: BrokerOptions,
    #[serde(default)]
    pub defaults: PipelineDefaults,
    pub subscription: SubscriptionConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerOptions {
    pub bootstrap_servers: String,
    pub security_protocol: Option<String>,
    pub sasl_mechanisms: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    pub auto_offset_reset: Option<String>,
    pub session_timeout_ms: Option<u32>,
    pub heartbeat_interval_ms: Option<u32>,
}

/// What one subscription consumes and as whom.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubscriptionConfig {
    pub group_id: String,
    pub topics: Vec<String>,
    /// Overrides the service name used to build the unique client id.
    pub client_name: Option<String>,
    /// Broker-specific properties forwarded verbatim to the client library.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// Process-wide defaults merged into each `PipelineConfig` at construction.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineDefaults {
    pub batch_size: usize,
    pub batch_interval_ms: u64,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub ack_timeout_ms: u64,
}

impl Default for PipelineDefaults {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_interval_ms: 5000,
            min_backoff_ms: 500,
            max_backoff_ms: 30000,
            ack_timeout_ms: 10000,
        }
    }
}

/// Immutable per-subscription configuration. Resolved once from the
/// process-wide defaults; each subscription owns its copy and never sees
/// later changes to the defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub group_id: String,
    pub topics: Vec<String>,
    pub client_name: Option<String>,
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub ack_timeout: Duration,
    pub properties: HashMap<String, String>,
}

static NEXT_CLIENT: AtomicU64 = AtomicU64::new(0);

impl PipelineConfig {
    pub fn new(group_id: impl Into<String>, topics: Vec<String>) -> Self {
        Self::resolve(
            &SubscriptionConfig {
                group_id: group_id.into(),
                topics,
                client_name: None,
                properties: HashMap::new(),
            },
            &PipelineDefaults::default(),
        )
    }

    pub fn resolve(subscription: &SubscriptionConfig, defaults: &PipelineDefaults) -> Self {
        Self {
            group_id: subscription.group_id.clone(),
            topics: subscription.topics.clone(),
            client_name: subscription.client_name.clone(),
            batch_size: defaults.batch_size,
            batch_interval: Duration::from_millis(defaults.batch_interval_ms),
            min_backoff: Duration::from_millis(defaults.min_backoff_ms),
            max_backoff: Duration::from_millis(defaults.max_backoff_ms),
            ack_timeout: Duration::from_millis(defaults.ack_timeout_ms),
            properties: subscription.properties.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.group_id.is_empty() {
            return Err(ConfigError::MissingField {
                field: "group_id".to_string(),
            });
        }
        if self.topics.is_empty() || self.topics.iter().any(|topic| topic.is_empty()) {
            return Err(ConfigError::Invalid {
                message: "at least one non-empty topic must be configured".to_string(),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                message: "batch_size must be greater than zero".to_string(),
            });
        }
        if self.min_backoff > self.max_backoff {
            return Err(ConfigError::Invalid {
                message: "min_backoff must not exceed max_backoff".to_string(),
            });
        }
        Ok(())
    }

    /// Builds a client identity unique within this process. The broker
    /// rejects duplicate client registrations, so every subscription gets its
    /// own suffix from a monotonically increasing counter.
    pub fn next_client_id(&self) -> String {
        let n = NEXT_CLIENT.fetch_add(1, Ordering::Relaxed);
        let service = self.client_name.as_deref().unwrap_or("consume");
        format!("{service}-{n}")
    }
}

pub async fn load_config(config_path: Option<&str>) -> anyhow::Result<ConsumeConfig> {
    match config_path {
        Some(path) => ConsumeConfig::from_file(path),
        None => ConsumeConfig::from_env(),
    }
}

impl ConsumeConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ConsumeConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let config_str = std::env::var("CONSUME_CONFIG")
            .map_err(|_| anyhow::anyhow!("CONSUME_CONFIG environment variable not set"))?;
        let config: ConsumeConfig = serde_yaml::from_str(&config_str)?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.broker.bootstrap_servers.is_empty() {
            return Err(anyhow::anyhow!("Broker bootstrap servers cannot be empty"));
        }
        PipelineConfig::resolve(&self.subscription, &self.defaults).validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yaml_config() {
        let yaml = r#"
broker:
  bootstrap_servers: "localhost:9092"
  auto_offset_reset: "earliest"
subscription:
  group_id: "audit-consumers"
  topics:
    - "audit-events"
  properties:
    fetch.min.bytes: "1024"
defaults:
  batch_size: 50
  ack_timeout_ms: 5000
"#;
        let config: ConsumeConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.subscription.group_id, "audit-consumers");
        assert_eq!(config.defaults.batch_size, 50);
        // unspecified defaults keep their built-in values
        assert_eq!(config.defaults.batch_interval_ms, 5000);

        let pipeline = PipelineConfig::resolve(&config.subscription, &config.defaults);
        assert_eq!(pipeline.ack_timeout, Duration::from_secs(5));
        assert_eq!(
            pipeline.properties.get("fetch.min.bytes").map(String::as_str),
            Some("1024")
        );
    }

    #[test]
    fn test_validate_rejects_empty_topics() {
        let config = PipelineConfig::new("group", vec![]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = PipelineConfig::new("group", vec!["events".to_string()]);
        config.min_backoff = Duration::from_secs(60);
        config.max_backoff = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_client_ids_are_unique() {
        let config = PipelineConfig::new("group", vec!["events".to_string()]);
        let first = config.next_client_id();
        let second = config.next_client_id();
        assert_ne!(first, second);
        assert!(first.starts_with("consume-"));
    }
}
