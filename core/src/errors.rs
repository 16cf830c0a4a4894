use thiserror::Error;

/// Failure that terminates one running pipeline instance.
///
/// Message-level problems (malformed payload, wrong type tag) never become a
/// `PipelineError`; they are converted into offset acknowledgements inside the
/// decode stage. Everything here is instance-fatal and handled by the
/// supervisor's restart policy.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Failed to commit offsets: {reason}")]
    Commit { reason: String },

    #[error("Processing stage failed: {reason}")]
    Processing { reason: String },

    #[error("Record source ended unexpectedly")]
    SourceExhausted,
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Failed to create consumer: {reason}")]
    ConsumerCreation { reason: String },

    #[error("Failed to subscribe to topics {topics:?}: {reason}")]
    Subscription { topics: Vec<String>, reason: String },

    #[error("Failed to receive records: {reason}")]
    Reception { reason: String },

    #[error("Failed to commit offsets: {reason}")]
    OffsetCommit { reason: String },

    #[error("Broker health check failed: {reason}")]
    HealthCheck { reason: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Failed to load configuration from {source}: {error}")]
    LoadFailed {
        source: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Whether the supervisor should schedule a restart after this failure.
    ///
    /// A bad configuration fails the same way on every attempt, so restarting
    /// on it would loop forever at max backoff.
    pub fn is_restartable(&self) -> bool {
        !matches!(self, PipelineError::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_errors_are_restartable() {
        let error = PipelineError::Broker(BrokerError::Reception {
            reason: "connection reset".to_string(),
        });
        assert!(error.is_restartable());

        let error = PipelineError::Commit {
            reason: "coordinator unavailable".to_string(),
        };
        assert!(error.is_restartable());
    }

    #[test]
    fn test_config_errors_are_not_restartable() {
        let error = PipelineError::Config(ConfigError::MissingField {
            field: "group_id".to_string(),
        });
        assert!(!error.is_restartable());
    }
}
