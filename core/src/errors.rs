use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Failed to load configuration from {path}: {error}")]
    FileLoad {
        path: String,
        #[source]
        error: std::io::Error,
    },

    #[error("Malformed configuration file {path}: {reason}")]
    FileFormat { path: String, reason: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// Failures reported by a broker client implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KafkaError {
    #[error("Failed to create consumer: {reason}")]
    ConsumerCreation { reason: String },

    #[error("Failed to subscribe to topics {topics:?}: {reason}")]
    Subscription { topics: Vec<String>, reason: String },

    #[error("Failed to fetch metadata for topic {topic}: {reason}")]
    Metadata { topic: String, reason: String },

    #[error("Partition assignment failed: {reason}")]
    Assignment { reason: String },

    #[error("Failed to close consumer: {reason}")]
    Close { reason: String },

    #[error("Consumer has been closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Unable to retrieve kafka metadata")]
    Connectivity {
        #[source]
        source: Box<SourceError>,
    },

    #[error("Topic {topic} is unavailable: {reason}")]
    TopicUnavailable { topic: String, reason: String },

    #[error("Stop() must be called before Close(); consume loop still running after {grace:?}")]
    StopNotCalled { grace: Duration },

    #[error("{count} unacknowledged messages remain")]
    UnackedMessagesRemain { count: usize },

    #[error("Message {id} is not tracked as unacknowledged")]
    NotFound { id: String },

    #[error("Source is already closed")]
    AlreadyClosed,

    #[error("Broker client error: {0}")]
    Client(#[from] KafkaError),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Whether the caller may sensibly repeat the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Config(_) => false,
            BridgeError::Source(SourceError::Connectivity { .. }) => true,
            BridgeError::Source(SourceError::TopicUnavailable { .. }) => true,
            BridgeError::Source(SourceError::UnackedMessagesRemain { .. }) => true,
            BridgeError::Source(SourceError::Client(_)) => true,
            BridgeError::Source(_) => false,
            BridgeError::Kafka(KafkaError::ConsumerCreation { .. } | KafkaError::Closed) => false,
            BridgeError::Kafka(_) => true,
        }
    }
}

impl SourceError {
    pub(crate) fn connectivity(cause: SourceError) -> Self {
        SourceError::Connectivity {
            source: Box::new(cause),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        let missing = BridgeError::from(ConfigError::MissingField {
            field: "kafka_brokers".to_string(),
        });
        assert!(!missing.is_retryable());

        let unacked = BridgeError::from(SourceError::UnackedMessagesRemain { count: 2 });
        assert!(unacked.is_retryable());

        let ordering = BridgeError::from(SourceError::StopNotCalled {
            grace: Duration::from_secs(3),
        });
        assert!(!ordering.is_retryable());

        let connectivity = BridgeError::from(SourceError::connectivity(
            SourceError::TopicUnavailable {
                topic: "orders".to_string(),
                reason: "no partitions".to_string(),
            },
        ));
        assert!(connectivity.is_retryable());

        assert!(!BridgeError::from(KafkaError::Closed).is_retryable());
    }

    #[test]
    fn test_connectivity_keeps_cause() {
        let err = SourceError::connectivity(SourceError::TopicUnavailable {
            topic: "orders".to_string(),
            reason: "no partitions".to_string(),
        });
        let cause = std::error::Error::source(&err).map(|e| e.to_string());
        assert_eq!(
            cause.as_deref(),
            Some("Topic orders is unavailable: no partitions")
        );
    }
}
