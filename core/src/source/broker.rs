use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::errors::KafkaError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// A record as decoded by the broker client.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
    /// Broker timestamp in milliseconds since the epoch, when available.
    pub timestamp_ms: Option<i64>,
}

/// An error reported by the broker or the client library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerFault {
    pub code: Option<String>,
    pub message: String,
}

impl BrokerFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for BrokerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

/// Anything the client surfaces that has no dedicated variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueEvent {
    pub kind: String,
    pub detail: String,
}

/// Native event stream of a broker client, one variant per event kind.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    PartitionsAssigned(Vec<TopicPartition>),
    PartitionsRevoked(Vec<TopicPartition>),
    Message(Record),
    /// librdkafka only reports the partition number for end-of-partition.
    PartitionEof {
        topic: Option<String>,
        partition: i32,
    },
    OffsetsCommitted {
        offsets: Vec<TopicPartition>,
        error: Option<BrokerFault>,
    },
    Error(BrokerFault),
    Other(OpaqueEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMetadata {
    pub topic: String,
    pub error: Option<BrokerFault>,
    pub partitions: usize,
}

/// The broker capability a source consumes.
///
/// Implementations must tolerate `metadata` being called concurrently with
/// `next_event`. Everything else is driven by a single owner at a time.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    fn subscribe(&self, topics: &[String]) -> Result<(), KafkaError>;

    /// Waits for the next native event. `None` means the stream has ended.
    /// Must be cancel safe: dropping the future loses no event.
    async fn next_event(&self) -> Option<BrokerEvent>;

    fn assign(&self, partitions: &[TopicPartition]) -> Result<(), KafkaError>;

    fn unassign(&self) -> Result<(), KafkaError>;

    async fn metadata(&self, topic: &str, timeout: Duration) -> Result<TopicMetadata, KafkaError>;

    async fn close(&self) -> Result<(), KafkaError>;
}
