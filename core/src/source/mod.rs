pub mod broker;
pub mod consumer;
pub mod kafka;
pub mod unacked;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::Stream;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, oneshot};
use uuid::Uuid;

use crate::errors::SourceError;
use crate::source::broker::{BrokerFault, OpaqueEvent, Record, TopicPartition};

/// A delivered message, regardless of the broker it came from.
///
/// The id is generated per delivery, so a redelivered offset gets a new id.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: String,
    payload: Vec<u8>,
    timestamp: DateTime<Utc>,
    origin: Option<TopicPartition>,
    offset: Option<i64>,
}

impl Message {
    pub fn new(payload: Vec<u8>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
            timestamp,
            origin: None,
            offset: None,
        }
    }

    pub(crate) fn from_record(record: Record) -> Self {
        let timestamp = record
            .timestamp_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);
        Self {
            origin: Some(TopicPartition::new(record.topic, record.partition)),
            offset: Some(record.offset),
            ..Self::new(record.payload, timestamp)
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Topic and partition the message was read from, if known.
    pub fn origin(&self) -> Option<&TopicPartition> {
        self.origin.as_ref()
    }

    pub fn offset(&self) -> Option<i64> {
        self.offset
    }
}

/// Asynchronous notifications a source reports next to its messages.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    PartitionsAssigned(Vec<TopicPartition>),
    PartitionsRevoked(Vec<TopicPartition>),
    CommitError(BrokerFault),
    BrokerError(BrokerFault),
    Broker(OpaqueEvent),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |partitions: &[TopicPartition]| {
            partitions
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        match self {
            Event::PartitionsAssigned(p) => write!(f, "partitions assigned: {}", join(p)),
            Event::PartitionsRevoked(p) => write!(f, "partitions revoked: {}", join(p)),
            Event::CommitError(fault) => write!(f, "offset commit failed: {fault}"),
            Event::BrokerError(fault) => write!(f, "broker error: {fault}"),
            Event::Broker(other) => write!(f, "{}: {}", other.kind, other.detail),
        }
    }
}

/// One item on a source channel plus the receipt the reader fires when it
/// takes the item.
pub(crate) type Delivery<T> = (T, oneshot::Sender<()>);

/// Sending half of a handoff channel. The single slot only carries the item
/// currently offered; the sender waits on the receipt before offering the next.
pub(crate) type Outgoing<T> = mpsc::Sender<Delivery<T>>;

pub(crate) fn handoff<T>() -> (Outgoing<T>, Incoming<T>) {
    let (tx, rx) = mpsc::channel(1);
    (tx, Incoming::new(rx))
}

/// Receive side of a source channel. Clones share the same underlying
/// channel, each item is delivered to exactly one reader.
#[derive(Debug)]
pub struct Incoming<T> {
    rx: Arc<Mutex<mpsc::Receiver<Delivery<T>>>>,
}

impl<T> Clone for Incoming<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T> Incoming<T> {
    fn new(rx: mpsc::Receiver<Delivery<T>>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Returns `None` once the source has been closed and the channel drained.
    pub async fn recv(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        loop {
            let (item, receipt) = rx.recv().await?;
            // A failed receipt means the sender gave up on this item.
            if receipt.send(()).is_ok() {
                return Some(item);
            }
        }
    }

    pub fn try_recv(&self) -> Option<T> {
        let mut rx = self.rx.try_lock().ok()?;
        loop {
            let (item, receipt) = rx.try_recv().ok()?;
            if receipt.send(()).is_ok() {
                return Some(item);
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = T> {
        futures::stream::unfold(self, |incoming| async move {
            let item = incoming.recv().await?;
            Some((item, incoming))
        })
    }
}

/// Receive → process → ack/fail contract exposed to application code.
#[async_trait]
pub trait Source: Send + Sync {
    fn receive(&self) -> Incoming<Message>;

    fn events(&self) -> Incoming<Event>;

    fn ack(&self, message: &Message) -> Result<(), SourceError>;

    fn fail(&self, message: &Message) -> Result<(), SourceError>;

    fn unacked(&self) -> Vec<Message>;

    /// Stops new messages from being delivered. Must precede `close`.
    fn stop(&self) -> Result<(), SourceError>;

    async fn close(&self) -> Result<(), SourceError>;

    async fn ping(&self) -> Result<(), SourceError>;
}
