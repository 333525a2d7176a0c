use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::errors::KafkaError;
use crate::source::broker::{BrokerClient, BrokerEvent, TopicMetadata, TopicPartition};

/// Scripted broker client: tests push native events through the paired sender.
pub(crate) struct FakeBroker {
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<BrokerEvent>>,
    metadata: HashMap<String, Result<TopicMetadata, KafkaError>>,
    calls: Mutex<Vec<String>>,
    pub(crate) subscribed: Mutex<Vec<String>>,
    pub(crate) closed: AtomicBool,
    fail_assign: AtomicBool,
}

impl FakeBroker {
    pub(crate) fn new() -> (Self, mpsc::UnboundedSender<BrokerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let broker = Self {
            events: tokio::sync::Mutex::new(rx),
            metadata: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            subscribed: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_assign: AtomicBool::new(false),
        };
        (broker, tx)
    }

    pub(crate) fn with_topic(mut self, topic: &str, partitions: usize) -> Self {
        self.metadata.insert(
            topic.to_string(),
            Ok(TopicMetadata {
                topic: topic.to_string(),
                error: None,
                partitions,
            }),
        );
        self
    }

    pub(crate) fn with_metadata(
        mut self,
        topic: &str,
        metadata: Result<TopicMetadata, KafkaError>,
    ) -> Self {
        self.metadata.insert(topic.to_string(), metadata);
        self
    }

    pub(crate) fn failing_assign(self) -> Self {
        self.fail_assign.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl BrokerClient for FakeBroker {
    fn subscribe(&self, topics: &[String]) -> Result<(), KafkaError> {
        *self.subscribed.lock() = topics.to_vec();
        self.calls.lock().push("subscribe".to_string());
        Ok(())
    }

    async fn next_event(&self) -> Option<BrokerEvent> {
        self.events.lock().await.recv().await
    }

    fn assign(&self, partitions: &[TopicPartition]) -> Result<(), KafkaError> {
        self.calls.lock().push(format!("assign:{}", partitions.len()));
        if self.fail_assign.load(Ordering::SeqCst) {
            return Err(KafkaError::Assignment {
                reason: "injected".to_string(),
            });
        }
        Ok(())
    }

    fn unassign(&self) -> Result<(), KafkaError> {
        self.calls.lock().push("unassign".to_string());
        Ok(())
    }

    async fn metadata(&self, topic: &str, _timeout: Duration) -> Result<TopicMetadata, KafkaError> {
        self.calls.lock().push(format!("metadata:{topic}"));
        self.metadata
            .get(topic)
            .cloned()
            .unwrap_or_else(|| {
                Err(KafkaError::Metadata {
                    topic: topic.to_string(),
                    reason: "unknown topic".to_string(),
                })
            })
    }

    async fn close(&self) -> Result<(), KafkaError> {
        self.calls.lock().push("close".to_string());
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
