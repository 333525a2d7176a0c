use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::client::ClientContext;
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError as RdKafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{ClientConfig, TopicPartitionList};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::{
    APPLICATION_REBALANCE_ENABLE, BrokerConfig, EVENTS_CHANNEL_ENABLE, EVENTS_CHANNEL_SIZE,
};
use crate::errors::KafkaError;
use crate::source::broker::{
    BrokerClient, BrokerEvent, BrokerFault, Record, TopicMetadata, TopicPartition,
};

const DEFAULT_EVENT_QUEUE: usize = 100;

/// Fault code of the error reported after side events were dropped.
pub const EVENT_QUEUE_OVERFLOW: &str = "EventQueueOverflow";

/// Rebalance notifications numbered in the order librdkafka applied them.
#[derive(Debug, Default)]
struct RebalanceLog {
    epoch: u64,
    queued: VecDeque<u64>,
}

/// Forwards librdkafka callbacks into the client's side-event queue.
///
/// Rebalances are applied by librdkafka inside its handler. Revocations are
/// reported before they take effect, assignments after.
pub struct EventContext {
    side_events: mpsc::Sender<BrokerEvent>,
    commit_events: bool,
    rebalance_events: bool,
    rebalances: Mutex<RebalanceLog>,
    dropped: AtomicU64,
}

impl EventContext {
    fn new(
        queue_size: usize,
        commit_events: bool,
        rebalance_events: bool,
    ) -> (Self, mpsc::Receiver<BrokerEvent>) {
        let (tx, rx) = mpsc::channel(queue_size);
        let context = Self {
            side_events: tx,
            commit_events,
            rebalance_events,
            rebalances: Mutex::new(RebalanceLog::default()),
            dropped: AtomicU64::new(0),
        };
        (context, rx)
    }

    /// Never blocks: librdkafka calls this from its poll path.
    fn push(&self, event: BrokerEvent) -> bool {
        match self.side_events.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                error!("Broker event dropped: {}", e);
                false
            }
        }
    }

    fn report_rebalance(&self, event: BrokerEvent) {
        let mut log = self.rebalances.lock();
        log.epoch += 1;
        let epoch = log.epoch;
        if self.push(event) {
            log.queued.push_back(epoch);
        }
    }

    /// Consumes the oldest queued rebalance. Returns false when a later
    /// rebalance has been applied since, so acting on it would undo that one.
    fn settle_rebalance(&self) -> bool {
        let mut log = self.rebalances.lock();
        match log.queued.pop_front() {
            Some(epoch) => epoch == log.epoch,
            None => true,
        }
    }

    fn take_overflow(&self) -> Option<BrokerEvent> {
        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        (dropped > 0).then(|| {
            BrokerEvent::Error(BrokerFault {
                code: Some(EVENT_QUEUE_OVERFLOW.to_string()),
                message: format!("{dropped} broker events dropped, event queue full"),
            })
        })
    }
}

impl ClientContext for EventContext {}

impl ConsumerContext for EventContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) if self.rebalance_events && tpl.count() > 0 => {
                self.report_rebalance(BrokerEvent::PartitionsRevoked(partitions_of(tpl)));
            }
            Rebalance::Error(e) => {
                error!("Consumer group rebalance failed: {}", e);
                self.push(BrokerEvent::Error(BrokerFault::new(e.to_string())));
            }
            _ => {}
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(tpl) = rebalance {
            if self.rebalance_events {
                self.report_rebalance(BrokerEvent::PartitionsAssigned(partitions_of(tpl)));
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        if !self.commit_events {
            return;
        }
        self.push(BrokerEvent::OffsetsCommitted {
            offsets: partitions_of(offsets),
            error: result.err().map(fault_from),
        });
    }
}

type Handle = Arc<StreamConsumer<EventContext>>;

/// [`BrokerClient`] backed by an rdkafka `StreamConsumer`.
///
/// Messages and errors come from the consumer stream. Commit results and
/// rebalances arrive through [`EventContext`].
pub struct KafkaConsumerClient {
    consumer: Mutex<Option<Handle>>,
    side_events: tokio::sync::Mutex<mpsc::Receiver<BrokerEvent>>,
}

impl KafkaConsumerClient {
    /// Creates the consumer. Adapter-local keys are consumed here and never
    /// reach librdkafka.
    pub fn new(config: &BrokerConfig) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        let mut events_enabled = true;
        let mut rebalance_events = true;
        let mut queue_size = DEFAULT_EVENT_QUEUE;

        for (key, value) in config.iter() {
            match key.as_str() {
                EVENTS_CHANNEL_ENABLE => events_enabled = value.as_bool().unwrap_or(true),
                APPLICATION_REBALANCE_ENABLE => {
                    rebalance_events = value.as_bool().unwrap_or(true)
                }
                EVENTS_CHANNEL_SIZE => {
                    queue_size = value
                        .as_int()
                        .filter(|size| *size > 0)
                        .map(|size| size as usize)
                        .unwrap_or(DEFAULT_EVENT_QUEUE)
                }
                _ => {
                    client_config.set(key, value.to_string());
                }
            }
        }

        let (context, side_events) =
            EventContext::new(queue_size, events_enabled, rebalance_events && events_enabled);

        let consumer: StreamConsumer<EventContext> = client_config
            .create_with_context(context)
            .map_err(|e| KafkaError::ConsumerCreation {
                reason: e.to_string(),
            })?;

        Ok(Self {
            consumer: Mutex::new(Some(Arc::new(consumer))),
            side_events: tokio::sync::Mutex::new(side_events),
        })
    }

    fn consumer(&self) -> Result<Handle, KafkaError> {
        self.consumer.lock().clone().ok_or(KafkaError::Closed)
    }
}

fn assignment_failed(error: RdKafkaError) -> KafkaError {
    KafkaError::Assignment {
        reason: error.to_string(),
    }
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|e| TopicPartition::new(e.topic(), e.partition()))
        .collect()
}

fn fault_from(error: RdKafkaError) -> BrokerFault {
    BrokerFault {
        code: error.rdkafka_error_code().map(|code| format!("{code:?}")),
        message: error.to_string(),
    }
}

fn to_event(received: KafkaResult<BorrowedMessage<'_>>) -> BrokerEvent {
    match received {
        Ok(message) => BrokerEvent::Message(Record {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            timestamp_ms: message.timestamp().to_millis(),
        }),
        Err(RdKafkaError::PartitionEOF(partition)) => BrokerEvent::PartitionEof {
            topic: None,
            partition,
        },
        Err(e) => BrokerEvent::Error(fault_from(e)),
    }
}

fn to_tpl(partitions: &[TopicPartition]) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for p in partitions {
        tpl.add_partition(&p.topic, p.partition);
    }
    tpl
}

#[async_trait]
impl BrokerClient for KafkaConsumerClient {
    fn subscribe(&self, topics: &[String]) -> Result<(), KafkaError> {
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer()?
            .subscribe(&names)
            .map_err(|e| KafkaError::Subscription {
                topics: topics.to_vec(),
                reason: e.to_string(),
            })?;

        info!("Subscribed to Kafka topics: {}", topics.join(", "));
        Ok(())
    }

    /// Ends once the client is closed.
    async fn next_event(&self) -> Option<BrokerEvent> {
        let consumer = self.consumer().ok()?;
        if let Some(overflow) = consumer.context().take_overflow() {
            return Some(overflow);
        }

        let mut side_events = self.side_events.lock().await;
        tokio::select! {
            biased;
            Some(event) = side_events.recv() => Some(event),
            received = consumer.recv() => Some(to_event(received)),
        }
    }

    /// Makes `partitions` the whole assignment unless it already is, or a
    /// later rebalance has replaced it.
    fn assign(&self, partitions: &[TopicPartition]) -> Result<(), KafkaError> {
        let consumer = self.consumer()?;
        if !consumer.context().settle_rebalance() {
            debug!("Assignment superseded by a later rebalance");
            return Ok(());
        }

        let wanted: BTreeSet<TopicPartition> = partitions.iter().cloned().collect();
        let current: BTreeSet<TopicPartition> =
            partitions_of(&consumer.assignment().map_err(assignment_failed)?)
                .into_iter()
                .collect();
        if current != wanted {
            consumer
                .assign(&to_tpl(partitions))
                .map_err(assignment_failed)?;
            debug!(partitions = partitions.len(), "Assignment applied");
        }
        Ok(())
    }

    fn unassign(&self) -> Result<(), KafkaError> {
        let consumer = self.consumer()?;
        if !consumer.context().settle_rebalance() {
            debug!("Revocation superseded by a later rebalance");
            return Ok(());
        }
        consumer
            .assign(&TopicPartitionList::new())
            .map_err(assignment_failed)
    }

    async fn metadata(&self, topic: &str, timeout: Duration) -> Result<TopicMetadata, KafkaError> {
        let consumer = self.consumer()?;
        let topic = topic.to_string();
        let failed = |topic: &str, reason: String| KafkaError::Metadata {
            topic: topic.to_string(),
            reason,
        };

        tokio::task::spawn_blocking(move || -> Result<TopicMetadata, KafkaError> {
            let metadata = consumer
                .fetch_metadata(Some(topic.as_str()), timeout)
                .map_err(|e| failed(&topic, e.to_string()))?;

            let found = metadata
                .topics()
                .iter()
                .find(|t| t.name() == topic)
                .ok_or_else(|| failed(&topic, "topic not found".to_string()))?;

            Ok(TopicMetadata {
                error: found.error().map(|code| {
                    let code = RDKafkaErrorCode::from(code);
                    BrokerFault {
                        code: Some(format!("{code:?}")),
                        message: code.to_string(),
                    }
                }),
                partitions: found.partitions().len(),
                topic,
            })
        })
        .await
        .map_err(|e| KafkaError::Metadata {
            topic: String::new(),
            reason: e.to_string(),
        })?
    }

    /// Leaves the group and drops the consumer. Every later call fails with
    /// [`KafkaError::Closed`].
    async fn close(&self) -> Result<(), KafkaError> {
        let consumer = self.consumer.lock().take().ok_or(KafkaError::Closed)?;
        consumer.unsubscribe();
        // The last handle going away runs the blocking librdkafka close.
        tokio::task::spawn_blocking(move || drop(consumer))
            .await
            .map_err(|e| KafkaError::Close {
                reason: e.to_string(),
            })?;
        info!("Kafka consumer closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        KAFKA_BROKERS, KAFKA_CONSUMER_GROUP, KAFKA_TOPICS, Role, Settings, SourceConfig,
        build_config,
    };
    use crate::source::kafka::KafkaSource;
    use crate::source::Source;
    use rdkafka::producer::{FutureProducer, FutureRecord};

    const TEST_TOPIC: &str = "test-topic";
    const TEST_GROUP: &str = "test-group";
    const KAFKA_BOOTSTRAP_SERVERS: &str = "localhost:9092";

    fn tp(partition: i32) -> TopicPartition {
        TopicPartition::new(TEST_TOPIC, partition)
    }

    fn local_config() -> BrokerConfig {
        let mut config = BrokerConfig::new();
        config
            .set("bootstrap.servers", KAFKA_BOOTSTRAP_SERVERS)
            .set("group.id", TEST_GROUP);
        config
    }

    #[test]
    fn test_superseded_revocation_is_skipped() {
        let (context, mut rx) = EventContext::new(10, true, true);
        context.report_rebalance(BrokerEvent::PartitionsRevoked(vec![tp(0), tp(1)]));
        context.report_rebalance(BrokerEvent::PartitionsAssigned(vec![tp(1)]));

        assert_eq!(
            rx.try_recv().unwrap(),
            BrokerEvent::PartitionsRevoked(vec![tp(0), tp(1)])
        );
        assert!(!context.settle_rebalance());
        assert_eq!(
            rx.try_recv().unwrap(),
            BrokerEvent::PartitionsAssigned(vec![tp(1)])
        );
        assert!(context.settle_rebalance());
    }

    #[test]
    fn test_latest_rebalance_is_applied() {
        let (context, mut rx) = EventContext::new(10, true, true);
        context.report_rebalance(BrokerEvent::PartitionsAssigned(vec![tp(0)]));

        assert!(rx.try_recv().is_ok());
        assert!(context.settle_rebalance());
        // Nothing queued: direct calls always apply.
        assert!(context.settle_rebalance());
    }

    #[test]
    fn test_full_queue_reports_overflow() {
        let (context, mut rx) = EventContext::new(1, true, true);
        context.report_rebalance(BrokerEvent::PartitionsRevoked(vec![tp(0)]));
        context.report_rebalance(BrokerEvent::PartitionsAssigned(vec![tp(1)]));

        match context.take_overflow() {
            Some(BrokerEvent::Error(fault)) => {
                assert_eq!(fault.code.as_deref(), Some(EVENT_QUEUE_OVERFLOW));
                assert!(fault.message.starts_with("1 broker events dropped"));
            }
            other => panic!("expected overflow error, got {other:?}"),
        }
        assert!(context.take_overflow().is_none());

        // The dropped assignment still supersedes the queued revocation.
        assert!(rx.try_recv().is_ok());
        assert!(!context.settle_rebalance());
    }

    #[tokio::test]
    async fn test_calls_after_close_fail() {
        let client = KafkaConsumerClient::new(&local_config()).unwrap();
        client.close().await.unwrap();

        assert_eq!(client.close().await, Err(KafkaError::Closed));
        assert_eq!(
            client.subscribe(&[TEST_TOPIC.to_string()]),
            Err(KafkaError::Closed)
        );
        assert_eq!(client.unassign(), Err(KafkaError::Closed));
        assert!(matches!(
            client.metadata(TEST_TOPIC, Duration::from_millis(100)).await,
            Err(KafkaError::Closed)
        ));
        assert!(client.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_local_keys_are_not_passed_to_librdkafka() {
        let settings = Settings::new()
            .with(KAFKA_BROKERS, KAFKA_BOOTSTRAP_SERVERS)
            .with(KAFKA_TOPICS, TEST_TOPIC)
            .with(KAFKA_CONSUMER_GROUP, TEST_GROUP);
        let config = build_config(&settings, Role::Source).unwrap();
        assert!(config.get(EVENTS_CHANNEL_SIZE).is_some());

        let client = KafkaConsumerClient::new(&config);
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_property_fails_creation() {
        let mut config = BrokerConfig::new();
        config
            .set("bootstrap.servers", KAFKA_BOOTSTRAP_SERVERS)
            .set("no.such.property", "1");
        assert!(matches!(
            KafkaConsumerClient::new(&config),
            Err(KafkaError::ConsumerCreation { .. })
        ));
    }

    async fn produce_messages(topic: &str, count: i32) {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", KAFKA_BOOTSTRAP_SERVERS)
            .set("message.timeout.ms", "5000")
            .create()
            .expect("Failed to create producer");

        for i in 0..count {
            let payload = format!("message-{}", i);
            producer
                .send(
                    FutureRecord::to(topic).payload(&payload).key(&i.to_string()),
                    Duration::from_secs(5),
                )
                .await
                .expect("Failed to send message");
        }
    }

    #[tokio::test]
    #[ignore = "requires a Kafka broker on localhost:9092"]
    async fn test_kafka_source_consume_ack_and_close() {
        produce_messages(TEST_TOPIC, 10).await;

        let settings = Settings::new()
            .with(KAFKA_BROKERS, KAFKA_BOOTSTRAP_SERVERS)
            .with(KAFKA_TOPICS, TEST_TOPIC)
            .with(KAFKA_CONSUMER_GROUP, TEST_GROUP);
        let config = SourceConfig::from_source(&settings).unwrap();
        let source = KafkaSource::start_with_config(config)
            .await
            .expect("Failed to start source");

        let messages = source.receive();
        for _ in 0..10 {
            let message = tokio::time::timeout(Duration::from_secs(30), messages.recv())
                .await
                .expect("Timed out waiting for message")
                .expect("Message channel closed");
            source.ack(&message).unwrap();
        }

        source.stop().unwrap();
        source.close().await.expect("Close should succeed");
    }

    #[tokio::test]
    #[ignore = "requires a Kafka broker on localhost:9092"]
    async fn test_kafka_metadata_for_missing_topic() {
        let mut config = local_config();
        config.set("allow.auto.create.topics", "false");
        let client = KafkaConsumerClient::new(&config).unwrap();

        let result = client
            .metadata("topic-that-does-not-exist", Duration::from_secs(5))
            .await;
        match result {
            Ok(metadata) => assert!(metadata.error.is_some() || metadata.partitions == 0),
            Err(KafkaError::Metadata { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
}
