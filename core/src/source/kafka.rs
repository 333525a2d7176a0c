use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::{ConfigSource, SourceConfig, SourceSettings};
use crate::errors::{BridgeError, KafkaError, SourceError};
use crate::source::broker::{BrokerClient, BrokerEvent, BrokerFault};
use crate::source::consumer::KafkaConsumerClient;
use crate::source::unacked::UnackedTracker;
use crate::source::{Event, Incoming, Message, Outgoing, Source, handoff};
use crate::telemetry::{SourceMetrics, SourceMetricsSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// Kafka-backed [`Source`]: one consume loop multiplexes the client's native
/// events onto a message channel and an event channel, and every delivered
/// message stays tracked until it is acked or failed.
pub struct KafkaSource<C: BrokerClient = KafkaConsumerClient> {
    client: Arc<C>,
    topics: Vec<String>,
    settings: SourceSettings,
    unacked: Arc<UnackedTracker>,
    metrics: Arc<SourceMetrics>,
    state: Arc<Mutex<LifecycleState>>,
    messages: Incoming<Message>,
    events: Incoming<Event>,
    // Held so the channels stay open after the loop exits, until close.
    senders: Mutex<Option<(Outgoing<Message>, Outgoing<Event>)>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    done_rx: watch::Receiver<bool>,
    closed: AtomicBool,
}

impl KafkaSource<KafkaConsumerClient> {
    /// Validates `source`, connects, checks every topic and starts consuming.
    pub async fn start(source: &dyn ConfigSource) -> Result<Self, BridgeError> {
        let config = SourceConfig::from_source(source)?;
        Self::start_with_config(config).await
    }

    pub async fn start_with_config(config: SourceConfig) -> Result<Self, BridgeError> {
        let client = KafkaConsumerClient::new(&config.client)?;
        Ok(Self::with_client(client, config.topics, config.settings).await?)
    }
}

impl<C: BrokerClient> KafkaSource<C> {
    /// Pings, subscribes and spawns the consume loop. On error the client is
    /// closed and nothing keeps running.
    pub async fn with_client(
        client: C,
        topics: Vec<String>,
        settings: SourceSettings,
    ) -> Result<Self, SourceError> {
        let (message_tx, messages) = handoff();
        let (event_tx, events) = handoff();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(false);

        let source = Self {
            client: Arc::new(client),
            topics,
            settings,
            unacked: Arc::new(UnackedTracker::new()),
            metrics: Arc::new(SourceMetrics::default()),
            state: Arc::new(Mutex::new(LifecycleState::Created)),
            messages,
            events,
            senders: Mutex::new(Some((message_tx.clone(), event_tx.clone()))),
            stop_tx: Mutex::new(Some(stop_tx)),
            done_rx,
            closed: AtomicBool::new(false),
        };

        if let Err(e) = source.connect().await {
            if let Err(close_err) = source.client.close().await {
                warn!("Failed to release client after aborted start: {}", close_err);
            }
            return Err(e);
        }

        let consume = ConsumeLoop {
            client: source.client.clone(),
            unacked: source.unacked.clone(),
            metrics: source.metrics.clone(),
            messages: message_tx,
            events: event_tx,
            stop: stop_rx,
        };
        let state = source.state.clone();
        *state.lock() = LifecycleState::Running;
        tokio::spawn(async move {
            consume.run().await;
            *state.lock() = LifecycleState::Stopped;
            done_tx.send_replace(true);
            info!("Kafka source consume loop exited");
        });

        info!(topics = ?source.topics, "Kafka source started");
        Ok(source)
    }

    async fn connect(&self) -> Result<(), SourceError> {
        if self.topics.is_empty() {
            return Err(KafkaError::Subscription {
                topics: Vec::new(),
                reason: "no topics configured".to_string(),
            }
            .into());
        }
        self.ping().await.map_err(SourceError::connectivity)?;
        self.client.subscribe(&self.topics)?;
        Ok(())
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn metrics(&self) -> SourceMetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[async_trait]
impl<C: BrokerClient> Source for KafkaSource<C> {
    fn receive(&self) -> Incoming<Message> {
        self.messages.clone()
    }

    fn events(&self) -> Incoming<Event> {
        self.events.clone()
    }

    fn ack(&self, message: &Message) -> Result<(), SourceError> {
        self.unacked.remove(message)?;
        self.metrics.record_acked();
        Ok(())
    }

    /// Same bookkeeping as [`ack`](Source::ack): the message is dropped from
    /// the unacked set and is not redelivered. Retrying is up to the caller.
    fn fail(&self, message: &Message) -> Result<(), SourceError> {
        self.unacked.remove(message)?;
        self.metrics.record_failed();
        debug!(id = message.id(), "Message failed");
        Ok(())
    }

    fn unacked(&self) -> Vec<Message> {
        self.unacked.list()
    }

    fn stop(&self) -> Result<(), SourceError> {
        if let Some(stop) = self.stop_tx.lock().take() {
            // The loop may already be gone if the source is being torn down.
            let _ = stop.send(());
            let mut state = self.state.lock();
            if *state == LifecycleState::Running {
                *state = LifecycleState::Stopping;
            }
            info!("Kafka source stop requested");
        }
        Ok(())
    }

    /// Fails with `StopNotCalled` if the loop has not exited within the grace
    /// period and with `UnackedMessagesRemain` while messages are in flight.
    /// Only then are the channels closed and the client released.
    async fn close(&self) -> Result<(), SourceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SourceError::AlreadyClosed);
        }

        let mut done = self.done_rx.clone();
        let grace = self.settings.close_grace;
        if tokio::time::timeout(grace, wait_for_exit(&mut done))
            .await
            .is_err()
        {
            warn!("Close called on a running Kafka source; call stop first");
            return Err(SourceError::StopNotCalled { grace });
        }

        let count = self.unacked.count();
        if count > 0 {
            return Err(SourceError::UnackedMessagesRemain { count });
        }

        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(SourceError::AlreadyClosed);
        }
        self.senders.lock().take();
        self.client.close().await?;
        info!("Kafka source closed");
        Ok(())
    }

    /// Checks that every topic resolves, reports no error and has partitions.
    async fn ping(&self) -> Result<(), SourceError> {
        let timeout = self.settings.metadata_timeout;
        for topic in &self.topics {
            let unavailable = |reason: String| SourceError::TopicUnavailable {
                topic: topic.clone(),
                reason,
            };
            let lookup = self.client.metadata(topic, timeout);
            let metadata = match tokio::time::timeout(timeout, lookup).await {
                Ok(Ok(metadata)) => metadata,
                Ok(Err(e)) => return Err(unavailable(e.to_string())),
                Err(_) => {
                    return Err(unavailable(format!(
                        "metadata request timed out after {timeout:?}"
                    )));
                }
            };
            if let Some(fault) = metadata.error {
                return Err(unavailable(format!("topic has error: {fault}")));
            }
            if metadata.partitions < 1 {
                return Err(unavailable("configured topic has no partitions".to_string()));
            }
            debug!(topic = %topic, partitions = metadata.partitions, "Topic metadata ok");
        }
        Ok(())
    }
}

async fn wait_for_exit(done: &mut watch::Receiver<bool>) {
    loop {
        let exited = *done.borrow_and_update();
        // A dropped sender means the loop task is gone as well.
        if exited || done.changed().await.is_err() {
            return;
        }
    }
}

enum Flow {
    Continue,
    Exit,
}

/// How an offered item left the handoff.
enum Handoff {
    Received,
    /// Stop won the race. `received` is set when a reader took the item anyway.
    Stopped { received: bool },
    Closed,
}

/// Offers `item` and waits until a reader takes it or stop arrives. The loop
/// never pulls the next native event while an item is on offer.
async fn hand_off<T>(
    tx: &Outgoing<T>,
    item: T,
    stop: &mut oneshot::Receiver<()>,
) -> Handoff {
    let (receipt_tx, mut receipt) = oneshot::channel();
    let offered = tokio::select! {
        biased;
        sent = tx.send((item, receipt_tx)) => sent.is_ok(),
        _ = &mut *stop => return Handoff::Stopped { received: false },
    };
    if !offered {
        return Handoff::Closed;
    }

    tokio::select! {
        biased;
        taken = &mut receipt => match taken {
            Ok(()) => Handoff::Received,
            Err(_) => Handoff::Closed,
        },
        _ = &mut *stop => {
            // Closing first makes any later receipt fail, so the reader skips the item.
            receipt.close();
            Handoff::Stopped {
                received: receipt.try_recv().is_ok(),
            }
        }
    }
}

struct ConsumeLoop<C> {
    client: Arc<C>,
    unacked: Arc<UnackedTracker>,
    metrics: Arc<SourceMetrics>,
    messages: Outgoing<Message>,
    events: Outgoing<Event>,
    stop: oneshot::Receiver<()>,
}

impl<C: BrokerClient> ConsumeLoop<C> {
    async fn run(mut self) {
        loop {
            let next = tokio::select! {
                biased;
                _ = &mut self.stop => break,
                next = self.client.next_event() => next,
            };

            let Some(event) = next else {
                warn!("Broker event stream ended; waiting for stop");
                let _ = (&mut self.stop).await;
                break;
            };

            if let Flow::Exit = self.handle(event).await {
                break;
            }
        }
    }

    async fn handle(&mut self, event: BrokerEvent) -> Flow {
        match event {
            BrokerEvent::PartitionsAssigned(partitions) => {
                info!(count = partitions.len(), "Partitions assigned");
                let assigned = self.client.assign(&partitions);
                self.forward_with_failure(Event::PartitionsAssigned(partitions), assigned)
                    .await
            }
            BrokerEvent::PartitionsRevoked(partitions) => {
                info!(count = partitions.len(), "Partitions revoked");
                let unassigned = self.client.unassign();
                self.forward_with_failure(Event::PartitionsRevoked(partitions), unassigned)
                    .await
            }
            BrokerEvent::Message(record) => self.deliver(Message::from_record(record)).await,
            BrokerEvent::PartitionEof { topic, partition } => {
                debug!(?topic, partition, "Reached end of partition");
                Flow::Continue
            }
            BrokerEvent::OffsetsCommitted { error: None, offsets } => {
                debug!(partitions = offsets.len(), "Offsets committed");
                Flow::Continue
            }
            BrokerEvent::OffsetsCommitted {
                error: Some(fault), ..
            } => {
                self.metrics.record_commit_error();
                warn!("Offset commit failed: {}", fault);
                self.forward(Event::CommitError(fault)).await
            }
            BrokerEvent::Error(fault) => {
                warn!("Kafka error: {}", fault);
                self.forward(Event::BrokerError(fault)).await
            }
            BrokerEvent::Other(other) => self.forward(Event::Broker(other)).await,
        }
    }

    async fn forward_with_failure(
        &mut self,
        event: Event,
        outcome: Result<(), KafkaError>,
    ) -> Flow {
        if let Flow::Exit = self.forward(event).await {
            return Flow::Exit;
        }
        match outcome {
            Ok(()) => Flow::Continue,
            Err(e) => {
                error!("Partition assignment update failed: {}", e);
                self.forward(Event::BrokerError(BrokerFault::new(e.to_string())))
                    .await
            }
        }
    }

    async fn forward(&mut self, event: Event) -> Flow {
        match hand_off(&self.events, event, &mut self.stop).await {
            Handoff::Received => {
                self.metrics.record_event();
                Flow::Continue
            }
            Handoff::Stopped { received } => {
                if received {
                    self.metrics.record_event();
                }
                Flow::Exit
            }
            Handoff::Closed => Flow::Exit,
        }
    }

    /// Tracks the message, then offers it. If nobody takes it before stop,
    /// it is untracked again.
    async fn deliver(&mut self, message: Message) -> Flow {
        debug!(id = message.id(), "Registering message");
        let pending = message.clone();
        self.unacked.add(message.clone());

        let (received, flow) = match hand_off(&self.messages, message, &mut self.stop).await {
            Handoff::Received => (true, Flow::Continue),
            Handoff::Stopped { received } => (received, Flow::Exit),
            Handoff::Closed => (false, Flow::Exit),
        };

        if received {
            self.metrics.record_received();
        } else {
            let _ = self.unacked.remove(&pending);
            debug!(id = pending.id(), "Handoff abandoned");
        }
        flow
    }
}
