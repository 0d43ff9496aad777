//! Mock implementations for testing
//!
//! [`MockTransport`] stands in for the AMQP client underneath a
//! [`crate::broker::BrokerLink`]: tests script connect outcomes, push
//! deliveries and drop the connection. [`RecordingBroker`] replaces the whole
//! link for code that only needs a [`BrokerHandle`].

use crate::broker::{BrokerHandle, ConnectionState};
use crate::error::{WorkerError, WorkerResult};
use crate::transport::{
    PublishProperties, RawDelivery, Transport, TransportError, TransportEvent,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{mpsc, Mutex};

/// One publish as seen by a test double
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub topic: String,
    pub correlation_id: String,
    pub reply_to: String,
    pub app_id: String,
    pub body: Value,
}

/// Scripted result of one `open` call
#[derive(Debug, Clone, PartialEq)]
pub enum OpenOutcome {
    Succeed,
    /// Retryable failure, e.g. connection refused
    Fail(String),
    /// The broker speaks another protocol
    Incompatible(String),
}

/// Mock transport for testing
pub struct MockTransport {
    open_script: Mutex<VecDeque<OpenOutcome>>,
    open_calls: AtomicUsize,
    close_calls: AtomicUsize,
    is_open: AtomicBool,
    opened_queues: Mutex<Vec<String>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    published: Mutex<Vec<PublishedMessage>>,
    acks: Mutex<Vec<u64>>,
    rejects: Mutex<Vec<(u64, bool)>>,
    failing_topics: Mutex<HashSet<String>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            open_script: Mutex::new(VecDeque::new()),
            open_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            is_open: AtomicBool::new(false),
            opened_queues: Mutex::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(events_rx),
            published: Mutex::new(Vec::new()),
            acks: Mutex::new(Vec::new()),
            rejects: Mutex::new(Vec::new()),
            failing_topics: Mutex::new(HashSet::new()),
        }
    }

    /// Outcomes for the next `open` calls, in order. Once the script runs
    /// out every open succeeds.
    pub fn with_open_script(outcomes: Vec<OpenOutcome>) -> Self {
        Self {
            open_script: Mutex::new(outcomes.into()),
            ..Self::new()
        }
    }

    /// Make publishes to `topic` fail
    pub async fn fail_publishes_to(&self, topic: &str) {
        self.failing_topics.lock().await.insert(topic.to_string());
    }

    /// Queue a delivery for the consume loop
    pub fn push_delivery(&self, delivery: RawDelivery) {
        let _ = self.events_tx.send(TransportEvent::Delivery(delivery));
    }

    /// Simulate the broker closing the connection
    pub fn drop_connection(&self, reason: &str) {
        let _ = self.events_tx.send(TransportEvent::Closed {
            reason: reason.to_string(),
        });
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    pub async fn opened_queues(&self) -> Vec<String> {
        self.opened_queues.lock().await.clone()
    }

    pub async fn get_published_messages(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    pub async fn get_acks(&self) -> Vec<u64> {
        self.acks.lock().await.clone()
    }

    pub async fn get_rejects(&self) -> Vec<(u64, bool)> {
        self.rejects.lock().await.clone()
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::ChannelClosed)
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, queue: &str) -> Result<(), TransportError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .open_script
            .lock()
            .await
            .pop_front()
            .unwrap_or(OpenOutcome::Succeed);

        match outcome {
            OpenOutcome::Succeed => {
                self.opened_queues.lock().await.push(queue.to_string());
                self.is_open.store(true, Ordering::SeqCst);
                Ok(())
            }
            OpenOutcome::Fail(reason) => Err(TransportError::ConnectionFailed(reason.into())),
            OpenOutcome::Incompatible(reason) => Err(TransportError::ProtocolIncompatible(reason)),
        }
    }

    async fn next_event(&self) -> TransportEvent {
        let event = self.events_rx.lock().await.recv().await;
        match event {
            Some(TransportEvent::Closed { reason }) => {
                self.is_open.store(false, Ordering::SeqCst);
                TransportEvent::Closed { reason }
            }
            Some(event) => event,
            None => TransportEvent::Closed {
                reason: "event channel closed".to_string(),
            },
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.acks.lock().await.push(delivery_tag);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.rejects.lock().await.push((delivery_tag, requeue));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: &PublishProperties,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.failing_topics.lock().await.contains(routing_key) {
            return Err(TransportError::PublishFailed {
                routing_key: routing_key.to_string(),
                source: "mock publish failure".into(),
            });
        }

        let body = serde_json::from_slice(&body).map_err(|e| TransportError::PublishFailed {
            routing_key: routing_key.to_string(),
            source: Box::new(e),
        })?;
        self.published.lock().await.push(PublishedMessage {
            exchange: exchange.to_string(),
            topic: routing_key.to_string(),
            correlation_id: properties.correlation_id.clone(),
            reply_to: properties.reply_to.clone(),
            app_id: properties.app_id.clone(),
            body,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.is_open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory [`BrokerHandle`] recording everything handed to it
pub struct RecordingBroker {
    app_id: String,
    connected: bool,
    failing_topics: HashSet<String>,
    published: Mutex<Vec<PublishedMessage>>,
    acks: Mutex<Vec<u64>>,
    rejects: Mutex<Vec<(u64, bool)>>,
}

impl Default for RecordingBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingBroker {
    pub fn new() -> Self {
        Self {
            app_id: "recorder".to_string(),
            connected: true,
            failing_topics: HashSet::new(),
            published: Mutex::new(Vec::new()),
            acks: Mutex::new(Vec::new()),
            rejects: Mutex::new(Vec::new()),
        }
    }

    pub fn with_app_id<S: Into<String>>(mut self, app_id: S) -> Self {
        self.app_id = app_id.into();
        self
    }

    /// Publishes to `topic` fail with a transport error
    pub fn failing_topic(mut self, topic: &str) -> Self {
        self.failing_topics.insert(topic.to_string());
        self
    }

    /// Every operation fails as if the channel had closed
    pub fn disconnected(mut self) -> Self {
        self.connected = false;
        self
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    /// Publishes to one topic, in order
    pub async fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    pub async fn acks(&self) -> Vec<u64> {
        self.acks.lock().await.clone()
    }

    pub async fn rejects(&self) -> Vec<(u64, bool)> {
        self.rejects.lock().await.clone()
    }

    fn ensure_connected(&self) -> WorkerResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(WorkerError::NotConnected {
                state: ConnectionState::Closed,
            })
        }
    }
}

#[async_trait]
impl BrokerHandle for RecordingBroker {
    fn app_id(&self) -> &str {
        &self.app_id
    }

    async fn ack(&self, delivery_tag: u64) -> WorkerResult<()> {
        self.ensure_connected()?;
        self.acks.lock().await.push(delivery_tag);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> WorkerResult<()> {
        self.ensure_connected()?;
        self.rejects.lock().await.push((delivery_tag, requeue));
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        correlation_id: &str,
        body: &Value,
        exchange: &str,
        reply_to: &str,
    ) -> WorkerResult<()> {
        self.ensure_connected()?;
        if self.failing_topics.contains(topic) {
            return Err(TransportError::PublishFailed {
                routing_key: topic.to_string(),
                source: "recorded publish failure".into(),
            }
            .into());
        }

        self.published.lock().await.push(PublishedMessage {
            exchange: exchange.to_string(),
            topic: topic.to_string(),
            correlation_id: correlation_id.to_string(),
            reply_to: reply_to.to_string(),
            app_id: self.app_id.clone(),
            body: body.clone(),
        });
        Ok(())
    }
}
