//! Transport layer for broker communication
//!
//! This module provides the abstraction the broker link drives (open a channel,
//! pull events, ack/reject, publish, close) and the AMQP implementation.
//! Keeping the wire client behind [`Transport`] lets the connection state
//! machine run against a test double without a live broker.

use thiserror::Error;

pub mod amqp;

/// A delivery as handed over by the transport, before any decoding
#[derive(Debug, Clone, PartialEq)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
}

impl RawDelivery {
    pub fn new(delivery_tag: u64, body: Vec<u8>) -> Self {
        Self {
            delivery_tag,
            correlation_id: None,
            reply_to: None,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            body,
        }
    }

    pub fn with_correlation_id<S: Into<String>>(mut self, correlation_id: S) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to<S: Into<String>>(mut self, reply_to: S) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Correlation id as echoed on responses; absent ids become `"None"`
    pub fn correlation_id_or_default(&self) -> String {
        self.correlation_id
            .clone()
            .unwrap_or_else(|| crate::protocol::MISSING_CORRELATION_ID.to_string())
    }
}

/// Events surfaced by an open transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A message was consumed from the queue
    Delivery(RawDelivery),
    /// The connection or channel went away
    Closed { reason: String },
}

/// Envelope metadata attached to every publish
#[derive(Debug, Clone, PartialEq)]
pub struct PublishProperties {
    pub app_id: String,
    pub correlation_id: String,
    pub reply_to: String,
    pub content_type: String,
}

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Incompatible protocol: {0}")]
    ProtocolIncompatible(String),
    #[error("Channel is not open")]
    ChannelClosed,
    #[error("Consuming failed")]
    ConsumeFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing to {routing_key} failed")]
    PublishFailed {
        routing_key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Settling delivery {delivery_tag} failed")]
    SettleFailed {
        delivery_tag: u64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Close failed")]
    CloseFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl TransportError {
    /// A fatal error means retrying can never succeed
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::ProtocolIncompatible(_))
    }
}

/// Transport trait for broker communication
///
/// Implementations use interior mutability: the broker link shares one
/// instance between its run loop and the handler-facing ack/publish calls.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Connect, open a channel and start consuming from `queue`
    async fn open(&self, queue: &str) -> Result<(), TransportError>;

    /// Wait for the next delivery or for the connection to close.
    /// Must be cancel-safe: the link races it against shutdown requests.
    async fn next_event(&self) -> TransportEvent;

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: &PublishProperties,
    ) -> Result<(), TransportError>;

    /// Close channel and connection
    async fn close(&self) -> Result<(), TransportError>;
}

/// Type alias for the production transport
pub type AmqpTransport = amqp::AmqpClient;
