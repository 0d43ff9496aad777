//! Per-message state handed to a worker's `process`

use super::worker::HandlerError;
use crate::broker::BrokerHandle;
use crate::config::WorkerConfig;
use crate::error::WorkerResult;
use crate::notify::NotificationRouter;
use crate::output::OutputChannel;
use crate::protocol::topics::{DEFAULT_EXCHANGE, DEFAULT_REPLY_TO, DIRECT_EXCHANGE};
use crate::protocol::{MessageEnvelope, NotifyConfig, StatusMessage, DYNAMIC_KEY};
use crate::transport::RawDelivery;
use serde_json::Value;
use tracing::warn;

/// How the current delivery has been settled so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Pending,
    Acked,
    Rejected { requeue: bool },
}

/// Everything belonging to one in-flight message.
///
/// Built fresh for every delivery, so nothing (notify targets included) can
/// leak from one message into the next.
pub struct DispatchContext<'a> {
    broker: &'a dyn BrokerHandle,
    delivery: RawDelivery,
    envelope: MessageEnvelope,
    output: OutputChannel<'a>,
    notifier: NotificationRouter<'a>,
    config: &'a WorkerConfig,
    settlement: Settlement,
}

impl<'a> DispatchContext<'a> {
    pub fn new(
        broker: &'a dyn BrokerHandle,
        delivery: RawDelivery,
        envelope: MessageEnvelope,
        config: &'a WorkerConfig,
    ) -> Self {
        let mut output = OutputChannel::new(broker, envelope.correlation_id.clone());
        output.set_level(config.output_level());
        let notifier = NotificationRouter::new(broker, NotifyConfig::from_payload(&envelope.payload));

        Self {
            broker,
            delivery,
            envelope,
            output,
            notifier,
            config,
            settlement: Settlement::Pending,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.envelope.correlation_id
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.envelope.reply_to.as_deref()
    }

    /// The decoded message body
    pub fn payload(&self) -> &Value {
        &self.envelope.payload
    }

    pub fn delivery(&self) -> &RawDelivery {
        &self.delivery
    }

    pub fn output(&self) -> &OutputChannel<'a> {
        &self.output
    }

    pub fn config(&self) -> &WorkerConfig {
        self.config
    }

    pub fn settlement(&self) -> Settlement {
        self.settlement
    }

    /// Required input under the payload's `dynamic` document
    pub fn dynamic(&self, key: &str) -> Result<&Value, HandlerError> {
        self.envelope
            .payload
            .get(DYNAMIC_KEY)
            .and_then(|dynamic| dynamic.get(key))
            .ok_or_else(|| HandlerError::missing_field(key))
    }

    /// Required string input under `dynamic`
    pub fn dynamic_str(&self, key: &str) -> Result<&str, HandlerError> {
        self.dynamic(key)?
            .as_str()
            .ok_or_else(|| HandlerError::failed(format!("dynamic input '{key}' must be a string")))
    }

    pub async fn ack(&mut self) -> WorkerResult<()> {
        self.broker.ack(self.delivery.delivery_tag).await?;
        self.settlement = Settlement::Acked;
        Ok(())
    }

    pub async fn reject(&mut self, requeue: bool) -> WorkerResult<()> {
        self.broker
            .reject(self.delivery.delivery_tag, requeue)
            .await?;
        self.settlement = Settlement::Rejected { requeue };
        Ok(())
    }

    /// Publish `body` to `topic` on the `re` exchange
    pub async fn send(&self, topic: &str, body: &Value) -> WorkerResult<()> {
        self.send_to(topic, body, DEFAULT_EXCHANGE, DEFAULT_REPLY_TO)
            .await
    }

    pub async fn send_to(
        &self,
        topic: &str,
        body: &Value,
        exchange: &str,
        reply_to: &str,
    ) -> WorkerResult<()> {
        self.broker
            .publish(topic, self.correlation_id(), body, exchange, reply_to)
            .await
    }

    /// Publish a status document to the message's reply-to topic.
    ///
    /// Returns false when the producer gave no reply-to; there is nowhere to
    /// answer, so nothing is sent.
    pub async fn reply(&self, status: &StatusMessage) -> WorkerResult<bool> {
        let Some(reply_to) = self.reply_to() else {
            warn!(
                correlation_id = self.correlation_id(),
                status = ?status.status,
                "Message has no reply-to, status not sent"
            );
            return Ok(false);
        };

        let body = serde_json::to_value(status)?;
        self.send_to(reply_to, &body, DIRECT_EXCHANGE, DEFAULT_REPLY_TO)
            .await?;
        Ok(true)
    }

    /// Notify every destination configured for `phase` in this message
    pub async fn notify(&self, slug: &str, message: &str, phase: &str) -> WorkerResult<usize> {
        self.notifier
            .notify(slug, message, phase, self.correlation_id())
            .await
    }
}
