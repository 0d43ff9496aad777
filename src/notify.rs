//! Notification fan-out
//!
//! A [`NotificationRouter`] holds the [`NotifyConfig`] of the message being
//! processed and publishes one [`NotifyEvent`] per destination configured
//! for a phase, on the direct exchange, to `notify.<suffix>`.

use crate::broker::BrokerHandle;
use crate::error::{NotifyFailure, WorkerError, WorkerResult};
use crate::observability::metrics;
use crate::protocol::topics::{DEFAULT_REPLY_TO, DIRECT_EXCHANGE};
use crate::protocol::{NotifyConfig, NotifyEvent, TopicBuilder};
use tracing::{debug, info, warn};

pub struct NotificationRouter<'a> {
    broker: &'a dyn BrokerHandle,
    config: NotifyConfig,
}

impl<'a> NotificationRouter<'a> {
    pub fn new(broker: &'a dyn BrokerHandle, config: NotifyConfig) -> Self {
        Self { broker, config }
    }

    pub fn config(&self) -> &NotifyConfig {
        &self.config
    }

    /// Send `slug`/`message` to every destination configured for `phase`.
    ///
    /// Returns how many events were published. A phase without destinations
    /// is a no-op. Every destination is attempted even when an earlier one
    /// fails; failures are then reported together as [`WorkerError::Notify`].
    pub async fn notify(
        &self,
        slug: &str,
        message: &str,
        phase: &str,
        correlation_id: &str,
    ) -> WorkerResult<usize> {
        let Some(destinations) = self.config.destinations(phase) else {
            debug!("No notifications to send for phase {}", phase);
            return Ok(0);
        };

        let mut sent = 0;
        let mut failures = Vec::new();
        for (suffix, target) in destinations {
            let topic = TopicBuilder::build_notify_topic(suffix);
            let event = NotifyEvent::new(slug, message, phase, target.clone());

            match self.publish_event(&topic, correlation_id, &event).await {
                Ok(()) => {
                    sent += 1;
                    metrics().notification_sent();
                    info!("Sent notification to {} for phase {}", topic, phase);
                }
                Err(e) => {
                    metrics().notification_failed();
                    warn!(%topic, phase, error = %e, "Notification could not be sent");
                    failures.push(NotifyFailure {
                        topic,
                        error: e.to_string(),
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(sent)
        } else {
            Err(WorkerError::Notify { sent, failures })
        }
    }

    async fn publish_event(
        &self,
        topic: &str,
        correlation_id: &str,
        event: &NotifyEvent,
    ) -> WorkerResult<()> {
        let body = serde_json::to_value(event)?;
        self.broker
            .publish(
                topic,
                correlation_id,
                &body,
                DIRECT_EXCHANGE,
                DEFAULT_REPLY_TO,
            )
            .await
    }
}
