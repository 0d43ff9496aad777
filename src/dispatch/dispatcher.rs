//! Per-message pipeline: decode, run the worker, classify what went wrong

use super::context::{DispatchContext, Settlement};
use super::worker::{HandlerError, Worker};
use crate::broker::{BrokerHandle, DeliveryHandler};
use crate::config::WorkerConfig;
use crate::delivery_span;
use crate::error::{WorkerError, WorkerResult};
use crate::observability::metrics;
use crate::protocol::topics::{DEFAULT_REPLY_TO, DIRECT_EXCHANGE};
use crate::protocol::{MessageEnvelope, QueueIdentity, StatusMessage};
use crate::transport::RawDelivery;
use async_trait::async_trait;
use std::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// How one delivery ended, from the dispatcher's point of view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The worker returned normally
    Completed,
    /// The body was not a JSON object; the message was rejected
    ParseFailed,
    /// The worker reported a missing dynamic input
    MissingField { key: String },
    /// The worker failed for any other reason
    HandlerFailed { error: String },
}

/// Runs a [`Worker`] against each delivery, one at a time
pub struct MessageDispatcher<W: Worker> {
    worker: W,
    config: WorkerConfig,
}

impl<W: Worker> MessageDispatcher<W> {
    pub fn new(worker: W, config: WorkerConfig) -> Self {
        Self { worker, config }
    }

    pub fn worker(&self) -> &W {
        &self.worker
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// `worker.<queue override or lowercased worker name>`
    pub fn queue_identity(&self) -> QueueIdentity {
        QueueIdentity::new(self.worker.name(), self.config.queue())
    }

    /// `app_id` for outbound publishes: the lowercased worker name
    pub fn app_id(&self) -> String {
        self.worker.name().to_lowercase()
    }

    /// Process one delivery to completion
    pub async fn dispatch(
        &self,
        broker: &dyn BrokerHandle,
        delivery: RawDelivery,
    ) -> DispatchOutcome {
        let span = delivery_span!(
            worker = self.worker.name(),
            delivery_tag = delivery.delivery_tag,
            correlation_id = %delivery.correlation_id_or_default()
        );
        self.dispatch_delivery(broker, delivery)
            .instrument(span)
            .await
    }

    async fn dispatch_delivery(
        &self,
        broker: &dyn BrokerHandle,
        delivery: RawDelivery,
    ) -> DispatchOutcome {
        let name = self.worker.name();
        let envelope = match MessageEnvelope::decode(&delivery) {
            Ok(envelope) => envelope,
            Err(e) => return self.parse_failed(broker, &delivery, e).await,
        };

        let correlation_id = envelope.correlation_id.clone();
        let mut ctx = DispatchContext::new(broker, delivery, envelope, &self.config);

        relay(
            ctx.output()
                .debug(&format!("Starting {name}.{correlation_id} - {}", timestamp()))
                .await,
        );

        let started = Instant::now();
        let outcome = match self.worker.process(&mut ctx).await {
            Ok(()) => {
                metrics().delivery_completed(started.elapsed());
                DispatchOutcome::Completed
            }
            Err(HandlerError::MissingField(key)) => {
                metrics().missing_field(started.elapsed());
                self.missing_field(&ctx, key).await
            }
            Err(e) => {
                metrics().handler_failed(started.elapsed());
                self.handler_failed(&mut ctx, e).await
            }
        };

        relay(
            ctx.output()
                .debug(&format!("Finished {name}.{correlation_id} - {}", timestamp()))
                .await,
        );
        outcome
    }

    async fn parse_failed(
        &self,
        broker: &dyn BrokerHandle,
        delivery: &RawDelivery,
        error: WorkerError,
    ) -> DispatchOutcome {
        error!(%error, "Could not parse message, rejecting");
        metrics().parse_failed();

        let correlation_id = delivery.correlation_id_or_default();
        let status = StatusMessage::failed(format!(
            "{} failed trying to parse message",
            self.worker.name()
        ));
        match delivery.reply_to.as_deref() {
            Some(reply_to) => {
                if let Err(e) = publish_status(broker, reply_to, &correlation_id, &status).await {
                    warn!(error = %e, "Could not publish parse failure status");
                }
            }
            None => warn!("Message has no reply-to, parse failure status not sent"),
        }

        if let Err(e) = broker.reject(delivery.delivery_tag, false).await {
            error!(error = %e, "Could not reject unparseable message");
        }
        DispatchOutcome::ParseFailed
    }

    async fn missing_field(&self, ctx: &DispatchContext<'_>, key: String) -> DispatchOutcome {
        let name = self.worker.name();
        let required = self.worker.dynamic_fields().join(",");

        debug!(%key, %required, "Required dynamic input missing");
        relay(
            ctx.output()
                .debug(&format!(
                    "An expected key in the message for {} for {name} was missing: '{key}'. \
                     Required keys: {required} - {}",
                    ctx.correlation_id(),
                    timestamp()
                ))
                .await,
        );

        let status = StatusMessage::failed(format!(
            "{name} failed due to missing key: '{key}'. Required Keys: {required}"
        ));
        if let Err(e) = ctx.reply(&status).await {
            warn!(error = %e, "Could not publish missing key status");
        }
        DispatchOutcome::MissingField { key }
    }

    async fn handler_failed(
        &self,
        ctx: &mut DispatchContext<'_>,
        error: HandlerError,
    ) -> DispatchOutcome {
        let name = self.worker.name();
        error!(%error, "{} failed", name);

        let status = StatusMessage::failed(format!("{name} failed: {error}"));
        if let Err(e) = ctx.reply(&status).await {
            warn!(error = %e, "Could not publish failure status");
        }

        if ctx.settlement() == Settlement::Pending {
            info!("Rejecting unsettled message after handler failure");
            if let Err(e) = ctx.reject(false).await {
                error!(error = %e, "Could not reject message after handler failure");
            }
        }
        DispatchOutcome::HandlerFailed {
            error: error.to_string(),
        }
    }
}

#[async_trait]
impl<W: Worker> DeliveryHandler for MessageDispatcher<W> {
    async fn on_delivery(&self, broker: &dyn BrokerHandle, delivery: RawDelivery) {
        let outcome = self.dispatch(broker, delivery).await;
        debug!(?outcome, "Delivery handled");
    }
}

async fn publish_status(
    broker: &dyn BrokerHandle,
    reply_to: &str,
    correlation_id: &str,
    status: &StatusMessage,
) -> WorkerResult<()> {
    let body = serde_json::to_value(status)?;
    broker
        .publish(
            reply_to,
            correlation_id,
            &body,
            DIRECT_EXCHANGE,
            DEFAULT_REPLY_TO,
        )
        .await
}

/// Output relay lines written by the dispatcher itself are best effort
fn relay(result: WorkerResult<()>) {
    if let Err(e) = result {
        warn!(error = %e, "Could not relay output line");
    }
}

fn timestamp() -> String {
    chrono::Local::now()
        .format("%Y-%m-%d %H:%M:%S%.6f")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingBroker;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Worker for Echo {
        fn name(&self) -> &str {
            "Echo"
        }

        fn dynamic_fields(&self) -> &[&'static str] {
            &["group", "hosts"]
        }

        async fn process(&self, ctx: &mut DispatchContext<'_>) -> Result<(), HandlerError> {
            let group = ctx.dynamic("group")?.clone();
            ctx.ack().await?;
            ctx.send("echo", &group).await?;
            Ok(())
        }
    }

    fn delivery(body: &str) -> RawDelivery {
        RawDelivery::new(5, body.as_bytes().to_vec())
            .with_correlation_id("77")
            .with_reply_to("step.reply")
    }

    #[test]
    fn test_queue_identity_and_app_id() {
        let dispatcher = MessageDispatcher::new(Echo, WorkerConfig::default());
        assert_eq!(dispatcher.queue_identity().name(), "worker.echo");
        assert_eq!(dispatcher.app_id(), "echo");

        let config = WorkerConfig {
            queue: Some("echo-eu".to_string()),
            ..WorkerConfig::default()
        };
        let dispatcher = MessageDispatcher::new(Echo, config);
        assert_eq!(dispatcher.queue_identity().name(), "worker.echo-eu");
    }

    #[tokio::test]
    async fn test_completed_message() {
        let broker = RecordingBroker::new();
        let dispatcher = MessageDispatcher::new(Echo, WorkerConfig::default());

        let outcome = dispatcher
            .dispatch(&broker, delivery(r#"{"dynamic": {"group": "web"}}"#))
            .await;
        assert_eq!(outcome, DispatchOutcome::Completed);
        assert_eq!(broker.acks().await, vec![5]);

        let topics: Vec<_> = broker
            .published()
            .await
            .into_iter()
            .map(|p| p.topic)
            .collect();
        assert_eq!(topics, vec!["output", "echo", "output"]);
    }

    #[tokio::test]
    async fn test_parse_failure_rejects_without_requeue() {
        let broker = RecordingBroker::new();
        let dispatcher = MessageDispatcher::new(Echo, WorkerConfig::default());

        let outcome = dispatcher.dispatch(&broker, delivery("{not json")).await;
        assert_eq!(outcome, DispatchOutcome::ParseFailed);
        assert_eq!(broker.rejects().await, vec![(5, false)]);

        let published = broker.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "step.reply");
        assert_eq!(published[0].exchange, "");
        assert_eq!(
            published[0].body,
            json!({"status": "failed", "data": "Echo failed trying to parse message"})
        );
    }

    #[tokio::test]
    async fn test_missing_field_reports_required_keys() {
        let broker = RecordingBroker::new();
        let dispatcher = MessageDispatcher::new(Echo, WorkerConfig::default());

        let outcome = dispatcher.dispatch(&broker, delivery(r#"{"dynamic": {}}"#)).await;
        assert_eq!(
            outcome,
            DispatchOutcome::MissingField {
                key: "group".to_string()
            }
        );
        assert!(broker.rejects().await.is_empty());
        assert!(broker.acks().await.is_empty());

        let status = broker
            .published()
            .await
            .into_iter()
            .find(|p| p.topic == "step.reply")
            .unwrap();
        assert_eq!(
            status.body["data"],
            "Echo failed due to missing key: 'group'. Required Keys: group,hosts"
        );
    }
}
