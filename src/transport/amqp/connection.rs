//! Pure connection helpers for the AMQP client

use crate::transport::{PublishProperties, RawDelivery, TransportError};
use lapin::message::Delivery;
use lapin::types::ShortString;
use lapin::BasicProperties;

/// Deliveries the broker may push before the previous one is settled
pub const PREFETCH_COUNT: u16 = 1;

/// Reply code for a normal, requested close
pub const NORMAL_CLOSE_CODE: u16 = 200;

/// Map a connect-time failure. Protocol mismatches are fatal; anything else
/// (refused socket, bad credentials, unknown vhost) is worth retrying.
pub fn classify_connect_error(error: lapin::Error) -> TransportError {
    match error {
        lapin::Error::InvalidProtocolVersion(version) => TransportError::ProtocolIncompatible(
            format!("broker answered with protocol version {version}"),
        ),
        other => TransportError::ConnectionFailed(Box::new(other)),
    }
}

/// Unique consumer tag for a queue, so broker-side listings show who consumes
pub fn consumer_tag(queue: &str) -> String {
    format!("{queue}-{}", uuid::Uuid::new_v4().simple())
}

/// Convert publish metadata to AMQP basic properties
pub fn basic_properties(properties: &PublishProperties) -> BasicProperties {
    BasicProperties::default()
        .with_app_id(ShortString::from(properties.app_id.clone()))
        .with_correlation_id(ShortString::from(properties.correlation_id.clone()))
        .with_reply_to(ShortString::from(properties.reply_to.clone()))
        .with_content_type(ShortString::from(properties.content_type.clone()))
}

/// Convert a lapin delivery into the transport-neutral form
pub fn raw_delivery(delivery: Delivery) -> RawDelivery {
    let properties = &delivery.properties;
    RawDelivery {
        delivery_tag: delivery.delivery_tag,
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        reply_to: properties
            .reply_to()
            .as_ref()
            .map(|topic| topic.as_str().to_string()),
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        body: delivery.data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_mismatch_is_fatal() {
        let error = classify_connect_error(lapin::Error::InvalidProtocolVersion(amq_protocol::frame::ProtocolVersion { major: 1, minor: 0, revision: 0 }));
        assert!(matches!(error, TransportError::ProtocolIncompatible(_)));
        assert!(error.is_fatal());
    }

    #[test]
    fn test_other_connect_errors_are_retryable() {
        let error = classify_connect_error(lapin::Error::ChannelsLimitReached);
        assert!(matches!(error, TransportError::ConnectionFailed(_)));
        assert!(!error.is_fatal());
    }

    #[test]
    fn test_consumer_tag_is_unique_per_call() {
        let first = consumer_tag("worker.shellexec");
        let second = consumer_tag("worker.shellexec");
        assert!(first.starts_with("worker.shellexec-"));
        assert_ne!(first, second);
    }

    #[test]
    fn test_basic_properties_mapping() {
        let properties = basic_properties(&PublishProperties {
            app_id: "shellexec".to_string(),
            correlation_id: "123".to_string(),
            reply_to: "log".to_string(),
            content_type: "application/json".to_string(),
        });

        assert_eq!(
            properties.app_id().as_ref().map(|s| s.as_str()),
            Some("shellexec")
        );
        assert_eq!(
            properties.correlation_id().as_ref().map(|s| s.as_str()),
            Some("123")
        );
        assert_eq!(
            properties.reply_to().as_ref().map(|s| s.as_str()),
            Some("log")
        );
    }
}
