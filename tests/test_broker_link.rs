//! Broker link lifecycle tests against the mock transport
//!
//! Covers the reconnect loop, intentional shutdown, protocol abort and the
//! rules for ack/reject/publish around the channel state.


use async_trait::async_trait;
use reworker::broker::{BrokerHandle, ConnectionState, DeliveryHandler};
use reworker::error::WorkerError;
use reworker::testing::{MockTransport, OpenOutcome};
use reworker::transport::RawDelivery;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{delivery, test_link, wait_for_state};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// Acks every delivery and remembers the tags in order
#[derive(Default)]
struct AckAll {
    seen: Mutex<Vec<u64>>,
}

#[async_trait]
impl DeliveryHandler for AckAll {
    async fn on_delivery(&self, broker: &dyn BrokerHandle, delivery: RawDelivery) {
        self.seen.lock().await.push(delivery.delivery_tag);
        broker.ack(delivery.delivery_tag).await.unwrap();
    }
}

/// Holds the first delivery open until the test releases it
#[derive(Default)]
struct GatedAck {
    seen: Mutex<Vec<u64>>,
    started: Notify,
    gate: Notify,
}

#[async_trait]
impl DeliveryHandler for GatedAck {
    async fn on_delivery(&self, broker: &dyn BrokerHandle, delivery: RawDelivery) {
        self.seen.lock().await.push(delivery.delivery_tag);
        self.started.notify_one();
        self.gate.notified().await;
        broker.ack(delivery.delivery_tag).await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_close_reconnects_after_fixed_delay() {
    let transport = Arc::new(MockTransport::new());
    let link = test_link(&transport);
    let handler = AckAll::default();

    let driver = async {
        wait_for_state(&link, ConnectionState::ChannelOpen).await;
        let dropped_at = Instant::now();
        transport.drop_connection("CONNECTION_FORCED - broker forced connection closure");

        wait_for_state(&link, ConnectionState::Disconnected).await;
        wait_for_state(&link, ConnectionState::ChannelOpen).await;
        assert!(dropped_at.elapsed() >= Duration::from_secs(5));
        assert_eq!(transport.open_calls(), 2);

        link.request_shutdown();
    };

    let (result, ()) = tokio::join!(link.run_forever(&handler), driver);
    assert!(result.is_ok());
    assert_eq!(link.state(), ConnectionState::Closed);
    assert_eq!(transport.close_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failures_retry_without_limit() {
    let transport = Arc::new(MockTransport::with_open_script(vec![
        OpenOutcome::Fail("ACCESS_REFUSED".to_string()),
        OpenOutcome::Fail("connection refused".to_string()),
        OpenOutcome::Fail("NOT_ALLOWED - vhost not found".to_string()),
    ]));
    let link = test_link(&transport);
    let handler = AckAll::default();
    let started = Instant::now();

    let driver = async {
        wait_for_state(&link, ConnectionState::ChannelOpen).await;
        assert_eq!(transport.open_calls(), 4);
        // Three waits of exactly the fixed delay, no backoff growth
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert!(started.elapsed() < Duration::from_secs(16));
        link.request_shutdown();
    };

    let (result, ()) = tokio::join!(link.run_forever(&handler), driver);
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_protocol_mismatch_aborts_without_retry() {
    let transport = Arc::new(MockTransport::with_open_script(vec![
        OpenOutcome::Incompatible("broker answered with protocol version 1".to_string()),
    ]));
    let link = test_link(&transport);

    let result = link.run_forever(&AckAll::default()).await;
    assert!(matches!(result, Err(WorkerError::ProtocolIncompatible(_))));
    assert!(result.unwrap_err().is_fatal());
    assert_eq!(transport.open_calls(), 1);
    assert_eq!(link.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_deliveries_are_handled_in_order() {
    let transport = Arc::new(MockTransport::new());
    let link = test_link(&transport);
    let handler = AckAll::default();

    for tag in 1..=3 {
        transport.push_delivery(delivery(tag, "{}"));
    }

    let driver = async {
        wait_for_state(&link, ConnectionState::ChannelOpen).await;
        while transport.get_acks().await.len() < 3 {
            tokio::task::yield_now().await;
        }
        link.request_shutdown();
    };

    let (result, ()) = tokio::join!(link.run_forever(&handler), driver);
    assert!(result.is_ok());
    assert_eq!(*handler.seen.lock().await, vec![1, 2, 3]);
    assert_eq!(transport.get_acks().await, vec![1, 2, 3]);
    assert_eq!(transport.opened_queues().await, vec!["worker.test"]);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_reconnect_wait_stops_immediately() {
    let transport = Arc::new(MockTransport::with_open_script(vec![OpenOutcome::Fail(
        "connection refused".to_string(),
    )]));
    let link = test_link(&transport);
    let started = Instant::now();

    let driver = async {
        wait_for_state(&link, ConnectionState::Disconnected).await;
        tokio::task::yield_now().await;
        link.request_shutdown();
    };

    let handler = AckAll::default();
    let (result, ()) = tokio::join!(link.run_forever(&handler), driver);
    assert!(result.is_ok());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(transport.open_calls(), 1);
    assert_eq!(link.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_shutdown_requested_before_run_closes_cleanly() {
    let transport = Arc::new(MockTransport::new());
    let link = test_link(&transport);

    link.request_shutdown();
    let result = link.run_forever(&AckAll::default()).await;

    assert!(result.is_ok());
    assert_eq!(link.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_shutdown_lets_running_handler_finish() {
    let transport = Arc::new(MockTransport::new());
    let link = test_link(&transport);
    let handler = GatedAck::default();

    transport.push_delivery(delivery(1, "{}"));
    transport.push_delivery(delivery(2, "{}"));

    let driver = async {
        handler.started.notified().await;
        link.request_shutdown();
        assert_eq!(link.state(), ConnectionState::ChannelOpen);
        handler.gate.notify_one();
    };

    let (result, ()) = tokio::join!(link.run_forever(&handler), driver);
    assert!(result.is_ok());

    // The in-flight ack landed, the queued delivery was never dispatched
    assert_eq!(transport.get_acks().await, vec![1]);
    assert_eq!(*handler.seen.lock().await, vec![1]);
    assert_eq!(transport.close_calls(), 1);
    assert_eq!(link.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_run_after_fatal_connect_reports_the_abort() {
    let transport = Arc::new(MockTransport::with_open_script(vec![
        OpenOutcome::Incompatible("broker answered with protocol version 1".to_string()),
    ]));
    let link = test_link(&transport);

    let error = link.connect().await.unwrap_err();
    assert!(matches!(error, WorkerError::ProtocolIncompatible(_)));

    let result = link.run_forever(&AckAll::default()).await;
    assert!(matches!(
        result,
        Err(WorkerError::ProtocolIncompatible(ref reason)) if reason.contains("protocol version 1")
    ));
    assert_eq!(transport.open_calls(), 1);
    assert_eq!(link.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let transport = Arc::new(MockTransport::new());
    let link = test_link(&transport);

    link.connect().await.unwrap();
    link.connect().await.unwrap();

    assert_eq!(link.state(), ConnectionState::ChannelOpen);
    assert_eq!(transport.open_calls(), 1);
}

#[tokio::test]
async fn test_failed_connect_reports_error_and_disconnects() {
    let transport = Arc::new(MockTransport::with_open_script(vec![OpenOutcome::Fail(
        "connection refused".to_string(),
    )]));
    let link = test_link(&transport);

    let error = link.connect().await.unwrap_err();
    assert!(matches!(error, WorkerError::Connection(ref reason) if reason.contains("refused")));
    assert_eq!(link.state(), ConnectionState::Disconnected);

    link.connect().await.unwrap();
    assert_eq!(link.state(), ConnectionState::ChannelOpen);
}

#[tokio::test]
async fn test_publish_attaches_envelope_metadata() {
    let transport = Arc::new(MockTransport::new());
    let link = test_link(&transport);
    link.connect().await.unwrap();

    link.publish("output", "42", &json!({"message": "hi"}), "re", "log")
        .await
        .unwrap();

    let published = transport.get_published_messages().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].exchange, "re");
    assert_eq!(published[0].topic, "output");
    assert_eq!(published[0].correlation_id, "42");
    assert_eq!(published[0].reply_to, "log");
    assert_eq!(published[0].app_id, "test");
    assert_eq!(published[0].body, json!({"message": "hi"}));
}

#[tokio::test]
async fn test_publish_failure_is_surfaced() {
    let transport = Arc::new(MockTransport::new());
    transport.fail_publishes_to("notify.irc").await;
    let link = test_link(&transport);
    link.connect().await.unwrap();

    let result = link
        .publish("notify.irc", "1", &json!({}), "", "log")
        .await;
    assert!(matches!(result, Err(WorkerError::Transport(_))));
}

#[tokio::test]
async fn test_settling_requires_open_channel() {
    let transport = Arc::new(MockTransport::new());
    let link = test_link(&transport);

    let error = link.ack(1).await.unwrap_err();
    assert!(matches!(
        error,
        WorkerError::NotConnected {
            state: ConnectionState::Disconnected
        }
    ));

    link.connect().await.unwrap();
    link.reject(2, false).await.unwrap();
    assert_eq!(transport.get_rejects().await, vec![(2, false)]);
}

#[tokio::test]
async fn test_ack_after_shutdown_fails() {
    let transport = Arc::new(MockTransport::new());
    let link = test_link(&transport);
    link.connect().await.unwrap();

    link.request_shutdown();
    link.run_forever(&AckAll::default()).await.unwrap();

    assert!(matches!(
        link.ack(1).await,
        Err(WorkerError::NotConnected {
            state: ConnectionState::Closed
        })
    ));
    assert!(transport.get_acks().await.is_empty());
}
