//! Impure I/O operations for the AMQP client
//!
//! Wraps a lapin connection, one channel and one consumer. The broker link
//! decides when to open and close; this type only performs the calls.

use super::connection::{
    basic_properties, classify_connect_error, consumer_tag, raw_delivery, NORMAL_CLOSE_CODE,
    PREFETCH_COUNT,
};
use crate::config::{BrokerConfig, ConfigError};
use crate::transport::{PublishProperties, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct Session {
    connection: Connection,
    channel: Channel,
}

/// AMQP transport for worker processes
pub struct AmqpClient {
    uri: String,
    redacted_uri: String,
    session: Mutex<Option<Session>>,
    consumer: Mutex<Option<Consumer>>,
}

impl AmqpClient {
    pub fn new(config: &BrokerConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            uri: config.amqp_uri()?,
            redacted_uri: config.redacted_uri(),
            session: Mutex::new(None),
            consumer: Mutex::new(None),
        })
    }

    /// Close whatever session is still held, so a reopen never orphans a
    /// live connection. Errors are logged; the session is gone either way.
    async fn retire_session(&self, reason: &str) -> Result<(), TransportError> {
        self.consumer.lock().await.take();
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };

        debug!(reason, "Closing previous AMQP session");
        if session.channel.status().connected() {
            if let Err(e) = session.channel.close(NORMAL_CLOSE_CODE, reason).await {
                warn!(error = %e, "Channel could not be closed cleanly");
            }
        }
        if !session.connection.status().connected() {
            return Ok(());
        }
        session
            .connection
            .close(NORMAL_CLOSE_CODE, reason)
            .await
            .map_err(|e| TransportError::CloseFailed(Box::new(e)))
    }

    async fn channel(&self) -> Result<Channel, TransportError> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.channel.clone())
            .ok_or(TransportError::ChannelClosed)
    }
}

#[async_trait]
impl Transport for AmqpClient {
    async fn open(&self, queue: &str) -> Result<(), TransportError> {
        if let Err(e) = self.retire_session("Reconnecting").await {
            warn!(error = %e, "Previous connection did not close cleanly");
        }

        debug!(uri = %self.redacted_uri, "Opening AMQP connection");
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(classify_connect_error)?;

        debug!("Attempting to open channel...");
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::ConnectionFailed(Box::new(e)))?;

        channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await
            .map_err(|e| TransportError::ConsumeFailed(Box::new(e)))?;

        let tag = consumer_tag(queue);
        let consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::ConsumeFailed(Box::new(e)))?;

        info!(queue, consumer_tag = %tag, "Connection and channel open");
        *self.consumer.lock().await = Some(consumer);
        *self.session.lock().await = Some(Session {
            connection,
            channel,
        });
        Ok(())
    }

    async fn next_event(&self) -> TransportEvent {
        let mut guard = self.consumer.lock().await;
        let Some(consumer) = guard.as_mut() else {
            return TransportEvent::Closed {
                reason: "no active consumer".to_string(),
            };
        };

        let reason = match consumer.next().await {
            Some(Ok(delivery)) => return TransportEvent::Delivery(raw_delivery(delivery)),
            Some(Err(e)) => e.to_string(),
            None => "consumer stream ended".to_string(),
        };
        drop(guard);

        // A channel-level close ends the stream while the connection lives on
        if let Err(e) = self.retire_session(&reason).await {
            warn!(error = %e, "Connection did not close after consumer ended");
        }
        TransportEvent::Closed { reason }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.channel()
            .await?
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| TransportError::SettleFailed {
                delivery_tag,
                source: Box::new(e),
            })
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.channel()
            .await?
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| TransportError::SettleFailed {
                delivery_tag,
                source: Box::new(e),
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: &PublishProperties,
    ) -> Result<(), TransportError> {
        let publish_failed = |e: lapin::Error| TransportError::PublishFailed {
            routing_key: routing_key.to_string(),
            source: Box::new(e),
        };

        self.channel()
            .await?
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                basic_properties(properties),
            )
            .await
            .map_err(publish_failed)?
            .await
            .map_err(publish_failed)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.retire_session("Normal shutdown").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config(port: u16) -> BrokerConfig {
        BrokerConfig {
            host: "127.0.0.1".to_string(),
            port,
            vhost: "/".to_string(),
            user: "guest".to_string(),
            password: "guest".to_string(),
            use_tls: false,
        }
    }

    #[tokio::test]
    async fn test_refused_connection_leaves_no_session() {
        let client = AmqpClient::new(&local_config(1)).unwrap();

        let error = client.open("worker.test").await.unwrap_err();
        assert!(matches!(error, TransportError::ConnectionFailed(_)));
        assert!(matches!(
            client.channel().await,
            Err(TransportError::ChannelClosed)
        ));
        assert!(client.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_next_event_without_consumer_reports_closed() {
        let client = AmqpClient::new(&local_config(1)).unwrap();
        assert!(matches!(
            client.next_event().await,
            TransportEvent::Closed { .. }
        ));
    }

    #[tokio::test]
    #[ignore] // Requires a RabbitMQ broker on localhost:5672 with a worker.test queue
    async fn test_reopen_closes_previous_connection() {
        let client = AmqpClient::new(&local_config(5672)).unwrap();

        client.open("worker.test").await.unwrap();
        let first = client.channel().await.unwrap();
        assert!(first.status().connected());

        client.open("worker.test").await.unwrap();
        assert!(!first.status().connected());
        assert!(client.channel().await.unwrap().status().connected());

        client.close().await.unwrap();
    }
}
