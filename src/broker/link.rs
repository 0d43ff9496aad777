//! The broker link: drives a [`Transport`] through the connection lifecycle
//!
//! [`BrokerLink::run_forever`] loops on the action returned by the
//! [`LinkStateMachine`]: open, consume, wait to reconnect, close. Shutdown
//! requests are raced against every step except handler execution, so an
//! interrupt is honored between deliveries and during the reconnect wait.

use super::state::{ConnectionState, LinkAction, LinkEvent, LinkStateMachine, RECONNECT_DELAY};
use super::{BrokerHandle, DeliveryHandler, JSON_CONTENT_TYPE};
use crate::broker_span;
use crate::error::{WorkerError, WorkerResult};
use crate::observability::metrics;
use crate::protocol::QueueIdentity;
use crate::transport::{PublishProperties, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use serde_json::Value;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn, Instrument};

/// Connection owner and consume loop for one worker queue
pub struct BrokerLink<T: Transport> {
    transport: Arc<T>,
    queue: QueueIdentity,
    app_id: String,
    machine: Mutex<LinkStateMachine>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
}

impl<T: Transport> BrokerLink<T> {
    pub fn new<S: Into<String>>(transport: Arc<T>, queue: QueueIdentity, app_id: S) -> Self {
        Self::with_reconnect_delay(transport, queue, app_id, RECONNECT_DELAY)
    }

    pub fn with_reconnect_delay<S: Into<String>>(
        transport: Arc<T>,
        queue: QueueIdentity,
        app_id: S,
        reconnect_delay: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            transport,
            queue,
            app_id: app_id.into(),
            machine: Mutex::new(LinkStateMachine::new(reconnect_delay)),
            state_tx,
            shutdown_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Receiver notified on every state change
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn queue(&self) -> &QueueIdentity {
        &self.queue
    }

    /// Ask the run loop to close the connection and stop.
    ///
    /// Honored at the next loop step; a handler that is already running
    /// finishes first.
    pub fn request_shutdown(&self) {
        info!(queue = %self.queue, "Shutdown requested");
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Open the connection and start consuming.
    ///
    /// No-op when already connecting or open. A failed attempt leaves the
    /// link disconnected (or closed, for a protocol mismatch) and returns
    /// the error.
    pub async fn connect(&self) -> WorkerResult<()> {
        if self.transition(LinkEvent::ConnectRequested).await != LinkAction::Open {
            debug!(state = %self.state(), "Connect ignored, link already active");
            return Ok(());
        }

        metrics().connection_attempt();
        match self.transport.open(self.queue.name()).await {
            Ok(()) => {
                self.transition(LinkEvent::ChannelOpened).await;
                Ok(())
            }
            Err(e) => {
                let reason = error_chain(&e);
                let fatal = e.is_fatal();
                self.transition(LinkEvent::ConnectFailed {
                    reason: reason.clone(),
                    fatal,
                })
                .await;
                Err(if fatal {
                    WorkerError::ProtocolIncompatible(reason)
                } else {
                    WorkerError::Connection(reason)
                })
            }
        }
    }

    /// Run the connection lifecycle until the link is closed.
    ///
    /// Returns `Ok` after an intentional shutdown and
    /// [`WorkerError::ProtocolIncompatible`] when the broker can never be
    /// spoken to. Unexpected closes and failed connects are retried forever
    /// after the reconnect delay.
    pub async fn run_forever<H>(&self, handler: &H) -> WorkerResult<()>
    where
        H: DeliveryHandler + ?Sized,
    {
        let span = broker_span!(queue = %self.queue);
        async {
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let mut action = self.transition(LinkEvent::ConnectRequested).await;

            loop {
                if action == LinkAction::None {
                    action = self.machine.lock().await.resume_action();
                }

                let event = match action {
                    LinkAction::None => continue,
                    LinkAction::Open => self.open_step(&mut shutdown_rx).await,
                    LinkAction::Consume => self.consume_step(handler, &mut shutdown_rx).await,
                    LinkAction::ScheduleReconnect(delay) => {
                        self.reconnect_step(delay, &mut shutdown_rx).await
                    }
                    LinkAction::Close => self.close_step().await,
                    LinkAction::Terminate => {
                        info!("Broker link closed, stopping");
                        return Ok(());
                    }
                    LinkAction::Abort(reason) => {
                        error!(%reason, "Broker speaks an incompatible protocol, giving up");
                        return Err(WorkerError::ProtocolIncompatible(reason));
                    }
                };

                action = self.transition(event).await;
            }
        }
        .instrument(span)
        .await
    }

    async fn transition(&self, event: LinkEvent) -> LinkAction {
        let mut machine = self.machine.lock().await;
        let before = machine.state();
        let action = machine.apply(event);
        let after = machine.state();
        drop(machine);

        if before != after {
            match after {
                ConnectionState::ChannelOpen => metrics().connection_established(),
                ConnectionState::Disconnected => metrics().connection_lost(),
                ConnectionState::Closed => metrics().connection_closed(),
                _ => {}
            }
            self.state_tx.send_replace(after);
        }
        action
    }

    async fn open_step(&self, shutdown_rx: &mut watch::Receiver<bool>) -> LinkEvent {
        metrics().connection_attempt();
        debug!("Opening broker connection");
        tokio::select! {
            biased;
            _ = wait_for_shutdown(shutdown_rx) => LinkEvent::ShutdownRequested,
            result = self.transport.open(self.queue.name()) => match result {
                Ok(()) => LinkEvent::ChannelOpened,
                Err(e) => {
                    let reason = error_chain(&e);
                    warn!(%reason, "Could not connect to broker");
                    LinkEvent::ConnectFailed { reason, fatal: e.is_fatal() }
                }
            },
        }
    }

    async fn consume_step<H>(
        &self,
        handler: &H,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> LinkEvent
    where
        H: DeliveryHandler + ?Sized,
    {
        info!("Consuming deliveries");
        loop {
            let event = tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown_rx) => return LinkEvent::ShutdownRequested,
                event = self.transport.next_event() => event,
            };

            match event {
                TransportEvent::Delivery(delivery) => {
                    metrics().delivery_received();
                    handler.on_delivery(self, delivery).await;
                }
                TransportEvent::Closed { reason } => {
                    if !self.is_shutdown_requested() {
                        warn!(%reason, "Broker connection closed unexpectedly");
                    }
                    return LinkEvent::TransportClosed { reason };
                }
            }
        }
    }

    async fn reconnect_step(
        &self,
        delay: Duration,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> LinkEvent {
        metrics().reconnect_scheduled();
        info!(delay_secs = delay.as_secs_f64(), "Reconnecting after delay");
        tokio::select! {
            biased;
            _ = wait_for_shutdown(shutdown_rx) => LinkEvent::ShutdownRequested,
            _ = tokio::time::sleep(delay) => LinkEvent::ReconnectDelayElapsed,
        }
    }

    async fn close_step(&self) -> LinkEvent {
        info!("Closing broker connection");
        let reason = match self.transport.close().await {
            Ok(()) => "closed on request".to_string(),
            Err(e) => {
                let reason = error_chain(&e);
                warn!(%reason, "Broker connection did not close cleanly");
                reason
            }
        };
        LinkEvent::TransportClosed { reason }
    }

    fn ensure_channel_open(&self) -> WorkerResult<()> {
        match self.state() {
            ConnectionState::ChannelOpen => Ok(()),
            state => Err(WorkerError::NotConnected { state }),
        }
    }
}

#[async_trait]
impl<T: Transport> BrokerHandle for BrokerLink<T> {
    fn app_id(&self) -> &str {
        &self.app_id
    }

    async fn ack(&self, delivery_tag: u64) -> WorkerResult<()> {
        self.ensure_channel_open()?;
        debug!(delivery_tag, "Ack");
        self.transport.ack(delivery_tag).await?;
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> WorkerResult<()> {
        self.ensure_channel_open()?;
        debug!(delivery_tag, requeue, "Reject");
        self.transport.reject(delivery_tag, requeue).await?;
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
        self.ensure_channel_open()?;
        let payload = serde_json::to_vec(body)?;
        let properties = PublishProperties {
            app_id: self.app_id.clone(),
            correlation_id: correlation_id.to_string(),
            reply_to: reply_to.to_string(),
            content_type: JSON_CONTENT_TYPE.to_string(),
        };

        debug!(exchange, topic, correlation_id, "Publishing");
        self.transport
            .publish(exchange, topic, payload, &properties)
            .await?;
        Ok(())
    }
}

/// Resolves once shutdown was requested; never resolves if the sender is gone
async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    if shutdown_rx.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Error message with its source chain, `outer: inner: root`
fn error_chain(error: &TransportError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
