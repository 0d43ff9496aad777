//! Broker link: connection lifecycle and the handle given to message handlers
//!
//! - [`state`] - pure [`LinkStateMachine`] deciding every transition
//! - [`link`] - [`BrokerLink`], which performs the machine's actions against a
//!   [`crate::transport::Transport`] and runs the consume loop

pub mod link;
pub mod state;

pub use link::BrokerLink;
pub use state::{ConnectionState, LinkAction, LinkEvent, LinkStateMachine, RECONNECT_DELAY};

use crate::error::WorkerResult;
use crate::transport::RawDelivery;
use async_trait::async_trait;
use serde_json::Value;

/// Content type attached to every publish
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Operations available to code that handles a delivery
///
/// `ack` and `reject` are only valid while the channel is open; calling them
/// afterwards returns [`crate::error::WorkerError::NotConnected`]. Publish
/// failures are returned to the caller, never retried.
#[async_trait]
pub trait BrokerHandle: Send + Sync {
    /// `app_id` stamped on outbound publishes
    fn app_id(&self) -> &str;

    async fn ack(&self, delivery_tag: u64) -> WorkerResult<()>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> WorkerResult<()>;

    /// Serialize `body` as JSON and publish it to `topic` on `exchange`,
    /// tagged with `correlation_id` and `reply_to`
    async fn publish(
        &self,
        topic: &str,
        correlation_id: &str,
        body: &Value,
        exchange: &str,
        reply_to: &str,
    ) -> WorkerResult<()>;
}

/// Receives each consumed delivery, one at a time
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Handle one delivery. The link does not fetch the next delivery until
    /// this returns.
    async fn on_delivery(&self, broker: &dyn BrokerHandle, delivery: RawDelivery);
}
