//! reworker - message-queue worker runtime
//!
//! A worker consumes JSON messages from its own AMQP queue
//! (`worker.<name>`), runs user code for each one and answers through the
//! broker: status documents on the message's reply-to topic, log lines on
//! `output` and notifications on `notify.<destination>`.
//!
//! # Overview
//!
//! - [`broker`] - connection state machine, reconnect loop and the
//!   ack/reject/publish handle
//! - [`dispatch`] - the [`Worker`] trait and the per-message pipeline
//! - [`output`] - level-filtered output relay bound to one correlation id
//! - [`notify`] - notification fan-out driven by the message's `notify` block
//! - [`transport`] - the broker-client seam and its `lapin` implementation
//! - [`runner`] - command line entry point for worker binaries
//!
//! # Quick Start
//!
//! ```no_run
//! use async_trait::async_trait;
//! use reworker::dispatch::{DispatchContext, HandlerError, Worker};
//! use reworker::protocol::StatusMessage;
//!
//! struct Greeter;
//!
//! #[async_trait]
//! impl Worker for Greeter {
//!     fn name(&self) -> &str {
//!         "Greeter"
//!     }
//!
//!     fn dynamic_fields(&self) -> &[&'static str] {
//!         &["who"]
//!     }
//!
//!     async fn process(&self, ctx: &mut DispatchContext<'_>) -> Result<(), HandlerError> {
//!         let who = ctx.dynamic_str("who")?.to_string();
//!         ctx.ack().await?;
//!         ctx.output().info(&format!("Hello, {who}")).await?;
//!         ctx.reply(&StatusMessage::completed()).await?;
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     reworker::observability::init_default_logging();
//!     if let Err(e) = reworker::runner::run(Greeter).await {
//!         eprintln!("{e}");
//!         std::process::exit(1);
//!     }
//! }
//! ```

pub mod broker;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod notify;
pub mod observability;
pub mod output;
pub mod protocol;
pub mod runner;
pub mod testing;
pub mod transport;
pub mod workers;

pub use broker::{BrokerHandle, BrokerLink, ConnectionState};
pub use config::{BrokerConfig, ConfigError, WorkerConfig};
pub use dispatch::{DispatchContext, DispatchOutcome, HandlerError, MessageDispatcher, Worker};
pub use error::{WorkerError, WorkerResult};
pub use notify::NotificationRouter;
pub use output::{OutputChannel, OutputLevel};
pub use protocol::{MessageEnvelope, NotifyConfig, QueueIdentity, StatusMessage};
