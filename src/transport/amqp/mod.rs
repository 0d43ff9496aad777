//! AMQP 0-9-1 transport built on `lapin`
//!
//! - [`connection`] - pure helpers: error classification, consumer tags, property mapping
//! - [`client`] - the I/O side implementing [`crate::transport::Transport`]

pub mod client;
pub mod connection;

pub use client::AmqpClient;
pub use connection::{classify_connect_error, consumer_tag, PREFETCH_COUNT};
