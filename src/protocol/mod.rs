//! Wire documents and naming rules for worker traffic
//!
//! Inbound deliveries carry a JSON document; outbound traffic is one of three
//! JSON shapes (status on the reply-to topic, output lines, notifications).

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
