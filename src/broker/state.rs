//! Pure connection state machine for the broker link
//!
//! All transition decisions live here, free of I/O, so the reconnect loop and
//! the intentional-close path can be tested without a broker. The link feeds
//! events in and performs whatever [`LinkAction`] comes back.

use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

/// Fixed wait before reconnecting after an unexpected close
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Connection state of the broker link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    ChannelOpen,
    Closing,
    /// Terminal
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Initial connect or explicit `connect()` call
    ConnectRequested,
    /// Transport opened the connection and channel and is consuming
    ChannelOpened,
    /// Opening failed; `fatal` marks failures a retry cannot fix
    ConnectFailed { reason: String, fatal: bool },
    /// Transport reported the connection gone
    TransportClosed { reason: String },
    /// Operator asked the worker to stop
    ShutdownRequested,
    /// The reconnect wait is over
    ReconnectDelayElapsed,
}

/// What the link must do next
#[derive(Debug, Clone, PartialEq)]
pub enum LinkAction {
    /// Nothing to do for this event
    None,
    /// Open connection and channel
    Open,
    /// Pull deliveries
    Consume,
    /// Wait, then report [`LinkEvent::ReconnectDelayElapsed`]
    ScheduleReconnect(Duration),
    /// Close channel and connection, then report [`LinkEvent::TransportClosed`]
    Close,
    /// Stop the run loop successfully
    Terminate,
    /// Stop the run loop with a fatal error
    Abort(String),
}

/// Connection lifecycle with an intentional-close flag
#[derive(Debug, Clone)]
pub struct LinkStateMachine {
    state: ConnectionState,
    closing: bool,
    reconnect_delay: Duration,
    abort_reason: Option<String>,
}

impl Default for LinkStateMachine {
    fn default() -> Self {
        Self::new(RECONNECT_DELAY)
    }
}

impl LinkStateMachine {
    pub fn new(reconnect_delay: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            closing: false,
            reconnect_delay,
            abort_reason: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether an intentional close was requested
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    /// Why the link was closed by a fatal connect failure, if it was
    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    /// Apply an event and return the action it calls for
    pub fn apply(&mut self, event: LinkEvent) -> LinkAction {
        use ConnectionState::*;

        if self.state == Closed {
            return LinkAction::None;
        }

        let (next, action) = match (self.state, event) {
            (state, LinkEvent::ShutdownRequested) => {
                self.closing = true;
                match state {
                    Connecting | ChannelOpen => (Closing, LinkAction::Close),
                    Disconnected => (Closed, LinkAction::Terminate),
                    other => (other, LinkAction::None),
                }
            }

            (Disconnected, LinkEvent::ConnectRequested)
            | (Disconnected, LinkEvent::ReconnectDelayElapsed) => (Connecting, LinkAction::Open),

            (Connecting, LinkEvent::ChannelOpened) => (ChannelOpen, LinkAction::Consume),
            // Shutdown raced the open; undo it
            (Closing, LinkEvent::ChannelOpened) => (Closing, LinkAction::Close),

            (Connecting, LinkEvent::ConnectFailed { reason, fatal: true }) => {
                self.abort_reason = Some(reason.clone());
                (Closed, LinkAction::Abort(reason))
            }
            (Connecting, LinkEvent::ConnectFailed { .. })
            | (Connecting, LinkEvent::TransportClosed { .. })
            | (ChannelOpen, LinkEvent::TransportClosed { .. }) => {
                (Disconnected, LinkAction::ScheduleReconnect(self.reconnect_delay))
            }

            (Closing, LinkEvent::TransportClosed { .. })
            | (Closing, LinkEvent::ConnectFailed { .. }) => (Closed, LinkAction::Terminate),

            (state, _) => (state, LinkAction::None),
        };

        log_state_transition(self.state, next);
        self.state = next;
        action
    }

    /// Action that resumes progress from the current state when the last
    /// event produced none
    pub fn resume_action(&self) -> LinkAction {
        match self.state {
            ConnectionState::Disconnected if self.closing => LinkAction::Terminate,
            ConnectionState::Disconnected => LinkAction::ScheduleReconnect(self.reconnect_delay),
            ConnectionState::Connecting => LinkAction::Open,
            ConnectionState::ChannelOpen => LinkAction::Consume,
            ConnectionState::Closing => LinkAction::Close,
            ConnectionState::Closed => match &self.abort_reason {
                Some(reason) => LinkAction::Abort(reason.clone()),
                None => LinkAction::Terminate,
            },
        }
    }
}

/// Log connection state transition
fn log_state_transition(from: ConnectionState, to: ConnectionState) {
    if from == to {
        return;
    }
    match (from, to) {
        (ConnectionState::Connecting, ConnectionState::ChannelOpen) => {
            info!("Broker connection established");
        }
        (ConnectionState::ChannelOpen, ConnectionState::Disconnected) => {
            warn!("Broker connection lost");
        }
        (ConnectionState::Connecting, ConnectionState::Closed) => {
            error!("Broker connection failed permanently");
        }
        _ => {
            info!("Broker connection state: {:?} -> {:?}", from, to);
        }
    }
}
