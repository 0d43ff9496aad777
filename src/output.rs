//! Per-message output relay
//!
//! An [`OutputChannel`] acts like a logger bound to one correlation id, except
//! that lines at or above its threshold are published to the `output` topic
//! for whoever requested the work. Lines below the threshold are dropped.

use crate::broker::BrokerHandle;
use crate::error::WorkerResult;
use crate::observability::metrics;
use crate::protocol::topics::{DEFAULT_EXCHANGE, DEFAULT_REPLY_TO, OUTPUT_TOPIC};
use crate::protocol::OutputMessage;
use std::fmt;
use tracing::{debug, trace};

/// Severity of an output line, ordered by rank
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum OutputLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl OutputLevel {
    /// Parse a level name, case-insensitively. WARN and FATAL are aliases.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_uppercase().as_str() {
            "DEBUG" => Some(Self::Debug),
            "INFO" => Some(Self::Info),
            "WARN" | "WARNING" => Some(Self::Warning),
            "ERROR" => Some(Self::Error),
            "CRITICAL" | "FATAL" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Numeric rank: 10, 20, 30, 40, 50
    pub fn rank(self) -> u8 {
        match self {
            Self::Debug => 10,
            Self::Info => 20,
            Self::Warning => 30,
            Self::Error => 40,
            Self::Critical => 50,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for OutputLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Level-filtered relay publishing `{message}` documents to `output`
pub struct OutputChannel<'a> {
    broker: &'a dyn BrokerHandle,
    correlation_id: String,
    threshold: OutputLevel,
}

impl<'a> OutputChannel<'a> {
    /// New channel at the default INFO threshold
    pub fn new<S: Into<String>>(broker: &'a dyn BrokerHandle, correlation_id: S) -> Self {
        Self {
            broker,
            correlation_id: correlation_id.into(),
            threshold: OutputLevel::default(),
        }
    }

    /// Set the threshold from a level name.
    ///
    /// Unknown names leave the threshold unchanged and return false, so a bad
    /// `OUTPUT_LEVEL` setting cannot take a worker down.
    pub fn set_level(&mut self, name: &str) -> bool {
        match OutputLevel::parse(name) {
            Some(level) => {
                self.threshold = level;
                true
            }
            None => {
                debug!(level = name, "Ignoring unknown output level");
                false
            }
        }
    }

    pub fn level(&self) -> OutputLevel {
        self.threshold
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Whether a line at `level` would be published
    pub fn enabled(&self, level: OutputLevel) -> bool {
        level >= self.threshold
    }

    /// Publish `message` if `level` meets the threshold
    pub async fn log(&self, level: OutputLevel, message: &str) -> WorkerResult<()> {
        if !self.enabled(level) {
            trace!(%level, threshold = %self.threshold, "Output line below threshold");
            metrics().output_dropped();
            return Ok(());
        }

        let body = serde_json::to_value(OutputMessage {
            message: message.to_string(),
        })?;
        self.broker
            .publish(
                OUTPUT_TOPIC,
                &self.correlation_id,
                &body,
                DEFAULT_EXCHANGE,
                DEFAULT_REPLY_TO,
            )
            .await?;
        metrics().output_published();
        Ok(())
    }

    pub async fn debug(&self, message: &str) -> WorkerResult<()> {
        self.log(OutputLevel::Debug, message).await
    }

    pub async fn info(&self, message: &str) -> WorkerResult<()> {
        self.log(OutputLevel::Info, message).await
    }

    pub async fn warn(&self, message: &str) -> WorkerResult<()> {
        self.log(OutputLevel::Warning, message).await
    }

    pub async fn warning(&self, message: &str) -> WorkerResult<()> {
        self.log(OutputLevel::Warning, message).await
    }

    pub async fn error(&self, message: &str) -> WorkerResult<()> {
        self.log(OutputLevel::Error, message).await
    }

    pub async fn critical(&self, message: &str) -> WorkerResult<()> {
        self.log(OutputLevel::Critical, message).await
    }

    pub async fn fatal(&self, message: &str) -> WorkerResult<()> {
        self.log(OutputLevel::Critical, message).await
    }
}
