//! Queue and topic naming

use std::fmt;

/// Every worker queue name starts with this prefix
pub const QUEUE_PREFIX: &str = "worker.";

/// Topic for output relay lines
pub const OUTPUT_TOPIC: &str = "output";

/// Prefix for notification topics, followed by the destination suffix
pub const NOTIFY_TOPIC_PREFIX: &str = "notify.";

/// Exchange used by `publish` unless the caller picks another
pub const DEFAULT_EXCHANGE: &str = "re";

/// The broker's default (direct) exchange
pub const DIRECT_EXCHANGE: &str = "";

/// `reply_to` metadata attached to outbound publishes
pub const DEFAULT_REPLY_TO: &str = "log";

/// The queue a worker consumes from: `worker.<suffix>`.
///
/// The suffix is the explicit override when one is configured, otherwise the
/// lowercased worker type name. Fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueIdentity {
    name: String,
}

impl QueueIdentity {
    pub fn new(worker_name: &str, queue_override: Option<&str>) -> Self {
        let suffix = match queue_override {
            Some(custom) if !custom.is_empty() => custom.to_string(),
            _ => worker_name.to_lowercase(),
        };
        Self {
            name: format!("{QUEUE_PREFIX}{suffix}"),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for QueueIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Outbound topic construction
pub struct TopicBuilder;

impl TopicBuilder {
    /// Build notification topic: `notify.{suffix}`
    pub fn build_notify_topic(suffix: &str) -> String {
        format!("{NOTIFY_TOPIC_PREFIX}{suffix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_queue_from_worker_name() {
        assert_eq!(QueueIdentity::new("Worker", None).name(), "worker.worker");
        assert_eq!(
            QueueIdentity::new("ShellExec", None).name(),
            "worker.shellexec"
        );
    }

    #[test]
    fn test_queue_override() {
        assert_eq!(
            QueueIdentity::new("ShellExec", Some("shell-prod")).name(),
            "worker.shell-prod"
        );
        // An empty override falls back to the worker name
        assert_eq!(
            QueueIdentity::new("ShellExec", Some("")).name(),
            "worker.shellexec"
        );
    }

    #[test]
    fn test_topic_construction() {
        assert_eq!(TopicBuilder::build_notify_topic("irc"), "notify.irc");
    }

    proptest! {
        #[test]
        fn queue_name_always_prefixed(name in "[A-Za-z]{1,20}", custom in proptest::option::of("[a-z.-]{0,12}")) {
            let queue = QueueIdentity::new(&name, custom.as_deref());
            prop_assert!(queue.name().starts_with(QUEUE_PREFIX));
            prop_assert!(queue.name().len() > QUEUE_PREFIX.len());
        }
    }
}
