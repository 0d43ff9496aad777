//! Thread-safe worker metrics
//!
//! Atomic counters for deliveries, broker connectivity, the output relay and
//! notifications, plus a bounded window of handler durations. A snapshot is
//! logged when the worker stops.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Handler durations kept for percentile calculation
const MAX_DURATION_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and a mutex-guarded sample window
pub struct MetricsCollector {
    deliveries_received: AtomicU64,
    deliveries_completed: AtomicU64,
    parse_failures: AtomicU64,
    missing_field_failures: AtomicU64,
    handler_failures: AtomicU64,

    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connections_lost: AtomicU64,
    reconnects_scheduled: AtomicU64,

    output_published: AtomicU64,
    output_dropped: AtomicU64,
    notifications_sent: AtomicU64,
    notifications_failed: AtomicU64,

    handler_times: Mutex<Vec<u64>>, // milliseconds
    started_at: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            deliveries_received: AtomicU64::new(0),
            deliveries_completed: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            missing_field_failures: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            reconnects_scheduled: AtomicU64::new(0),
            output_published: AtomicU64::new(0),
            output_dropped: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            notifications_failed: AtomicU64::new(0),
            handler_times: Mutex::new(Vec::new()),
            started_at: AtomicU64::new(current_timestamp()),
        }
    }

    // Delivery metrics
    pub fn delivery_received(&self) {
        self.deliveries_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_completed(&self, duration: Duration) {
        self.deliveries_completed.fetch_add(1, Ordering::Relaxed);
        self.record_handler_time(duration);
    }

    pub fn parse_failed(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn missing_field(&self, duration: Duration) {
        self.missing_field_failures.fetch_add(1, Ordering::Relaxed);
        self.record_handler_time(duration);
    }

    pub fn handler_failed(&self, duration: Duration) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
        self.record_handler_time(duration);
    }

    fn record_handler_time(&self, duration: Duration) {
        if let Ok(mut times) = self.handler_times.lock() {
            times.push(duration.as_millis() as u64);
            if times.len() > MAX_DURATION_SAMPLES {
                times.remove(0);
            }
        }
    }

    // Broker metrics
    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn reconnect_scheduled(&self) {
        self.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    // Relay metrics
    pub fn output_published(&self) {
        self.output_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn output_dropped(&self) {
        self.output_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notification_sent(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notification_failed(&self) {
        self.notifications_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.deliveries_received,
            &self.deliveries_completed,
            &self.parse_failures,
            &self.missing_field_failures,
            &self.handler_failures,
            &self.connection_attempts,
            &self.connections_established,
            &self.connections_lost,
            &self.reconnects_scheduled,
            &self.output_published,
            &self.output_dropped,
            &self.notifications_sent,
            &self.notifications_failed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.connected.store(false, Ordering::Relaxed);
        self.started_at.store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut times) = self.handler_times.lock() {
            times.clear();
        }
    }

    /// Average and percentiles of recorded handler durations
    fn handler_time_statistics(&self) -> (f64, f64, f64) {
        let Ok(times) = self.handler_times.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0);
        }

        let mut sorted = times.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (avg, percentile(&sorted, 50.0), percentile(&sorted, 95.0))
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_handler_time_ms, handler_time_p50_ms, handler_time_p95_ms) =
            self.handler_time_statistics();

        MetricsSnapshot {
            deliveries: DeliveryMetrics {
                received: self.deliveries_received.load(Ordering::Relaxed),
                completed: self.deliveries_completed.load(Ordering::Relaxed),
                parse_failures: self.parse_failures.load(Ordering::Relaxed),
                missing_field_failures: self.missing_field_failures.load(Ordering::Relaxed),
                handler_failures: self.handler_failures.load(Ordering::Relaxed),
                avg_handler_time_ms,
                handler_time_p50_ms,
                handler_time_p95_ms,
            },
            broker: BrokerMetrics {
                connected: self.connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
            },
            relay: RelayMetrics {
                output_published: self.output_published.load(Ordering::Relaxed),
                output_dropped: self.output_dropped.load(Ordering::Relaxed),
                notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
                notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
            },
            uptime_seconds: now.saturating_sub(self.started_at.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub deliveries: DeliveryMetrics,
    pub broker: BrokerMetrics,
    pub relay: RelayMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct DeliveryMetrics {
    pub received: u64,
    pub completed: u64,
    pub parse_failures: u64,
    pub missing_field_failures: u64,
    pub handler_failures: u64,
    pub avg_handler_time_ms: f64,
    pub handler_time_p50_ms: f64,
    pub handler_time_p95_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct BrokerMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connections_lost: u64,
    pub reconnects_scheduled: u64,
}

#[derive(Debug, Serialize)]
pub struct RelayMetrics {
    pub output_published: u64,
    pub output_dropped: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0) * (sorted_data.len() - 1) as f64;
    let lower = sorted_data[index.floor() as usize] as f64;
    let upper = sorted_data[index.ceil() as usize] as f64;
    lower + (upper - lower) * index.fract()
}
