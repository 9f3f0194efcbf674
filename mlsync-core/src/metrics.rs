//! Metrics for the conversation engine
//!
//! Thin wrappers over the `metrics` facade. No exporter is installed here;
//! host processes attach whichever recorder they run.

use ::metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Instant;

pub const MESSAGES_BUFFERED: &str = "mls.messages.buffered";
pub const MESSAGES_PROCESSED: &str = "mls.messages.processed";
pub const MESSAGES_PLACEHOLDERS: &str = "mls.messages.placeholders";
pub const MESSAGES_ENCRYPTED: &str = "mls.messages.encrypted";
pub const RECOVERY_TRIGGERED: &str = "mls.recovery.triggered";
pub const COMMITS_DISCARDED: &str = "mls.commits.discarded";
pub const COMMITS_APPLIED: &str = "mls.commits.applied";
pub const SYNC_COMPLETED: &str = "mls.sync.completed";
pub const SYNC_DURATION: &str = "mls.sync.duration_ms";

/// Register metric descriptions with the installed recorder
pub fn init_metrics() {
    describe_counter!(MESSAGES_BUFFERED, "Inbound messages parked until a gap fills");
    describe_counter!(MESSAGES_PROCESSED, "Inbound messages applied in sequence order");
    describe_counter!(MESSAGES_PLACEHOLDERS, "Placeholders stored for undecryptable messages");
    describe_counter!(MESSAGES_ENCRYPTED, "Outbound application messages encrypted");
    describe_counter!(RECOVERY_TRIGGERED, "Automatic rejoin requests issued");
    describe_counter!(COMMITS_DISCARDED, "Pending commits discarded after a failed submit");
    describe_counter!(COMMITS_APPLIED, "Server commits applied during catch-up");
    describe_counter!(SYNC_COMPLETED, "Completed conversation list syncs");
    describe_histogram!(SYNC_DURATION, "Conversation list sync duration in milliseconds");
}

/// Record a counter metric
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Record a histogram metric
pub fn record_histogram(name: &'static str, value: f64) {
    histogram!(name).record(value);
}

/// Timer for measuring operation duration
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Stop the timer and record the duration in milliseconds
    pub fn stop(self) {
        record_histogram(self.name, self.start.elapsed().as_secs_f64() * 1000.0);
    }
}
