//! Analytics event emission.

use tracing::info;

/// Transfer summary for one proxied connection: total bytes, bucketed
/// port, socket lifetime.
pub const EVENT_BYTES: &str = "bytes";

/// Early-reset retry outcome: bytes/chunks uploaded before the reset,
/// split length, whether the retry carried data.
pub const EVENT_EARLY_RESET: &str = "early_reset";

/// Fire-and-forget sink for analytics events.
///
/// `emit` must never block the relay; implementations that forward to a
/// remote collector are expected to buffer or drop.
pub trait MetricsSink: Send + Sync {
    fn emit(&self, event: &str, fields: &[(&'static str, i64)]);
}

/// Sink that writes events to the tracing log.
#[derive(Debug, Default)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn emit(&self, event: &str, fields: &[(&'static str, i64)]) {
        info!(target: "split_relay::metrics", event, ?fields, "analytics event");
    }
}
