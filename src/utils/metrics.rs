//! Metrics sink for named span events.
//!
//! The core never keeps global timers; it reports how long each phase of
//! the calling loop took to whatever sink was injected.

use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait MetricsSink: Send + Sync {
    fn span(&self, name: &'static str, elapsed: Duration);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn span(&self, _name: &'static str, _elapsed: Duration) {}
}

/// Forwards span events to the debug log.
#[derive(Debug, Default)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn span(&self, name: &'static str, elapsed: Duration) {
        debug!("{} took {:.3}s", name, elapsed.as_secs_f64());
    }
}

/// Measure a closure and report it as a span.
pub fn timed<T, F: FnOnce() -> T>(sink: &Arc<dyn MetricsSink>, name: &'static str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    sink.span(name, start.elapsed());
    result
}
