//! Per-event metrics recorded on the receive path.

use crate::error::Error;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static METRICS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Receives per-event outcomes, all keyed by event type.
pub trait MetricsCollector: Send + Sync {
    /// An event was read off the consumer, whatever the outcome.
    fn read_event(&self, event_type: &str);
    /// An event was handled without error.
    fn decoded_event(&self, event_type: &str);
    fn fatal_error(&self, event_type: &str);
    fn process_error(&self, event_type: &str);
    fn error_event(&self, event_type: &str);
    /// Time spent in the event handler.
    fn handling_time(&self, event_type: &str, elapsed: Duration);
}

/// `MetricsCollector` backed by the `metrics` facade.
///
/// Every series is labelled with `event_type` and `stream`.
#[derive(Debug, Clone)]
pub struct EventMetrics {
    stream: String,
}

impl EventMetrics {
    /// Create a collector for one logical stream, usually the subject.
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }
}

impl MetricsCollector for EventMetrics {
    fn read_event(&self, event_type: &str) {
        counter!("cloudevents_read_events_total", "event_type" => event_type.to_string(), "stream" => self.stream.clone())
            .increment(1);
    }

    fn decoded_event(&self, event_type: &str) {
        counter!("cloudevents_decode_events_total", "event_type" => event_type.to_string(), "stream" => self.stream.clone())
            .increment(1);
    }

    fn fatal_error(&self, event_type: &str) {
        counter!("cloudevents_fatal_errors_total", "event_type" => event_type.to_string(), "stream" => self.stream.clone())
            .increment(1);
    }

    fn process_error(&self, event_type: &str) {
        counter!("cloudevents_process_errors_total", "event_type" => event_type.to_string(), "stream" => self.stream.clone())
            .increment(1);
    }

    fn error_event(&self, event_type: &str) {
        counter!("cloudevents_error_events_total", "event_type" => event_type.to_string(), "stream" => self.stream.clone())
            .increment(1);
    }

    fn handling_time(&self, event_type: &str, elapsed: Duration) {
        histogram!("cloudevents_handling_seconds", "event_type" => event_type.to_string(), "stream" => self.stream.clone())
            .record(elapsed.as_secs_f64());

        tracing::trace!(
            event_type = event_type,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "Recorded handling time"
        );
    }
}

/// Install the Prometheus recorder once and return its handle.
///
/// Later calls return the handle installed by the first one.
pub fn init_metrics() -> Result<&'static PrometheusHandle, Error> {
    METRICS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| Error::config(format!("failed to install Prometheus recorder: {e}")))?;

        info!("Prometheus metrics recorder initialized");
        register_metric_descriptions();

        Ok(handle)
    })
}

/// Get the metrics handle, if `init_metrics` has run.
pub fn metrics_handle() -> Option<&'static PrometheusHandle> {
    METRICS_HANDLE.get()
}

fn register_metric_descriptions() {
    use metrics::{describe_counter, describe_histogram};

    describe_counter!(
        "cloudevents_read_events_total",
        "Events read from a consumer"
    );
    describe_counter!(
        "cloudevents_decode_events_total",
        "Events handled without error"
    );
    describe_counter!(
        "cloudevents_fatal_errors_total",
        "Events whose handler failed"
    );
    describe_counter!(
        "cloudevents_process_errors_total",
        "Events whose processing failed"
    );
    describe_counter!(
        "cloudevents_error_events_total",
        "Events that ended in error"
    );
    describe_histogram!(
        "cloudevents_handling_seconds",
        "Event handler duration in seconds"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series<'a>(rendered: &'a str, name: &str) -> Vec<&'a str> {
        rendered
            .lines()
            .filter(|line| line.starts_with(&format!("{name}{{")))
            .collect()
    }

    #[test]
    fn test_event_metrics_names_and_labels() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let collector = EventMetrics::new("orders");

        metrics::with_local_recorder(&recorder, || {
            collector.read_event("com.example.created");
            collector.decoded_event("com.example.created");
            collector.read_event("com.example.failing");
            collector.fatal_error("com.example.failing");
            collector.process_error("com.example.failing");
            collector.error_event("com.example.failing");
            collector.handling_time("com.example.created", Duration::from_millis(5));
        });
        let rendered = handle.render();

        let read = series(&rendered, "cloudevents_read_events_total");
        assert_eq!(read.len(), 2);
        for line in &read {
            assert!(line.contains(r#"stream="orders""#));
            assert!(line.ends_with(" 1"));
        }

        let decoded = series(&rendered, "cloudevents_decode_events_total");
        assert_eq!(decoded.len(), 1);
        assert!(decoded[0].contains(r#"event_type="com.example.created""#));

        for name in [
            "cloudevents_fatal_errors_total",
            "cloudevents_process_errors_total",
            "cloudevents_error_events_total",
        ] {
            let lines = series(&rendered, name);
            assert_eq!(lines.len(), 1, "{name}");
            assert!(lines[0].contains(r#"event_type="com.example.failing""#));
            assert!(lines[0].contains(r#"stream="orders""#));
        }

        assert!(rendered.contains("cloudevents_handling_seconds"));
        assert_eq!(collector.stream(), "orders");
    }
}
