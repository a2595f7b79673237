//! Tracing and metrics middleware around sent and received events.
//!
//! `Observability` wraps each intercept point with a span:
//!
//! - `record_sending_event`: producer span, trace context embedded into the event
//! - `record_calling_invoker`: consumer span around the business handler,
//!   parented on the embedded context (or the header context as a fallback)
//! - `record_received_malformed_event`: a short span recording a decode failure
//!
//! Each intercept that opens a span returns a `SpanCompletion`. Calling
//! `complete` ends the span and updates metrics; it consumes the value so it
//! can only happen once.
//!
//! # Example
//! ```ignore
//! let observability = Observability::new(telemetry).with_metrics(EventMetrics::new("orders"));
//!
//! let (cx, completion) = observability.record_calling_invoker(&cx, &event);
//! let result = handler.handle(&cx, &event).await;
//! completion.complete(result.as_ref().err().map(|e| e.as_ref() as _));
//! ```

use crate::carrier::HeaderCarrier;
use crate::context::{span_reference_from, with_span_reference};
use crate::event::Event;
use crate::extension::{extract_extension, inject_extension, TRACE_EXTENSION};
use crate::message::InboundMessage;
use crate::metrics::MetricsCollector;
use crate::telemetry::Telemetry;
use opentelemetry::trace::{
    Link, SpanContext, SpanKind, Status, TraceContextExt, Tracer,
};
use opentelemetry::{Context, KeyValue};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Component tag set on every span.
pub const COMPONENT: &str = "cloudevents.protocol.nats.observability";

pub const SEND_SUFFIX: &str = "send";
pub const PROCESS_SUFFIX: &str = "process";
pub const RECEIVE_SUFFIX: &str = "receive";

const MALFORMED_SPAN_NAME: &str = "cloudevents.client.malformed receive";

/// Maps an event to a base span name.
pub type SpanNameFormatter = Arc<dyn Fn(&Event) -> String + Send + Sync>;

/// Extra span attributes for an event. Keys override the defaults.
pub type AttributeGetter = Arc<dyn Fn(&Event) -> Vec<KeyValue> + Send + Sync>;

fn default_span_name(event: &Event) -> String {
    format!("cloudevents.client.{}", event.ty())
}

/// Span and metrics middleware.
#[derive(Clone)]
pub struct Observability {
    telemetry: Telemetry,
    metrics: Option<Arc<dyn MetricsCollector>>,
    span_name: SpanNameFormatter,
    attributes: Option<AttributeGetter>,
}

impl Observability {
    pub fn new(telemetry: Telemetry) -> Self {
        Self {
            telemetry,
            metrics: None,
            span_name: Arc::new(default_span_name),
            attributes: None,
        }
    }

    /// Record receive-path metrics into `metrics`.
    pub fn with_metrics(mut self, metrics: impl MetricsCollector + 'static) -> Self {
        self.metrics = Some(Arc::new(metrics));
        self
    }

    /// Replace the span base name formatter.
    pub fn with_span_name_formatter<F>(mut self, formatter: F) -> Self
    where
        F: Fn(&Event) -> String + Send + Sync + 'static,
    {
        self.span_name = Arc::new(formatter);
        self
    }

    /// Add caller attributes on top of the default event attributes.
    pub fn with_attribute_getter<F>(mut self, getter: F) -> Self
    where
        F: Fn(&Event) -> Vec<KeyValue> + Send + Sync + 'static,
    {
        self.attributes = Some(Arc::new(getter));
        self
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Start a producer span for an outbound event and embed its context
    /// into the event.
    ///
    /// The span is a child of any span already in `cx`. The returned context
    /// carries the new span.
    pub fn record_sending_event(&self, cx: &Context, event: &mut Event) -> (Context, SpanCompletion) {
        let tracer = self.telemetry.tracer();
        let builder = tracer
            .span_builder(self.span_name(event, SEND_SUFFIX))
            .with_kind(SpanKind::Producer)
            .with_attributes(self.event_attributes(event));

        let span = tracer.build_with_context(builder, cx);
        let cx = cx.with_span(span);
        inject_extension(&cx, event);

        let completion = SpanCompletion::new(cx.clone(), event.ty(), None);
        (cx, completion)
    }

    /// Start a consumer span around the business handler for `event`.
    ///
    /// The parent is the span context embedded in the event. When the event
    /// carries none, the span reference in `cx` (set by `inbound_context`)
    /// is used instead; when both exist the reference becomes a link.
    /// A missing or unreadable extension is logged and never fails.
    pub fn record_calling_invoker(&self, cx: &Context, event: &Event) -> (Context, SpanCompletion) {
        let embedded = match extract_extension(event) {
            Ok(span_context) => Some(span_context),
            Err(e) => {
                if event.extension(TRACE_EXTENSION).is_some() {
                    warn!(event_id = %event.id(), error = %e, "Ignoring unreadable trace extension");
                } else {
                    debug!(event_id = %event.id(), "Event carries no trace extension");
                }
                None
            }
        };
        let reference = span_reference_from(cx).cloned();

        let (parent, link) = match (embedded, reference) {
            (Some(embedded), reference) => (Some(embedded), reference),
            (None, reference) => (reference, None),
        };
        let parent_cx = match parent {
            Some(span_context) => cx.with_remote_span_context(span_context),
            None => cx.clone(),
        };

        let mut attributes = self.event_attributes(event);
        attributes.push(KeyValue::new("messaging.operation.type", PROCESS_SUFFIX));

        let tracer = self.telemetry.tracer();
        let mut builder = tracer
            .span_builder(self.span_name(event, PROCESS_SUFFIX))
            .with_kind(SpanKind::Consumer)
            .with_attributes(attributes);
        if let Some(link) = link.filter(|link| parent_cx.span().span_context() != link) {
            builder = builder.with_links(vec![Link::with_context(link)]);
        }

        let span = tracer.build_with_context(builder, &parent_cx);
        let cx = parent_cx.with_span(span);

        let completion = SpanCompletion::new(cx.clone(), event.ty(), self.metrics.clone());
        (cx, completion)
    }

    /// Record a payload that could not be decoded into an event.
    ///
    /// Starts and ends a dedicated span with the error attached. Never fails.
    pub fn record_received_malformed_event(&self, cx: &Context, error: &(dyn StdError + 'static)) {
        let parent_cx = match span_reference_from(cx) {
            Some(reference) => cx.with_remote_span_context(reference.clone()),
            None => cx.clone(),
        };

        let tracer = self.telemetry.tracer();
        let builder = tracer
            .span_builder(MALFORMED_SPAN_NAME)
            .with_kind(SpanKind::Consumer)
            .with_attributes(vec![
                KeyValue::new("component", COMPONENT),
                KeyValue::new("messaging.system", "nats"),
                KeyValue::new("cloudevents.malformed", true),
            ]);

        let span = tracer.build_with_context(builder, &parent_cx);
        let cx = parent_cx.with_span(span);
        let span = cx.span();
        span.record_error(error);
        span.set_status(Status::error(error.to_string()));
        span.end();

        warn!(error = %error, "Received malformed event");
    }

    /// Attach the span context carried in the message headers to `cx` as a
    /// span reference.
    ///
    /// Returns `cx` unchanged when the headers carry no valid trace context.
    pub fn inbound_context(&self, cx: &Context, message: &InboundMessage) -> Context {
        let extracted = self
            .telemetry
            .propagator()
            .extract(&HeaderCarrier::new(&message.headers));
        let span_context: SpanContext = extracted.span().span_context().clone();

        if span_context.is_valid() {
            with_span_reference(cx, span_context)
        } else {
            cx.clone()
        }
    }

    fn span_name(&self, event: &Event, suffix: &str) -> String {
        let base = (self.span_name)(event);
        if base.ends_with(suffix) {
            base
        } else {
            format!("{base} {suffix}")
        }
    }

    fn event_attributes(&self, event: &Event) -> Vec<KeyValue> {
        let mut attributes = vec![
            KeyValue::new("component", COMPONENT),
            KeyValue::new("messaging.system", "nats"),
            KeyValue::new("cloudevents.event_spec_version", event.spec_version().to_string()),
            KeyValue::new("cloudevents.event_id", event.id().to_string()),
            KeyValue::new("cloudevents.event_type", event.ty().to_string()),
            KeyValue::new("cloudevents.event_source", event.source().to_string()),
        ];
        if let Some(subject) = event.subject() {
            attributes.push(KeyValue::new("cloudevents.event_subject", subject.to_string()));
        }
        if let Some(content_type) = event.data_content_type() {
            attributes.push(KeyValue::new(
                "cloudevents.event_datacontenttype",
                content_type.to_string(),
            ));
        }

        if let Some(getter) = &self.attributes {
            for extra in getter(event) {
                match attributes.iter_mut().find(|kv| kv.key == extra.key) {
                    Some(existing) => *existing = extra,
                    None => attributes.push(extra),
                }
            }
        }
        attributes
    }
}

impl fmt::Debug for Observability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observability")
            .field("metrics", &self.metrics.is_some())
            .field("attribute_getter", &self.attributes.is_some())
            .finish_non_exhaustive()
    }
}

/// Completion of a span opened by `Observability`.
///
/// `complete` ends the span, records the error on it, and (on the receive
/// path, when metrics are configured) updates the event counters and the
/// handling-time histogram.
#[must_use = "the span is only ended by `complete`"]
pub struct SpanCompletion {
    cx: Context,
    event_type: String,
    started: Instant,
    metrics: Option<Arc<dyn MetricsCollector>>,
}

impl SpanCompletion {
    fn new(cx: Context, event_type: &str, metrics: Option<Arc<dyn MetricsCollector>>) -> Self {
        Self {
            cx,
            event_type: event_type.to_string(),
            started: Instant::now(),
            metrics,
        }
    }

    /// Context carrying the span this completion ends.
    pub fn context(&self) -> &Context {
        &self.cx
    }

    pub fn complete(self, error: Option<&(dyn StdError + 'static)>) {
        let elapsed = self.started.elapsed();
        let span = self.cx.span();
        span.set_attribute(KeyValue::new(
            "cloudevents.handling_ms",
            i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
        ));

        if let Some(metrics) = &self.metrics {
            metrics.read_event(&self.event_type);
            match error {
                None => metrics.decoded_event(&self.event_type),
                Some(_) => {
                    metrics.fatal_error(&self.event_type);
                    metrics.process_error(&self.event_type);
                    metrics.error_event(&self.event_type);
                }
            }
            metrics.handling_time(&self.event_type, elapsed);
        }

        if let Some(error) = error {
            span.record_error(error);
            span.set_status(Status::error(error.to_string()));
        }
        span.end();
    }
}

impl fmt::Debug for SpanCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanCompletion")
            .field("event_type", &self.event_type)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}
