//! Per-call values carried in an OpenTelemetry `Context`.

use opentelemetry::trace::SpanContext;
use opentelemetry::Context;

#[derive(Debug, Clone)]
struct TopicOverride(String);

#[derive(Debug, Clone)]
struct SpanReference(SpanContext);

/// Override the sender's default subject for sends made with this context.
pub fn with_topic(cx: &Context, topic: impl Into<String>) -> Context {
    cx.with_value(TopicOverride(topic.into()))
}

/// Subject override set by `with_topic`, if any.
pub fn topic_from(cx: &Context) -> Option<&str> {
    cx.get::<TopicOverride>().map(|topic| topic.0.as_str())
}

/// Attach a span context read from transport metadata.
pub fn with_span_reference(cx: &Context, span_context: SpanContext) -> Context {
    cx.with_value(SpanReference(span_context))
}

/// Span context attached by `with_span_reference`, if any.
pub fn span_reference_from(cx: &Context) -> Option<&SpanContext> {
    cx.get::<SpanReference>().map(|reference| &reference.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{SpanId, TraceFlags, TraceId, TraceState};

    #[test]
    fn test_topic_override() {
        let cx = Context::new();
        assert!(topic_from(&cx).is_none());

        let cx = with_topic(&cx, "topicX");
        assert_eq!(topic_from(&cx), Some("topicX"));
        // the latest override wins
        assert_eq!(topic_from(&with_topic(&cx, "topicZ")), Some("topicZ"));
    }

    #[test]
    fn test_span_reference() {
        let span_context = SpanContext::new(
            TraceId::from_bytes([1; 16]),
            SpanId::from_bytes([2; 8]),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );
        let cx = with_span_reference(&Context::new(), span_context.clone());
        assert_eq!(span_reference_from(&cx), Some(&span_context));
    }
}
