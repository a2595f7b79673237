//! Span context embedded in the event as an extension attribute.
//!
//! Lets trace context survive hops where transport headers are lost. The
//! value is a binary span context encoded with unpadded standard base64:
//!
//! ```text
//! version (1 byte, 0) | trace id (16) | span id (8) | flags (1) | tracestate (rest, optional)
//! ```

use crate::error::Error;
use crate::event::Event;
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState};
use opentelemetry::Context;
use std::str::FromStr;
use tracing::debug;

/// Name of the extension attribute holding the encoded span context.
pub const TRACE_EXTENSION: &str = "tracestate";

const VERSION: u8 = 0;
const HEADER_LEN: usize = 1 + 16 + 8 + 1;

/// Encode a span context as base64 text.
pub fn encode_span_context(span_context: &SpanContext) -> String {
    let trace_state = span_context.trace_state().header();
    let mut buf = Vec::with_capacity(HEADER_LEN + trace_state.len());
    buf.push(VERSION);
    buf.extend_from_slice(&span_context.trace_id().to_bytes());
    buf.extend_from_slice(&span_context.span_id().to_bytes());
    buf.push(span_context.trace_flags().to_u8());
    buf.extend_from_slice(trace_state.as_bytes());
    STANDARD_NO_PAD.encode(buf)
}

/// Decode base64 text produced by `encode_span_context` into a remote span context.
pub fn decode_span_context(value: &str) -> Result<SpanContext, Error> {
    let buf = STANDARD_NO_PAD
        .decode(value)
        .map_err(|e| Error::TraceExtension(format!("invalid base64: {e}")))?;

    if buf.len() < HEADER_LEN {
        return Err(Error::TraceExtension(format!(
            "span context too short: {} bytes",
            buf.len()
        )));
    }
    if buf[0] != VERSION {
        return Err(Error::TraceExtension(format!(
            "unsupported span context version {}",
            buf[0]
        )));
    }

    let mut trace_id = [0u8; 16];
    trace_id.copy_from_slice(&buf[1..17]);
    let mut span_id = [0u8; 8];
    span_id.copy_from_slice(&buf[17..25]);
    let flags = TraceFlags::new(buf[25]);

    let trace_state = match &buf[HEADER_LEN..] {
        [] => TraceState::default(),
        rest => {
            let header = std::str::from_utf8(rest)
                .map_err(|e| Error::TraceExtension(format!("invalid tracestate: {e}")))?;
            TraceState::from_str(header)
                .map_err(|e| Error::TraceExtension(format!("invalid tracestate: {e}")))?
        }
    };

    let span_context = SpanContext::new(
        TraceId::from_bytes(trace_id),
        SpanId::from_bytes(span_id),
        flags,
        true,
        trace_state,
    );
    if !span_context.is_valid() {
        return Err(Error::TraceExtension("zero trace or span id".to_string()));
    }
    Ok(span_context)
}

/// Write the span context of `cx` into the event.
///
/// Returns `false` and leaves the event untouched when `cx` carries no valid span.
pub fn inject_extension(cx: &Context, event: &mut Event) -> bool {
    let span = cx.span();
    let span_context = span.span_context();
    if !span_context.is_valid() {
        debug!(event_id = %event.id(), "No valid span to embed in event");
        return false;
    }
    event.set_extension(TRACE_EXTENSION, encode_span_context(span_context));
    true
}

/// Read the span context embedded in the event.
///
/// Fails when the extension is absent or cannot be decoded.
pub fn extract_extension(event: &Event) -> Result<SpanContext, Error> {
    let value = event
        .extension(TRACE_EXTENSION)
        .ok_or_else(|| Error::TraceExtension(format!("{TRACE_EXTENSION} extension missing")))?;
    decode_span_context(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span_context(state: TraceState) -> SpanContext {
        SpanContext::new(
            TraceId::from_bytes([0xab; 16]),
            SpanId::from_bytes([0x01; 8]),
            TraceFlags::SAMPLED,
            false,
            state,
        )
    }

    #[test]
    fn test_encoding_is_unpadded() {
        let encoded = encode_span_context(&span_context(TraceState::default()));
        // 26 bytes encode to 35 characters without padding
        assert_eq!(encoded.len(), 35);
        assert!(!encoded.ends_with('='));
    }

    #[test]
    fn test_decode_restores_fields_as_remote() {
        let state = TraceState::from_key_value([("vendor", "value")]).unwrap();
        let original = span_context(state);

        let decoded = decode_span_context(&encode_span_context(&original)).unwrap();
        assert_eq!(decoded.trace_id(), original.trace_id());
        assert_eq!(decoded.span_id(), original.span_id());
        assert!(decoded.is_sampled());
        assert!(decoded.is_remote());
        assert_eq!(decoded.trace_state().get("vendor"), Some("value"));
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert!(decode_span_context("!!!").is_err());
        assert!(decode_span_context(&STANDARD_NO_PAD.encode([0u8; 4])).is_err());
        // all-zero ids are not a valid span context
        assert!(decode_span_context(&STANDARD_NO_PAD.encode([0u8; HEADER_LEN])).is_err());

        let mut wrong_version = vec![9u8];
        wrong_version.extend_from_slice(&[1u8; HEADER_LEN - 1]);
        assert!(decode_span_context(&STANDARD_NO_PAD.encode(wrong_version)).is_err());
    }

    #[test]
    fn test_inject_and_extract_through_event() {
        let cx = Context::new().with_remote_span_context(span_context(TraceState::default()));
        let mut event = Event::new("com.example.created", "api");

        assert!(inject_extension(&cx, &mut event));
        let extracted = extract_extension(&event).unwrap();
        assert_eq!(extracted.trace_id(), TraceId::from_bytes([0xab; 16]));
    }

    #[test]
    fn test_inject_without_span_leaves_event_untouched() {
        let mut event = Event::new("com.example.created", "api");
        assert!(!inject_extension(&Context::new(), &mut event));
        assert!(event.extension(TRACE_EXTENSION).is_none());

        let err = extract_extension(&event).unwrap_err();
        assert!(matches!(err, Error::TraceExtension(_)));
    }
}
