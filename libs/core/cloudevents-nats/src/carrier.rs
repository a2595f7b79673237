//! Trace context carrier over NATS headers.
//!
//! `HeaderCarrier` adapts `async_nats::HeaderMap` (key to list of values) to
//! the OpenTelemetry `Injector`/`Extractor` contracts so any propagator can
//! write to or read from message headers.
//!
//! # Example
//! ```ignore
//! use cloudevents_nats::carrier::HeaderCarrier;
//! use opentelemetry::propagation::TextMapPropagator;
//!
//! let mut headers = async_nats::HeaderMap::new();
//! let mut carrier = HeaderCarrier::new(&mut headers);
//! propagator.inject_context(&cx, &mut carrier);
//! carrier.into_result()?;
//! ```

use crate::error::Error;
use async_nats::HeaderMap;
use opentelemetry::propagation::{Extractor, Injector};
use std::borrow::{Borrow, BorrowMut};

/// Header holding the serialized span identifier (W3C `traceparent`).
pub const TRACE_HEADER: &str = "traceparent";

/// Read/write view over NATS headers.
///
/// Writes go through `set`, which replaces every value stored under the key.
/// When used as an `Injector` (whose `set` cannot fail) the first rejected
/// write is kept and reported by `into_result`.
#[derive(Debug)]
pub struct HeaderCarrier<H> {
    headers: H,
    error: Option<Error>,
}

impl<H: Borrow<HeaderMap>> HeaderCarrier<H> {
    pub fn new(headers: H) -> Self {
        Self {
            headers,
            error: None,
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        self.headers.borrow()
    }

    pub fn into_inner(self) -> H {
        self.headers
    }

    /// Visit every `(key, value)` pair, every value of every key.
    ///
    /// Stops at the first visitor error and returns it.
    pub fn for_each_key<F, E>(&self, mut visit: F) -> Result<(), E>
    where
        F: FnMut(&str, &str) -> Result<(), E>,
    {
        for (name, values) in self.headers().iter() {
            let key: &str = name.as_ref();
            for value in values {
                visit(key, value.as_str())?;
            }
        }
        Ok(())
    }

    /// Raw bytes of the first value under the trace header, if any.
    pub fn trace_value(&self) -> Option<&[u8]> {
        self.headers()
            .get(TRACE_HEADER)
            .map(|value| value.as_str().as_bytes())
    }

    /// First error recorded while injecting, if any.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Consume the carrier, failing with the first injection error.
    pub fn into_result(self) -> Result<H, Error> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.headers),
        }
    }
}

impl<H: BorrowMut<HeaderMap>> HeaderCarrier<H> {
    /// Store `value` as the only value under `key`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), Error> {
        validate_key(key)?;
        validate_value(key, value)?;
        self.headers.borrow_mut().insert(key, value);
        Ok(())
    }
}

impl<H: BorrowMut<HeaderMap>> Injector for HeaderCarrier<H> {
    fn set(&mut self, key: &str, value: String) {
        if let Err(e) = HeaderCarrier::set(self, key, &value) {
            self.error.get_or_insert(e);
        }
    }
}

impl<H: Borrow<HeaderMap>> Extractor for HeaderCarrier<H> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers().get(key).map(|value| value.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        self.headers()
            .iter()
            .map(|(name, _)| -> &str { name.as_ref() })
            .collect()
    }
}

fn validate_key(key: &str) -> Result<(), Error> {
    if key.is_empty() {
        return Err(Error::TraceInjection("empty header name".to_string()));
    }
    if let Some(c) = key.chars().find(|c| !c.is_ascii_graphic() || *c == ':') {
        return Err(Error::TraceInjection(format!(
            "invalid character {c:?} in header name {key:?}"
        )));
    }
    Ok(())
}

fn validate_value(key: &str, value: &str) -> Result<(), Error> {
    if value.contains(['\r', '\n']) {
        return Err(Error::TraceInjection(format!(
            "line break in value of header {key:?}"
        )));
    }
    Ok(())
}
