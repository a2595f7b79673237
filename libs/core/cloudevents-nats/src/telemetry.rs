//! Tracer and propagator handed to the binding explicitly.

use opentelemetry::global::{BoxedTracer, ObjectSafeTracer};
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::noop::NoopTracer;
use opentelemetry::trace::{Span, Tracer};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::fmt;
use std::sync::Arc;

/// Tracing dependencies shared by `Sender` and `Observability`.
///
/// Nothing here reads process-wide OpenTelemetry state; callers pass the
/// tracer they want spans to go to.
#[derive(Clone)]
pub struct Telemetry {
    tracer: Arc<BoxedTracer>,
    propagator: Arc<dyn TextMapPropagator + Send + Sync>,
}

impl Telemetry {
    /// Wrap a tracer, using the W3C trace-context propagator for headers.
    pub fn new<T, S>(tracer: T) -> Self
    where
        T: Tracer<Span = S> + Send + Sync + 'static,
        S: Span + Send + Sync + 'static,
    {
        let tracer: Box<dyn ObjectSafeTracer + Send + Sync> = Box::new(tracer);
        Self {
            tracer: Arc::new(BoxedTracer::new(tracer)),
            propagator: Arc::new(TraceContextPropagator::new()),
        }
    }

    /// Telemetry whose spans are never recorded.
    pub fn noop() -> Self {
        Self::new(NoopTracer::new())
    }

    /// Replace the header propagator.
    pub fn with_propagator<P>(mut self, propagator: P) -> Self
    where
        P: TextMapPropagator + Send + Sync + 'static,
    {
        self.propagator = Arc::new(propagator);
        self
    }

    pub fn tracer(&self) -> &BoxedTracer {
        &self.tracer
    }

    pub fn propagator(&self) -> &(dyn TextMapPropagator + Send + Sync) {
        self.propagator.as_ref()
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry").finish_non_exhaustive()
    }
}
