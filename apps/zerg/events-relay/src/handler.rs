//! Handler logging every received event

use async_trait::async_trait;
use cloudevents_nats::{Context, Event, EventHandler, HandlerError};
use opentelemetry::trace::TraceContextExt;
use tracing::info;

pub struct LogHandler;

#[async_trait]
impl EventHandler for LogHandler {
    async fn handle(&self, cx: &Context, event: Event) -> Result<(), HandlerError> {
        let trace_id = cx.span().span_context().trace_id();

        info!(
            event_id = %event.id(),
            event_type = %event.ty(),
            source = %event.source(),
            trace_id = %trace_id,
            data = ?event.data(),
            "Received event"
        );

        Ok(())
    }
}
