//! Publishes events to a NATS subject.

use crate::broker::{Connection, ConnectionHandle};
use crate::carrier::HeaderCarrier;
use crate::context::topic_from;
use crate::error::Error;
use crate::event::STRUCTURED_CONTENT_TYPE;
use crate::message::{write_message, Message, Transformer, CONTENT_TYPE_HEADER};
use crate::nats::NatsConnection;
use crate::observability::COMPONENT;
use crate::telemetry::Telemetry;
use async_nats::{ConnectOptions, HeaderMap};
use bytes::Bytes;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use std::sync::Arc;
use tracing::debug;

/// Sends binding messages to a default subject.
///
/// The subject can be overridden per call with `context::with_topic`.
#[derive(Debug, Clone)]
pub struct Sender {
    conn: ConnectionHandle,
    subject: String,
    telemetry: Telemetry,
}

impl Sender {
    /// Connect to NATS; the sender owns the connection and closes it.
    pub async fn connect(
        url: &str,
        subject: impl Into<String>,
        options: ConnectOptions,
        telemetry: Telemetry,
    ) -> Result<Self, Error> {
        let conn = NatsConnection::connect(url, options).await?;
        Ok(Self::new(
            ConnectionHandle::Owned(Arc::new(conn)),
            subject,
            telemetry,
        ))
    }

    /// Use a caller-managed connection; closing the sender leaves it open.
    pub fn from_connection(
        conn: Arc<dyn Connection>,
        subject: impl Into<String>,
        telemetry: Telemetry,
    ) -> Self {
        Self::new(ConnectionHandle::Borrowed(conn), subject, telemetry)
    }

    pub fn new(conn: ConnectionHandle, subject: impl Into<String>, telemetry: Telemetry) -> Self {
        Self {
            conn,
            subject: subject.into(),
            telemetry,
        }
    }

    /// Default subject.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Serialize `message`, publish it, then finish it.
    ///
    /// `message.finish` is called exactly once with the outcome, whichever
    /// step failed. When both the send and the finish fail the returned
    /// error carries both messages.
    pub async fn send(
        &self,
        cx: &Context,
        message: &mut dyn Message,
        transformers: &[&dyn Transformer],
    ) -> Result<(), Error> {
        let result = match write_message(&*message, transformers) {
            Ok(payload) => self.publish(cx, payload).await,
            Err(e) => Err(e),
        };

        let finished = message.finish(result.as_ref().err());
        match (result, finished) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(finish)) => Err(finish),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(finish)) => Err(Error::finish(finish, e)),
        }
    }

    /// Close the connection if the sender owns it.
    pub async fn close(&self) -> Result<(), Error> {
        self.conn.close_if_owned().await
    }

    async fn publish(&self, cx: &Context, payload: Bytes) -> Result<(), Error> {
        let subject = topic_from(cx).unwrap_or(&self.subject).to_string();

        let tracer = self.telemetry.tracer();
        let builder = tracer
            .span_builder(format!("-> NATS://{subject}"))
            .with_kind(SpanKind::Producer)
            .with_attributes(vec![
                KeyValue::new("component", COMPONENT),
                KeyValue::new("messaging.system", "nats"),
                KeyValue::new("messaging.destination.name", subject.clone()),
            ]);
        let cx = cx.with_span(tracer.build_with_context(builder, cx));

        let result = self.inject_and_publish(&cx, &subject, payload).await;

        let span = cx.span();
        if let Err(e) = &result {
            span.record_error(e);
            span.set_status(Status::error(e.to_string()));
        }
        span.end();

        debug!(subject = %subject, ok = result.is_ok(), "Event published");
        result
    }

    async fn inject_and_publish(
        &self,
        cx: &Context,
        subject: &str,
        payload: Bytes,
    ) -> Result<(), Error> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE_HEADER, STRUCTURED_CONTENT_TYPE);

        let mut carrier = HeaderCarrier::new(&mut headers);
        self.telemetry.propagator().inject_context(cx, &mut carrier);
        carrier.into_result()?;

        self.conn.connection().publish(subject, headers, payload).await
    }
}
