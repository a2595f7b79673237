//! Binding messages: what a `Sender` sends and what a `Consumer` receives.

use crate::error::Error;
use crate::event::{Event, STRUCTURED_CONTENT_TYPE};
use async_nats::HeaderMap;
use bytes::Bytes;
use tracing::debug;

/// Header carrying the payload content type.
pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// A message that can be written by a `Sender`.
///
/// `finish` is the completion notification. `Sender::send` calls it exactly
/// once per send, with the send error if there was one.
pub trait Message: Send {
    /// Produce the event carried by this message.
    fn to_event(&self) -> Result<Event, Error>;

    /// Notify the message that its delivery attempt is over.
    fn finish(&mut self, error: Option<&Error>) -> Result<(), Error>;
}

/// Mutates an event while it is being written.
pub trait Transformer: Send + Sync {
    fn transform(&self, event: &mut Event) -> Result<(), Error>;
}

impl<F> Transformer for F
where
    F: Fn(&mut Event) -> Result<(), Error> + Send + Sync,
{
    fn transform(&self, event: &mut Event) -> Result<(), Error> {
        self(event)
    }
}

/// Serialize a message through the given transformers into a structured payload.
pub fn write_message(
    message: &dyn Message,
    transformers: &[&dyn Transformer],
) -> Result<Bytes, Error> {
    let mut event = message.to_event()?;
    for transformer in transformers {
        transformer.transform(&mut event)?;
    }
    Ok(Bytes::from(event.to_json()?))
}

type FinishHook = Box<dyn FnOnce(Option<&Error>) -> Result<(), Error> + Send>;

/// Outbound message wrapping an in-memory event.
pub struct EventMessage {
    event: Event,
    on_finish: Option<FinishHook>,
}

impl EventMessage {
    pub fn new(event: Event) -> Self {
        Self {
            event,
            on_finish: None,
        }
    }

    /// Register a hook that runs when the message is finished.
    pub fn on_finish<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(Option<&Error>) -> Result<(), Error> + Send + 'static,
    {
        self.on_finish = Some(Box::new(hook));
        self
    }

    pub fn event(&self) -> &Event {
        &self.event
    }
}

impl From<Event> for EventMessage {
    fn from(event: Event) -> Self {
        Self::new(event)
    }
}

impl Message for EventMessage {
    fn to_event(&self) -> Result<Event, Error> {
        Ok(self.event.clone())
    }

    fn finish(&mut self, error: Option<&Error>) -> Result<(), Error> {
        match self.on_finish.take() {
            Some(hook) => hook(error),
            None => Ok(()),
        }
    }
}

/// A raw message delivered by the broker into a consumer's intake channel.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Subject the message was published on
    pub subject: String,
    /// Reply subject for request-reply patterns
    pub reply: Option<String>,
    /// Transport metadata
    pub headers: HeaderMap,
    /// Opaque payload
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(subject: impl Into<String>, headers: HeaderMap, payload: Bytes) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            headers,
            payload,
        }
    }

    /// Decode the payload as a structured-mode event.
    pub fn decode(&self) -> Result<Event, Error> {
        if let Some(content_type) = self.headers.get(CONTENT_TYPE_HEADER) {
            if content_type.as_str() != STRUCTURED_CONTENT_TYPE {
                return Err(Error::MalformedEvent(format!(
                    "unsupported content type {:?}",
                    content_type.as_str()
                )));
            }
        }
        Event::from_json(&self.payload)
    }
}

impl From<async_nats::Message> for InboundMessage {
    fn from(message: async_nats::Message) -> Self {
        Self {
            subject: message.subject.to_string(),
            reply: message.reply.map(|reply| reply.to_string()),
            headers: message.headers.unwrap_or_default(),
            payload: message.payload,
        }
    }
}

impl Message for InboundMessage {
    fn to_event(&self) -> Result<Event, Error> {
        self.decode()
    }

    fn finish(&mut self, error: Option<&Error>) -> Result<(), Error> {
        // core NATS has no acknowledgement
        if let Some(error) = error {
            debug!(subject = %self.subject, error = %error, "Inbound message finished with error");
        }
        Ok(())
    }
}
