//! Event client: traced sending and a concurrent receive loop.

use crate::error::{BoxError, Error};
use crate::event::Event;
use crate::message::{EventMessage, InboundMessage};
use crate::observability::Observability;
use crate::protocol::Protocol;
use async_trait::async_trait;
use opentelemetry::Context;
use std::error::Error as StdError;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Error returned by an event handler.
pub type HandlerError = BoxError;

/// Business logic invoked for every received event.
///
/// Errors are recorded on the span and in metrics; they never stop the
/// receive loop.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, cx: &Context, event: Event) -> Result<(), HandlerError>;
}

/// Sends and receives events over a `Protocol`, traced by `Observability`.
#[derive(Debug)]
pub struct Client {
    protocol: Protocol,
    observability: Observability,
    concurrency: usize,
}

impl Client {
    pub fn new(protocol: Protocol, observability: Observability) -> Self {
        Self {
            protocol,
            observability,
            concurrency: 1,
        }
    }

    /// Handle up to `concurrency` events at once. Zero is treated as one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn observability(&self) -> &Observability {
        &self.observability
    }

    /// Send an event under a producer span.
    ///
    /// The span context is embedded into the event and injected into the
    /// message headers.
    pub async fn send(&self, cx: &Context, mut event: Event) -> Result<(), Error> {
        let (cx, completion) = self.observability.record_sending_event(cx, &mut event);

        let mut message = EventMessage::new(event);
        let result = self.protocol.sender().send(&cx, &mut message, &[]).await;

        completion.complete(result.as_ref().err().map(|e| e as &(dyn StdError + 'static)));
        result
    }

    /// Open the consumer and dispatch every received event to `handler`
    /// until `cancel` fires or the protocol is closed.
    ///
    /// Malformed payloads are recorded and skipped. If opening or draining
    /// the consumer fails, the consumer is closed so the loop ends after the
    /// buffered messages. Waits for in-flight handlers, then returns the
    /// result of opening and draining the consumer.
    pub async fn start_receiver<H: EventHandler>(
        &self,
        cx: &Context,
        cancel: &CancellationToken,
        handler: H,
    ) -> Result<(), Error> {
        let handler: Arc<dyn EventHandler> = Arc::new(handler);
        let consumer = self.protocol.consumer().clone();

        let mut opener = tokio::spawn({
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            async move { consumer.open(&cancel).await }
        });

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        info!(
            subject = %consumer.subject(),
            concurrency = self.concurrency,
            "Receiver started"
        );

        let mut opened: Option<Result<(), Error>> = None;

        loop {
            let received = tokio::select! {
                received = consumer.receive(cancel) => received,
                joined = &mut opener, if opened.is_none() => {
                    let result = joined.map_err(Error::from).and_then(|result| result);
                    if let Err(e) = &result {
                        warn!(
                            subject = %consumer.subject(),
                            error = %e,
                            "Consumer stopped with an error"
                        );
                        if let Err(e) = consumer.close().await {
                            warn!(error = %e, "Failed to close consumer");
                        }
                    }
                    opened = Some(result);
                    continue;
                }
            };
            let message = match received {
                Ok(message) => message,
                Err(e) => {
                    debug!(error = %e, "Receive loop ended");
                    break;
                }
            };

            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let observability = self.observability.clone();
            let handler = handler.clone();
            let cx = cx.clone();
            tasks.spawn(async move {
                dispatch(&observability, &cx, message, handler.as_ref()).await;
                drop(permit);
            });

            while let Some(joined) = tasks.try_join_next() {
                log_join_failure(joined);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            log_join_failure(joined);
        }
        info!(subject = %consumer.subject(), "Receiver stopped");

        match opened {
            Some(result) => result,
            None => opener.await?,
        }
    }

    /// Close the underlying protocol.
    pub async fn close(&self) -> Result<(), Error> {
        self.protocol.close().await
    }
}

async fn dispatch(
    observability: &Observability,
    cx: &Context,
    message: InboundMessage,
    handler: &dyn EventHandler,
) {
    let cx = observability.inbound_context(cx, &message);

    let event = match message.decode() {
        Ok(event) => event,
        Err(e) => {
            observability.record_received_malformed_event(&cx, &e);
            return;
        }
    };

    let (cx, completion) = observability.record_calling_invoker(&cx, &event);
    let event_id = event.id().to_string();

    let result = handler.handle(&cx, event).await;
    if let Err(e) = &result {
        warn!(event_id = %event_id, error = %e, "Event handler failed");
    }
    completion.complete(
        result
            .as_ref()
            .err()
            .map(|e| e.as_ref() as &(dyn StdError + 'static)),
    );
}

fn log_join_failure(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Event handler task failed");
    }
}
