//! Consumer lifecycle: subscribe, pump, drain, close.
//!
//! `open` runs for the lifetime of the consumer, usually on its own task:
//! it subscribes, waits for cancellation or `close`, then drains. `receive`
//! pulls messages off the intake channel concurrently. `close` waits for an
//! in-flight `open` to finish draining before it closes the connection (if
//! owned) and the intake channel, so messages buffered during the drain are
//! still delivered. Nothing sent into the channel after `close` returns is
//! ever received, even from subscriptions the drain left behind.
//!
//! # Example
//! ```ignore
//! let consumer = Arc::new(Consumer::from_connection(conn, "orders", Box::new(RegularSubscriber)));
//! let cancel = CancellationToken::new();
//!
//! let opener = tokio::spawn({
//!     let consumer = consumer.clone();
//!     let cancel = cancel.clone();
//!     async move { consumer.open(&cancel).await }
//! });
//!
//! while let Ok(message) = consumer.receive(&cancel).await {
//!     // handle message
//! }
//! ```

use crate::broker::{Connection, ConnectionHandle, Intake};
use crate::error::Error;
use crate::message::InboundMessage;
use crate::nats::NatsConnection;
use crate::subscriber::Subscriber;
use async_nats::ConnectOptions;
use std::fmt;
use std::sync::{Arc, PoisonError};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives messages from a subject through a subscription strategy.
///
/// Opening again after `close` fails with `Error::ConsumerClosed`. Two
/// concurrent `open` calls on the same consumer are not supported.
pub struct Consumer {
    conn: ConnectionHandle,
    subject: String,
    subscriber: Box<dyn Subscriber>,
    intake: std::sync::Mutex<Option<Intake>>,
    incoming: Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    stream_closed: CancellationToken,
    close_requested: Notify,
    lifecycle: Mutex<()>,
}

impl Consumer {
    /// Connect to NATS; the consumer owns the connection and closes it.
    pub async fn connect(
        url: &str,
        subject: impl Into<String>,
        options: ConnectOptions,
        subscriber: Box<dyn Subscriber>,
    ) -> Result<Self, Error> {
        let conn = NatsConnection::connect(url, options).await?;
        Ok(Self::new(
            ConnectionHandle::Owned(Arc::new(conn)),
            subject,
            subscriber,
        ))
    }

    /// Use a caller-managed connection; closing the consumer leaves it open.
    pub fn from_connection(
        conn: Arc<dyn Connection>,
        subject: impl Into<String>,
        subscriber: Box<dyn Subscriber>,
    ) -> Self {
        Self::new(ConnectionHandle::Borrowed(conn), subject, subscriber)
    }

    pub fn new(
        conn: ConnectionHandle,
        subject: impl Into<String>,
        subscriber: Box<dyn Subscriber>,
    ) -> Self {
        let (intake, incoming) = mpsc::unbounded_channel();
        Self {
            conn,
            subject: subject.into(),
            subscriber,
            intake: std::sync::Mutex::new(Some(intake)),
            incoming: Mutex::new(incoming),
            stream_closed: CancellationToken::new(),
            close_requested: Notify::new(),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn subscriber(&self) -> &dyn Subscriber {
        self.subscriber.as_ref()
    }

    /// Subscribe and block until `cancel` fires or `close` is called, then
    /// drain the subscription.
    ///
    /// Subscribe errors are returned immediately. Otherwise the drain result
    /// is returned. A cancellation arriving during the drain does not
    /// interrupt it.
    pub async fn open(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let _lifecycle = self.lifecycle.lock().await;

        let intake = self.intake_sender().ok_or(Error::ConsumerClosed)?;
        let mut subscription = self
            .subscriber
            .subscribe(self.conn.connection().as_ref(), &self.subject, &intake)
            .await?;
        drop(intake);

        info!(subject = %self.subject, subscriber = ?self.subscriber, "Consumer opened");

        tokio::select! {
            _ = cancel.cancelled() => debug!(subject = %self.subject, "Consumer cancelled"),
            _ = self.close_requested.notified() => debug!(subject = %self.subject, "Consumer close requested"),
        }

        let result = subscription.drain().await;
        if let Err(e) = &result {
            warn!(subject = %self.subject, error = %e, "Consumer drain failed");
        }
        result
    }

    /// Wait for the next message.
    ///
    /// Returns `Error::StreamEnded` once the intake channel is closed and
    /// empty, or when `cancel` fires first. A message already available is
    /// returned even if `cancel` has fired.
    pub async fn receive(&self, cancel: &CancellationToken) -> Result<InboundMessage, Error> {
        tokio::select! {
            biased;
            message = self.next_message() => message.ok_or(Error::StreamEnded),
            _ = cancel.cancelled() => Err(Error::StreamEnded),
        }
    }

    /// Stop the consumer.
    ///
    /// Signals `open` to drain, waits for it to finish, closes the
    /// connection if owned, then closes the intake channel. Messages already
    /// buffered stay receivable; later sends are rejected. Works before
    /// `open` has ever run. Calling it again only repeats the connection
    /// close, which connections tolerate.
    pub async fn close(&self) -> Result<(), Error> {
        // stored as a permit when no open is waiting
        self.close_requested.notify_one();
        let _lifecycle = self.lifecycle.lock().await;

        let result = self.conn.close_if_owned().await;
        self.intake
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        // wakes a pending receive so it releases the receiver
        self.stream_closed.cancel();
        self.incoming.lock().await.close();

        debug!(subject = %self.subject, "Consumer closed");
        result
    }

    async fn next_message(&self) -> Option<InboundMessage> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            biased;
            _ = self.stream_closed.cancelled() => {}
            message = incoming.recv() => return message,
        }
        incoming.close();
        incoming.recv().await
    }

    fn intake_sender(&self) -> Option<Intake> {
        self.intake
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("subject", &self.subject)
            .field("subscriber", &self.subscriber)
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}
