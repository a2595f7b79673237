//! `Connection` implementation over `async_nats`.

use crate::broker::{Connection, Intake, Subscription};
use crate::error::{BoxError, Error};
use async_nats::{Client, ConnectOptions, HeaderMap};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// NATS connection backed by an `async_nats::Client`.
///
/// Closing flushes pending publishes and releases this handle's client; the
/// socket is closed once no other clone of the client is alive.
pub struct NatsConnection {
    client: RwLock<Option<Client>>,
}

impl NatsConnection {
    /// Connect to a NATS server.
    pub async fn connect(url: &str, options: ConnectOptions) -> Result<Self, Error> {
        let client = options
            .connect(url)
            .await
            .map_err(|e| Error::Connect(Box::new(e)))?;

        info!(url = %url, "Connected to NATS");
        Ok(Self::from_client(client))
    }

    /// Wrap an already connected client.
    pub fn from_client(client: Client) -> Self {
        Self {
            client: RwLock::new(Some(client)),
        }
    }

    /// Get a clone of the underlying client for advanced operations.
    pub async fn client(&self) -> Option<Client> {
        self.client.read().await.clone()
    }

    async fn live_client(&self) -> Result<Client, Error> {
        self.client.read().await.clone().ok_or(Error::ConnectionClosed)
    }
}

#[async_trait]
impl Connection for NatsConnection {
    async fn publish(
        &self,
        subject: &str,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<(), Error> {
        self.live_client()
            .await?
            .publish_with_headers(subject.to_string(), headers, payload)
            .await
            .map_err(|e| Error::publish(subject, e))
    }

    #[instrument(skip(self, intake))]
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        intake: Intake,
    ) -> Result<Box<dyn Subscription>, Error> {
        let client = self.live_client().await?;
        let subscriber = match queue_group {
            Some(group) => {
                client
                    .queue_subscribe(subject.to_string(), group.to_string())
                    .await
            }
            None => client.subscribe(subject.to_string()).await,
        }
        .map_err(|e| Error::subscribe(subject, e))?;

        let (drain_tx, drain_rx) = oneshot::channel();
        let task = tokio::spawn(pump(subscriber, intake, drain_rx));

        debug!("Subscription started");
        Ok(Box::new(NatsSubscription {
            subject: subject.to_string(),
            drain_tx: Some(drain_tx),
            task: Some(task),
        }))
    }

    async fn close(&self) -> Result<(), Error> {
        let Some(client) = self.client.write().await.take() else {
            return Ok(());
        };
        if let Err(e) = client.flush().await {
            warn!(error = %e, "Failed to flush NATS connection on close");
        }
        debug!("NATS connection closed");
        Ok(())
    }
}

/// Forward messages from a NATS subscriber into the intake channel until the
/// subscription ends.
async fn pump(
    mut subscriber: async_nats::Subscriber,
    intake: Intake,
    mut drain_rx: oneshot::Receiver<()>,
) -> Result<(), BoxError> {
    let mut draining = false;
    loop {
        tokio::select! {
            _ = &mut drain_rx, if !draining => {
                draining = true;
                subscriber.drain().await?;
            }
            message = subscriber.next() => match message {
                Some(message) => {
                    if intake.send(message.into()).is_err() {
                        // consumer is gone; nothing left to deliver to
                        break;
                    }
                }
                None => break,
            },
        }
    }
    Ok(())
}

/// Handle to a running NATS subscription.
#[derive(Debug)]
struct NatsSubscription {
    subject: String,
    drain_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<(), BoxError>>>,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn drain(&mut self) -> Result<(), Error> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        if let Some(drain_tx) = self.drain_tx.take() {
            // the pump may already have stopped on its own
            let _ = drain_tx.send(());
        }

        match task.await {
            Ok(Ok(())) => {
                debug!(subject = %self.subject, "Subscription drained");
                Ok(())
            }
            Ok(Err(e)) => Err(Error::drain(&self.subject, e)),
            Err(e) => Err(Error::drain(&self.subject, e)),
        }
    }
}
