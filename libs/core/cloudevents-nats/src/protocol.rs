//! A sender and a consumer sharing one connection.

use crate::broker::{Connection, ConnectionHandle};
use crate::config::ProtocolConfig;
use crate::consumer::Consumer;
use crate::error::Error;
use crate::nats::NatsConnection;
use crate::sender::Sender;
use crate::subscriber::Subscriber;
use crate::telemetry::Telemetry;
use async_nats::ConnectOptions;
use std::sync::Arc;
use tracing::info;

/// NATS protocol binding: one `Sender` and one `Consumer` on the same
/// connection and subject.
///
/// Both borrow the connection; only the protocol closes it, and only when
/// it owns it.
#[derive(Debug)]
pub struct Protocol {
    conn: ConnectionHandle,
    sender: Sender,
    consumer: Arc<Consumer>,
}

impl Protocol {
    /// Connect to NATS as described by `config`.
    ///
    /// The subscription strategy is validated before connecting.
    pub async fn connect(config: &ProtocolConfig, telemetry: Telemetry) -> Result<Self, Error> {
        let subscriber = config.subscriber.clone().into_subscriber()?;

        let mut options = ConnectOptions::new();
        if let Some(name) = &config.client_name {
            options = options.name(name);
        }
        let conn = NatsConnection::connect(&config.url, options).await?;

        info!(subject = %config.subject, subscriber = ?subscriber, "Protocol connected");
        Ok(Self::new(
            ConnectionHandle::Owned(Arc::new(conn)),
            config.subject.clone(),
            subscriber,
            telemetry,
        ))
    }

    /// Use a caller-managed connection.
    pub fn from_connection(
        conn: Arc<dyn Connection>,
        subject: impl Into<String>,
        subscriber: Box<dyn Subscriber>,
        telemetry: Telemetry,
    ) -> Self {
        Self::new(ConnectionHandle::Borrowed(conn), subject, subscriber, telemetry)
    }

    pub fn new(
        conn: ConnectionHandle,
        subject: impl Into<String>,
        subscriber: Box<dyn Subscriber>,
        telemetry: Telemetry,
    ) -> Self {
        let subject = subject.into();
        Self {
            sender: Sender::new(conn.borrowed(), subject.clone(), telemetry),
            consumer: Arc::new(Consumer::new(conn.borrowed(), subject, subscriber)),
            conn,
        }
    }

    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    pub fn consumer(&self) -> &Arc<Consumer> {
        &self.consumer
    }

    /// Close the consumer, then the connection if owned.
    ///
    /// The connection is closed even when closing the consumer fails.
    pub async fn close(&self) -> Result<(), Error> {
        let consumer = self.consumer.close().await;
        let conn = self.conn.close_if_owned().await;
        consumer.and(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use crate::subscriber::RegularSubscriber;

    #[tokio::test]
    async fn test_close_owned_connection_once() {
        let broker = MemoryBroker::new();
        let protocol = Protocol::new(
            ConnectionHandle::Owned(Arc::new(broker.clone())),
            "orders",
            Box::new(RegularSubscriber),
            Telemetry::noop(),
        );

        protocol.close().await.unwrap();
        assert!(broker.is_closed());
        // sender and consumer only borrow the connection
        assert_eq!(broker.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_borrowed_connection_stays_open() {
        let broker = MemoryBroker::new();
        let protocol = Protocol::from_connection(
            Arc::new(broker.clone()),
            "orders",
            Box::new(RegularSubscriber),
            Telemetry::noop(),
        );

        protocol.close().await.unwrap();
        assert!(!broker.is_closed());
        assert_eq!(protocol.sender().subject(), "orders");
        assert_eq!(protocol.consumer().subject(), "orders");
    }

    #[tokio::test]
    async fn test_connect_validates_before_connecting() {
        let config = ProtocolConfig::new("nats://127.0.0.1:1", "orders").with_subscriber(
            crate::config::SubscriberConfig::Queue {
                queue: String::new(),
            },
        );

        let err = Protocol::connect(&config, Telemetry::noop()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidQueueName));
    }
}
