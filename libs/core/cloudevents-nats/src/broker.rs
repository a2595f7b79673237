//! Broker client abstraction.
//!
//! The binding only needs publish, subscribe-into-a-channel, drain and close.
//! `NatsConnection` implements it over `async_nats`; `MemoryBroker` implements
//! it in-process for tests.

use crate::error::Error;
use crate::message::InboundMessage;
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sending half of a consumer's intake channel.
pub type Intake = mpsc::UnboundedSender<InboundMessage>;

/// An open broker session.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Publish a payload with headers to a subject.
    async fn publish(&self, subject: &str, headers: HeaderMap, payload: Bytes)
        -> Result<(), Error>;

    /// Subscribe to a subject, optionally under a queue group, delivering
    /// every message into `intake`.
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        intake: Intake,
    ) -> Result<Box<dyn Subscription>, Error>;

    /// Close the session.
    async fn close(&self) -> Result<(), Error>;
}

/// An active subscription.
#[async_trait]
pub trait Subscription: Send + fmt::Debug {
    /// Stop accepting new messages, deliver the buffered ones, then release
    /// broker-side resources.
    async fn drain(&mut self) -> Result<(), Error>;
}

/// A connection together with who is responsible for closing it.
///
/// Fixed at construction: an owned connection is closed by the component
/// holding it, a borrowed one never is.
#[derive(Clone)]
pub enum ConnectionHandle {
    Owned(Arc<dyn Connection>),
    Borrowed(Arc<dyn Connection>),
}

impl ConnectionHandle {
    pub fn connection(&self) -> &Arc<dyn Connection> {
        match self {
            ConnectionHandle::Owned(conn) | ConnectionHandle::Borrowed(conn) => conn,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, ConnectionHandle::Owned(_))
    }

    /// A borrowed handle to the same connection.
    pub fn borrowed(&self) -> Self {
        ConnectionHandle::Borrowed(self.connection().clone())
    }

    /// Close the connection if this handle owns it.
    pub async fn close_if_owned(&self) -> Result<(), Error> {
        match self {
            ConnectionHandle::Owned(conn) => conn.close().await,
            ConnectionHandle::Borrowed(_) => Ok(()),
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionHandle::Owned(_) => f.write_str("ConnectionHandle::Owned"),
            ConnectionHandle::Borrowed(_) => f.write_str("ConnectionHandle::Borrowed"),
        }
    }
}
