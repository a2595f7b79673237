//! CloudEvents protocol binding for NATS.
//!
//! This crate provides:
//! - `Sender` and `Consumer` over a shared NATS connection, owned or borrowed
//! - Subscription strategies: plain, queue group, and queue pool over several subjects
//! - OpenTelemetry trace propagation through message headers and an embedded
//!   event extension
//! - Span and metrics middleware for sent, received and malformed events
//! - An in-memory broker for tests
//!
//! # Example
//!
//! ```rust,ignore
//! use cloudevents_nats::{Client, Event, Observability, Protocol, ProtocolConfig, Telemetry};
//!
//! let config = ProtocolConfig::from_env()?;
//! let telemetry = Telemetry::new(tracer);
//! let protocol = Protocol::connect(&config, telemetry.clone()).await?;
//! let client = Client::new(protocol, Observability::new(telemetry));
//!
//! client.send(&Context::new(), Event::new("com.example.order.created", "orders-api")).await?;
//! client.start_receiver(&Context::new(), &cancel, handler).await?;
//! ```

pub mod broker;
pub mod carrier;
pub mod client;
pub mod config;
pub mod consumer;
pub mod context;
pub mod error;
pub mod event;
pub mod extension;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod nats;
pub mod observability;
pub mod protocol;
pub mod sender;
pub mod subscriber;
pub mod telemetry;

pub use broker::{Connection, ConnectionHandle, Subscription};
pub use carrier::HeaderCarrier;
pub use client::{Client, EventHandler, HandlerError};
pub use config::{ProtocolConfig, SubscriberConfig};
pub use consumer::Consumer;
pub use error::{DrainOutcome, Error};
pub use event::Event;
pub use message::{EventMessage, InboundMessage, Message, Transformer};
pub use crate::metrics::{init_metrics, EventMetrics, MetricsCollector};
pub use nats::NatsConnection;
pub use observability::{Observability, SpanCompletion};
pub use protocol::Protocol;
pub use sender::Sender;
pub use subscriber::{
    DrainList, QueuePoolSubscriber, QueueSubscriber, RegularSubscriber, Subscriber,
};
pub use telemetry::Telemetry;

// Re-export for callers building contexts and tokens
pub use opentelemetry::Context;
pub use tokio_util::sync::CancellationToken;
