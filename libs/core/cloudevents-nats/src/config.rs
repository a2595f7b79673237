//! Construction-time configuration.

use crate::error::Error;
use crate::subscriber::{QueuePoolSubscriber, QueueSubscriber, RegularSubscriber, Subscriber};
use serde::{Deserialize, Serialize};
use std::env;

pub const DEFAULT_NATS_URL: &str = "nats://localhost:4222";
pub const DEFAULT_RECEIVER_CONCURRENCY: usize = 1;

/// Subscription strategy selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SubscriberConfig {
    #[default]
    Regular,
    Queue {
        queue: String,
    },
    QueuePool {
        queue: String,
        subjects: Vec<String>,
    },
}

impl SubscriberConfig {
    /// Build the strategy, failing on an empty queue name or subject list.
    pub fn into_subscriber(self) -> Result<Box<dyn Subscriber>, Error> {
        Ok(match self {
            SubscriberConfig::Regular => Box::new(RegularSubscriber),
            SubscriberConfig::Queue { queue } => Box::new(QueueSubscriber::new(queue)?),
            SubscriberConfig::QueuePool { queue, subjects } => {
                Box::new(QueuePoolSubscriber::new(queue, subjects)?)
            }
        })
    }
}

/// Settings for a `Protocol` and the `Client` built on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// NATS server URL
    pub url: String,
    /// Default subject for sending and receiving
    pub subject: String,
    #[serde(default)]
    pub subscriber: SubscriberConfig,
    /// Connection name reported to the server
    #[serde(default)]
    pub client_name: Option<String>,
    /// Maximum number of events handled at once
    #[serde(default = "default_concurrency")]
    pub receiver_concurrency: usize,
}

fn default_concurrency() -> usize {
    DEFAULT_RECEIVER_CONCURRENCY
}

impl ProtocolConfig {
    pub fn new(url: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            subject: subject.into(),
            subscriber: SubscriberConfig::default(),
            client_name: None,
            receiver_concurrency: DEFAULT_RECEIVER_CONCURRENCY,
        }
    }

    pub fn with_subscriber(mut self, subscriber: SubscriberConfig) -> Self {
        self.subscriber = subscriber;
        self
    }

    /// Load from environment variables.
    ///
    /// - `NATS_URL` (default `nats://localhost:4222`)
    /// - `NATS_SUBJECT` (required)
    /// - `NATS_QUEUE`: join a queue group
    /// - `NATS_QUEUE_SUBJECTS`: comma-separated subjects for a queue pool, requires `NATS_QUEUE`
    /// - `NATS_CLIENT_NAME`
    /// - `RECEIVER_CONCURRENCY` (default 1)
    pub fn from_env() -> Result<Self, Error> {
        let url = env_or_default("NATS_URL", DEFAULT_NATS_URL);
        let subject = env_required("NATS_SUBJECT")?;

        let queue = env::var("NATS_QUEUE").ok();
        let pool_subjects = env::var("NATS_QUEUE_SUBJECTS").ok().map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect::<Vec<_>>()
        });

        let subscriber = match (queue, pool_subjects) {
            (None, None) => SubscriberConfig::Regular,
            (Some(queue), None) => SubscriberConfig::Queue { queue },
            (Some(queue), Some(subjects)) => SubscriberConfig::QueuePool { queue, subjects },
            (None, Some(_)) => {
                return Err(Error::config("NATS_QUEUE_SUBJECTS requires NATS_QUEUE"));
            }
        };

        let receiver_concurrency = match env::var("RECEIVER_CONCURRENCY") {
            Ok(value) => value
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    Error::config(format!(
                        "failed to parse RECEIVER_CONCURRENCY: {value:?} is not a positive integer"
                    ))
                })?,
            Err(_) => DEFAULT_RECEIVER_CONCURRENCY,
        };

        Ok(Self {
            url,
            subject,
            subscriber,
            client_name: env::var("NATS_CLIENT_NAME").ok(),
            receiver_concurrency,
        })
    }
}

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_required(key: &str) -> Result<String, Error> {
    env::var(key).map_err(|_| Error::config(format!("environment variable {key} is required but not set")))
}
