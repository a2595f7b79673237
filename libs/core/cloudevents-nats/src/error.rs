//! Error types for the NATS CloudEvents binding.

use std::fmt;
use thiserror::Error;

/// Boxed error produced by a broker client.
///
/// Broker errors are carried unchanged so callers can downcast to the
/// concrete `async_nats` error when they need to.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error that can occur in protocol operations.
///
/// # Kinds
///
/// - **Configuration**: `InvalidQueueName`, `EmptySubjectList`, `Config` (fail before any network activity)
/// - **Broker**: `Connect`, `Subscribe`, `PoolSubscribe`, `Drain`, `Publish`, `ConnectionClosed`
/// - **Encoding**: `Serialization`, `MalformedEvent`
/// - **Tracing**: `TraceInjection`, `TraceExtension`
/// - **Lifecycle**: `StreamEnded`, `ConsumerClosed`, `Finish`, `Task`
#[derive(Debug, Error)]
pub enum Error {
    /// Queue group name is empty
    #[error("invalid queue name")]
    InvalidQueueName,

    /// Queue pool was configured without subjects
    #[error("empty subject list")]
    EmptySubjectList,

    /// Invalid or missing configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// NATS connection error
    #[error("NATS connection error: {0}")]
    Connect(#[source] BoxError),

    /// Subscribe rejected by the broker
    #[error("subscribe error on {subject:?}: {source}")]
    Subscribe {
        subject: String,
        #[source]
        source: BoxError,
    },

    /// A queue pool member failed to subscribe; earlier members were cleaned up
    #[error("subject {subject:?} subscribe error {source} (drain result: {cleanup})")]
    PoolSubscribe {
        subject: String,
        #[source]
        source: Box<Error>,
        cleanup: DrainOutcome,
    },

    /// Draining an active subscription failed
    #[error("drain error on {subject:?}: {source}")]
    Drain {
        subject: String,
        #[source]
        source: BoxError,
    },

    /// Publish rejected by the broker
    #[error("publish error on {subject:?}: {source}")]
    Publish {
        subject: String,
        #[source]
        source: BoxError,
    },

    /// The connection was already closed
    #[error("connection closed")]
    ConnectionClosed,

    /// Event could not be serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Inbound payload is not a valid event
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Trace context could not be written into transport metadata
    #[error("trace context injection failed: {0}")]
    TraceInjection(String),

    /// Embedded trace extension is missing or cannot be decoded
    #[error("trace extension error: {0}")]
    TraceExtension(String),

    /// Finish notification failed while an earlier error already existed
    #[error("failed to finish message when error already occurred: {finish}: {original}")]
    Finish {
        finish: Box<Error>,
        #[source]
        original: Box<Error>,
    },

    /// Intake stream is closed or the receive was cancelled
    #[error("stream ended")]
    StreamEnded,

    /// Consumer was closed and cannot be opened again
    #[error("consumer closed")]
    ConsumerClosed,

    /// A background receiver task panicked or was aborted
    #[error("receiver task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a subscribe error from a broker error.
    pub fn subscribe(subject: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Subscribe {
            subject: subject.into(),
            source: source.into(),
        }
    }

    /// Create a drain error from a broker error.
    pub fn drain(subject: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Drain {
            subject: subject.into(),
            source: source.into(),
        }
    }

    /// Create a publish error from a broker error.
    pub fn publish(subject: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Publish {
            subject: subject.into(),
            source: source.into(),
        }
    }

    /// Combine a failed finish notification with the error that preceded it.
    ///
    /// The original error stays reachable through `source()` and its
    /// message is kept in the combined message.
    pub fn finish(finish: Error, original: Error) -> Self {
        Self::Finish {
            finish: Box::new(finish),
            original: Box::new(original),
        }
    }

    /// Check if this error is a configuration error.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::InvalidQueueName | Error::EmptySubjectList | Error::Config(_)
        )
    }

    /// Check if this error signals the end of the intake stream.
    pub fn is_stream_ended(&self) -> bool {
        matches!(self, Error::StreamEnded)
    }
}

/// Result of best-effort cleanup after a partial queue pool subscribe.
#[derive(Debug, Default)]
pub struct DrainOutcome {
    failures: Vec<Error>,
}

impl DrainOutcome {
    /// Record a drain failure.
    pub fn push(&mut self, error: Error) {
        self.failures.push(error);
    }

    /// Check if every drain succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Drain failures in subscription order.
    pub fn failures(&self) -> &[Error] {
        &self.failures
    }
}

impl fmt::Display for DrainOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failures.is_empty() {
            return write!(f, "ok");
        }
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_finish_keeps_original_message() {
        let original = Error::publish("orders", "no responders");
        let combined = Error::finish(Error::config("ack failed"), original);

        let message = combined.to_string();
        assert!(message.contains("ack failed"));
        assert!(message.contains("no responders"));
        assert!(combined.source().is_some());
    }

    #[test]
    fn test_config_errors() {
        assert!(Error::InvalidQueueName.is_config());
        assert!(Error::EmptySubjectList.is_config());
        assert!(Error::config("NATS_SUBJECT").is_config());
        assert!(!Error::StreamEnded.is_config());
    }

    #[test]
    fn test_pool_subscribe_message() {
        let mut cleanup = DrainOutcome::default();
        assert_eq!(cleanup.to_string(), "ok");

        cleanup.push(Error::drain("topicA", "connection reset"));
        let err = Error::PoolSubscribe {
            subject: "topicB".to_string(),
            source: Box::new(Error::subscribe("topicB", "permissions violation")),
            cleanup,
        };

        let message = err.to_string();
        assert!(message.contains("\"topicB\""));
        assert!(message.contains("permissions violation"));
        assert!(message.contains("connection reset"));
    }
}
