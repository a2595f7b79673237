//! Subscription strategies.
//!
//! A `Subscriber` decides how a consumer's logical subscription is created:
//!
//! - **Regular**: one subject, no group
//! - **Queue**: one subject under a queue group (competing consumers)
//! - **QueuePool**: one queue group over several subjects, all feeding the
//!   same intake channel
//!
//! Queue names and subject lists are validated at construction, so invalid
//! strategies never reach the broker.

use crate::broker::{Connection, Intake, Subscription};
use crate::error::{DrainOutcome, Error};
use async_trait::async_trait;
use std::fmt;
use tracing::{debug, warn};

/// Creates subscriptions against a connection.
#[async_trait]
pub trait Subscriber: Send + Sync + fmt::Debug {
    /// Subscribe and deliver every message into `intake`.
    ///
    /// `subject` is the consumer's configured subject; strategies that carry
    /// their own subjects ignore it.
    async fn subscribe(
        &self,
        conn: &dyn Connection,
        subject: &str,
        intake: &Intake,
    ) -> Result<Box<dyn Subscription>, Error>;
}

/// Plain subscription without a queue group.
#[derive(Debug, Clone, Default)]
pub struct RegularSubscriber;

#[async_trait]
impl Subscriber for RegularSubscriber {
    async fn subscribe(
        &self,
        conn: &dyn Connection,
        subject: &str,
        intake: &Intake,
    ) -> Result<Box<dyn Subscription>, Error> {
        conn.subscribe(subject, None, intake.clone()).await
    }
}

/// Subscription joined to a queue group.
#[derive(Debug, Clone)]
pub struct QueueSubscriber {
    queue: String,
}

impl QueueSubscriber {
    /// Create a queue subscriber. Fails on an empty queue name.
    pub fn new(queue: impl Into<String>) -> Result<Self, Error> {
        let queue = queue.into();
        if queue.is_empty() {
            return Err(Error::InvalidQueueName);
        }
        Ok(Self { queue })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}

#[async_trait]
impl Subscriber for QueueSubscriber {
    async fn subscribe(
        &self,
        conn: &dyn Connection,
        subject: &str,
        intake: &Intake,
    ) -> Result<Box<dyn Subscription>, Error> {
        conn.subscribe(subject, Some(&self.queue), intake.clone())
            .await
    }
}

/// One queue group subscribed to an ordered list of subjects.
#[derive(Debug, Clone)]
pub struct QueuePoolSubscriber {
    queue: String,
    subjects: Vec<String>,
}

impl QueuePoolSubscriber {
    /// Create a queue pool. Fails on an empty queue name or subject list.
    pub fn new<I, S>(queue: impl Into<String>, subjects: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queue = queue.into();
        if queue.is_empty() {
            return Err(Error::InvalidQueueName);
        }

        let subjects: Vec<String> = subjects.into_iter().map(Into::into).collect();
        if subjects.is_empty() {
            return Err(Error::EmptySubjectList);
        }

        Ok(Self { queue, subjects })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn subjects(&self) -> &[String] {
        &self.subjects
    }
}

#[async_trait]
impl Subscriber for QueuePoolSubscriber {
    async fn subscribe(
        &self,
        conn: &dyn Connection,
        _subject: &str,
        intake: &Intake,
    ) -> Result<Box<dyn Subscription>, Error> {
        let mut list = DrainList::with_capacity(self.subjects.len());

        for subject in &self.subjects {
            match conn
                .subscribe(subject, Some(&self.queue), intake.clone())
                .await
            {
                Ok(subscription) => {
                    debug!(subject = %subject, queue = %self.queue, "Pool member subscribed");
                    list.push(subject.clone(), subscription);
                }
                Err(e) => {
                    let cleanup = list.drain_all().await;
                    warn!(
                        subject = %subject,
                        queue = %self.queue,
                        error = %e,
                        cleanup = %cleanup,
                        "Pool subscribe failed, drained earlier members"
                    );
                    return Err(Error::PoolSubscribe {
                        subject: subject.clone(),
                        source: Box::new(e),
                        cleanup,
                    });
                }
            }
        }

        Ok(Box::new(list))
    }
}

/// Ordered list of subscriptions drained as one.
#[derive(Debug, Default)]
pub struct DrainList {
    members: Vec<(String, Box<dyn Subscription>)>,
}

impl DrainList {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            members: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, subject: String, subscription: Box<dyn Subscription>) {
        self.members.push((subject, subscription));
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Drain every member regardless of failures, collecting them.
    pub async fn drain_all(&mut self) -> DrainOutcome {
        let mut outcome = DrainOutcome::default();
        for (_, subscription) in self.members.drain(..) {
            let mut subscription = subscription;
            if let Err(e) = subscription.drain().await {
                outcome.push(e);
            }
        }
        outcome
    }
}

#[async_trait]
impl Subscription for DrainList {
    /// Drain members in subscription order.
    ///
    /// Stops at the first failure and returns it; members after the failing
    /// one stay undrained and remain in the list.
    async fn drain(&mut self) -> Result<(), Error> {
        while !self.members.is_empty() {
            let (subject, mut subscription) = self.members.remove(0);
            if let Err(e) = subscription.drain().await {
                warn!(subject = %subject, error = %e, "Pool member drain failed");
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use tokio::sync::mpsc;

    #[test]
    fn test_queue_subscriber_rejects_empty_queue() {
        assert!(matches!(
            QueueSubscriber::new(""),
            Err(Error::InvalidQueueName)
        ));
        assert_eq!(QueueSubscriber::new("workers").unwrap().queue(), "workers");
    }

    #[test]
    fn test_queue_pool_validation() {
        assert!(matches!(
            QueuePoolSubscriber::new("", ["a"]),
            Err(Error::InvalidQueueName)
        ));
        assert!(matches!(
            QueuePoolSubscriber::new("g1", Vec::<String>::new()),
            Err(Error::EmptySubjectList)
        ));

        let pool = QueuePoolSubscriber::new("g1", ["topicA", "topicB"]).unwrap();
        assert_eq!(pool.subjects(), ["topicA", "topicB"]);
    }

    #[tokio::test]
    async fn test_regular_subscribe_error_propagates() {
        let broker = MemoryBroker::new();
        broker.fail_subscribe("orders");
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = RegularSubscriber
            .subscribe(&broker, "orders", &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Subscribe { .. }));
    }

    #[tokio::test]
    async fn test_queue_subscribe_uses_group() {
        let broker = MemoryBroker::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let _sub = QueueSubscriber::new("workers")
            .unwrap()
            .subscribe(&broker, "orders", &tx)
            .await
            .unwrap();

        assert_eq!(
            broker.active_subscriptions(),
            vec![("orders".to_string(), Some("workers".to_string()))]
        );
    }

    #[tokio::test]
    async fn test_pool_ignores_consumer_subject() {
        let broker = MemoryBroker::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = QueuePoolSubscriber::new("g1", ["topicA", "topicB"]).unwrap();

        let _sub = pool.subscribe(&broker, "unused", &tx).await.unwrap();

        let subjects: Vec<String> = broker
            .active_subscriptions()
            .into_iter()
            .map(|(subject, _)| subject)
            .collect();
        assert_eq!(subjects, vec!["topicA", "topicB"]);
    }

    #[tokio::test]
    async fn test_pool_partial_failure_drains_earlier_and_stops() {
        let broker = MemoryBroker::new();
        broker.fail_subscribe("topicB");
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = QueuePoolSubscriber::new("g1", ["topicA", "topicB", "topicC"]).unwrap();

        let err = pool.subscribe(&broker, "", &tx).await.unwrap_err();

        assert!(err.to_string().contains("topicB"));
        assert!(broker.active_subscriptions().is_empty());
        assert_eq!(broker.drained(), vec!["topicA"]);
        // topicC is never attempted
        assert_eq!(broker.subscribe_attempts(), vec!["topicA", "topicB"]);
    }

    #[tokio::test]
    async fn test_pool_cleanup_reports_drain_failures() {
        let broker = MemoryBroker::new();
        broker.fail_drain("topicA");
        broker.fail_subscribe("topicC");
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = QueuePoolSubscriber::new("g1", ["topicA", "topicB", "topicC"]).unwrap();

        let err = pool.subscribe(&broker, "", &tx).await.unwrap_err();

        match err {
            Error::PoolSubscribe { subject, cleanup, .. } => {
                assert_eq!(subject, "topicC");
                assert_eq!(cleanup.failures().len(), 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        // cleanup kept going past the failing member
        assert_eq!(broker.drained(), vec!["topicB"]);
    }

    #[tokio::test]
    async fn test_drain_list_stops_at_first_failure() {
        let broker = MemoryBroker::new();
        broker.fail_drain("topicB");
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = QueuePoolSubscriber::new("g1", ["topicA", "topicB", "topicC"]).unwrap();

        let mut sub = pool.subscribe(&broker, "", &tx).await.unwrap();
        let err = sub.drain().await.unwrap_err();

        assert!(err.to_string().contains("topicB"));
        assert_eq!(broker.drained(), vec!["topicA"]);
        // topicC left undrained until the handle goes away
        assert_eq!(broker.active_subscriptions().len(), 2);
        drop(sub);
        assert!(broker.active_subscriptions().is_empty());
        assert_eq!(broker.drained(), vec!["topicA"]);
    }
}
