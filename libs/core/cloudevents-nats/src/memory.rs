//! In-process broker for tests.
//!
//! Implements `Connection` with NATS subject matching (`*` matches one token,
//! `>` matches the rest) and queue groups that deliver each message to one
//! member. Failures can be injected per subject. Dropping a subscription
//! handle unsubscribes it without recording a drain, the way a dropped NATS
//! subscription stops delivering.

use crate::broker::{Connection, Intake, Subscription};
use crate::error::Error;
use crate::message::InboundMessage;
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// In-memory broker shared by every clone.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    subscriptions: Vec<Entry>,
    published: Vec<InboundMessage>,
    drained: Vec<String>,
    subscribe_attempts: Vec<String>,
    failing_subscribes: HashSet<String>,
    failing_drains: HashSet<String>,
    fail_publish: bool,
    closed: bool,
    close_calls: usize,
    group_cursor: HashMap<String, usize>,
}

struct Entry {
    id: u64,
    subject: String,
    group: Option<String>,
    intake: Intake,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every subscribe to `subject` fail.
    pub fn fail_subscribe(&self, subject: &str) {
        self.state().failing_subscribes.insert(subject.to_string());
    }

    /// Make draining any subscription on `subject` fail.
    pub fn fail_drain(&self, subject: &str) {
        self.state().failing_drains.insert(subject.to_string());
    }

    /// Make every publish fail.
    pub fn fail_publish(&self) {
        self.state().fail_publish = true;
    }

    /// Deliver a raw payload without headers, bypassing publish failures.
    pub fn inject(&self, subject: &str, payload: impl Into<Bytes>) {
        let message = InboundMessage::new(subject, HeaderMap::new(), payload.into());
        self.state().route(message);
    }

    /// Every message published so far, in order.
    pub fn published(&self) -> Vec<InboundMessage> {
        self.state().published.clone()
    }

    /// Live subscriptions as `(subject, queue group)`, in subscription order.
    pub fn active_subscriptions(&self) -> Vec<(String, Option<String>)> {
        self.state()
            .subscriptions
            .iter()
            .map(|entry| (entry.subject.clone(), entry.group.clone()))
            .collect()
    }

    /// Subjects of successfully drained subscriptions, in drain order.
    pub fn drained(&self) -> Vec<String> {
        self.state().drained.clone()
    }

    /// Subjects passed to subscribe, including failed attempts.
    pub fn subscribe_attempts(&self) -> Vec<String> {
        self.state().subscribe_attempts.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn close_calls(&self) -> usize {
        self.state().close_calls
    }
}

impl State {
    fn route(&mut self, message: InboundMessage) {
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();

        for (index, entry) in self.subscriptions.iter().enumerate() {
            if !subject_matches(&entry.subject, &message.subject) {
                continue;
            }
            match &entry.group {
                Some(group) => groups.entry(group.clone()).or_default().push(index),
                None => {
                    let _ = entry.intake.send(message.clone());
                }
            }
        }

        for (group, members) in groups {
            let cursor = self.group_cursor.entry(group).or_default();
            let index = members[*cursor % members.len()];
            *cursor += 1;
            let _ = self.subscriptions[index].intake.send(message.clone());
        }

        self.published.push(message);
    }
}

#[async_trait]
impl Connection for MemoryBroker {
    async fn publish(
        &self,
        subject: &str,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<(), Error> {
        let mut state = self.state();
        if state.closed {
            return Err(Error::ConnectionClosed);
        }
        if state.fail_publish {
            return Err(Error::publish(subject, "publish rejected"));
        }
        state.route(InboundMessage::new(subject, headers, payload));
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        intake: Intake,
    ) -> Result<Box<dyn Subscription>, Error> {
        let mut state = self.state();
        state.subscribe_attempts.push(subject.to_string());
        if state.closed {
            return Err(Error::ConnectionClosed);
        }
        if state.failing_subscribes.contains(subject) {
            return Err(Error::subscribe(subject, "subscription rejected"));
        }

        state.next_id += 1;
        let id = state.next_id;
        state.subscriptions.push(Entry {
            id,
            subject: subject.to_string(),
            group: queue_group.map(str::to_string),
            intake,
        });

        Ok(Box::new(MemorySubscription {
            id,
            subject: subject.to_string(),
            broker: self.clone(),
        }))
    }

    async fn close(&self) -> Result<(), Error> {
        let mut state = self.state();
        state.closed = true;
        state.close_calls += 1;
        // dropping intakes lets consumers observe the end of the stream
        state.subscriptions.clear();
        Ok(())
    }
}

struct MemorySubscription {
    id: u64,
    subject: String,
    broker: MemoryBroker,
}

impl std::fmt::Debug for MemorySubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySubscription")
            .field("id", &self.id)
            .field("subject", &self.subject)
            .finish()
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn drain(&mut self) -> Result<(), Error> {
        let mut state = self.broker.state();
        if state.failing_drains.contains(&self.subject) {
            return Err(Error::drain(&self.subject, "drain rejected"));
        }

        let before = state.subscriptions.len();
        state.subscriptions.retain(|entry| entry.id != self.id);
        if state.subscriptions.len() < before {
            state.drained.push(self.subject.clone());
        }
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.broker
            .state()
            .subscriptions
            .retain(|entry| entry.id != self.id);
    }
}

/// NATS subject matching with `*` and `>` wildcards.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_subject_matching() {
        assert!(subject_matches("orders", "orders"));
        assert!(subject_matches("orders.*", "orders.created"));
        assert!(!subject_matches("orders.*", "orders.created.eu"));
        assert!(subject_matches("orders.>", "orders.created.eu"));
        assert!(!subject_matches("orders.>", "orders"));
        assert!(!subject_matches("orders", "payments"));
    }

    #[tokio::test]
    async fn test_queue_group_delivers_to_one_member() {
        let broker = MemoryBroker::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let (tx_c, mut rx_c) = mpsc::unbounded_channel();

        let _a = broker.subscribe("orders", Some("g"), tx_a).await.unwrap();
        let _b = broker.subscribe("orders", Some("g"), tx_b).await.unwrap();
        let _c = broker.subscribe("orders", None, tx_c).await.unwrap();

        for _ in 0..2 {
            broker
                .publish("orders", HeaderMap::new(), Bytes::from_static(b"x"))
                .await
                .unwrap();
        }

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
        // plain subscriptions see everything
        assert!(rx_c.try_recv().is_ok());
        assert!(rx_c.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_drain_keeps_buffered_messages() {
        let broker = MemoryBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sub = broker.subscribe("orders", None, tx).await.unwrap();

        broker.inject("orders", "first");
        sub.drain().await.unwrap();
        broker.inject("orders", "second");

        assert_eq!(rx.recv().await.unwrap().payload, "first");
        // the subscription released its intake sender
        assert!(rx.recv().await.is_none());
        assert_eq!(broker.drained(), vec!["orders"]);
    }

    #[tokio::test]
    async fn test_dropped_subscription_stops_delivery() {
        let broker = MemoryBroker::new();
        broker.fail_drain("orders");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sub = broker.subscribe("orders", None, tx).await.unwrap();

        assert!(sub.drain().await.is_err());
        // a failed drain leaves the subscription live
        assert_eq!(broker.active_subscriptions().len(), 1);

        drop(sub);
        broker.inject("orders", "late");

        assert!(broker.active_subscriptions().is_empty());
        assert!(broker.drained().is_empty());
        assert!(rx.recv().await.is_none());
    }
}
