//! In-process message broker
//!
//! Routes envelopes across two disjoint transports under one interface:
//! pub/sub topics with wildcard subscription matching, and point-to-point
//! pipes. Subscription channels are bounded; under pressure the oldest
//! message for the backlogged subscriber is dropped, an overflow event is
//! published, and delivery continues. Expired envelopes are dropped at
//! dispatch time.

pub mod pattern;
mod pipes;

use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::domain_types::ChannelCapacity;
use crate::envelope::{Envelope, EnvelopeError};

pub use pattern::TopicPattern;
pub use pipes::PipeReceiver;

/// Topic on which the broker reports dropped-oldest overflow events.
pub const OVERFLOW_TOPIC: &str = "broker:overflow";

/// Broker operation failures
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unknown pipe: {name}")]
    UnknownPipe { name: String },

    #[error("pipe {name} already has a receiver attached")]
    PipeReceiverAttached { name: String },

    #[error("subscription closed")]
    ClosedSubscription,

    #[error("broker is closed")]
    BrokerClosed,

    #[error("invalid envelope: {source}")]
    InvalidEnvelope {
        #[from]
        source: EnvelopeError,
    },
}

impl BrokerError {
    /// Whether the failure may clear on its own and is worth retrying
    ///
    /// An invalid envelope or a second pipe receiver will not get better
    /// with time; an unavailable broker, a closed subscription, or a
    /// missing pipe might.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BrokerClosed | Self::ClosedSubscription | Self::UnknownPipe { .. }
        )
    }
}

/// Monotonic broker counters
#[derive(Debug, Default)]
pub struct BrokerStats {
    published: AtomicU64,
    delivered: AtomicU64,
    expired: AtomicU64,
    overflow_dropped: AtomicU64,
}

/// Point-in-time copy of [`BrokerStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerStatsSnapshot {
    /// Envelopes accepted for topic publication.
    pub published: u64,
    /// Deliveries handed to subscriber channels (one per matched copy).
    pub delivered: u64,
    /// Envelopes dropped because their TTL elapsed before dispatch.
    pub expired: u64,
    /// Envelopes displaced by back-pressure (subscriptions and pipes).
    pub overflow_dropped: u64,
}

impl BrokerStats {
    fn snapshot(&self) -> BrokerStatsSnapshot {
        BrokerStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            overflow_dropped: self.overflow_dropped.load(Ordering::Relaxed),
        }
    }
}

struct SubscriptionEntry {
    id: Uuid,
    pattern: TopicPattern,
    sender: broadcast::Sender<Envelope>,
    capacity: usize,
}

/// In-process topic and pipe router
///
/// Cheap to share: all methods take `&self`. One broker instance serves a
/// whole cell; multiple cells in one process each own their own broker, so
/// nothing here is global.
pub struct Broker {
    subscriptions: RwLock<Vec<SubscriptionEntry>>,
    pipes: DashMap<String, Arc<pipes::Pipe>>,
    stats: Arc<BrokerStats>,
    default_capacity: ChannelCapacity,
    closed: AtomicBool,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(ChannelCapacity::default())
    }
}

impl Broker {
    /// Creates a broker whose channels default to the given capacity
    #[must_use]
    pub fn new(default_capacity: ChannelCapacity) -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            pipes: DashMap::new(),
            stats: Arc::new(BrokerStats::default()),
            default_capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Subscribes to a topic pattern with the default channel capacity
    pub fn subscribe(&self, pattern: &str) -> Result<Subscription, BrokerError> {
        self.subscribe_with_capacity(pattern, self.default_capacity)
    }

    /// Subscribes to a topic pattern with an explicit channel capacity
    pub fn subscribe_with_capacity(
        &self,
        pattern: &str,
        capacity: ChannelCapacity,
    ) -> Result<Subscription, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::BrokerClosed);
        }
        let compiled = TopicPattern::parse(pattern);
        let (sender, receiver) = broadcast::channel(capacity.as_usize());
        let id = Uuid::new_v4();
        let entry = SubscriptionEntry {
            id,
            pattern: compiled.clone(),
            sender,
            capacity: capacity.as_usize(),
        };
        self.subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
        trace!(subscription_id = %id, pattern = %compiled, "subscription registered");
        Ok(Subscription {
            id,
            pattern: compiled,
            receiver,
            stats: Arc::clone(&self.stats),
        })
    }

    /// Publishes an envelope to every subscription matching the topic
    ///
    /// Returns the number of subscriber copies handed off. An envelope
    /// whose TTL has elapsed is dropped silently (counted, not delivered).
    pub fn publish(&self, topic: &str, envelope: Envelope) -> Result<usize, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::BrokerClosed);
        }
        envelope.validate()?;
        if envelope.is_expired() {
            self.stats.expired.fetch_add(1, Ordering::Relaxed);
            debug!(topic, envelope_id = %envelope.id, "dropping expired envelope at dispatch");
            return Ok(0);
        }
        self.stats.published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0usize;
        let mut stale = Vec::new();
        let mut overflowed = Vec::new();
        {
            let subscriptions = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
            for entry in subscriptions.iter() {
                if !entry.pattern.matches(topic) {
                    continue;
                }
                if entry.sender.len() >= entry.capacity {
                    // The broadcast channel will displace its oldest value;
                    // the receiver observes the gap as a lag.
                    warn!(
                        topic,
                        pattern = %entry.pattern,
                        "subscription channel full, dropping oldest"
                    );
                    overflowed.push(entry.pattern.to_string());
                }
                match entry.sender.send(envelope.clone()) {
                    Ok(_) => delivered += 1,
                    Err(broadcast::error::SendError(_)) => stale.push(entry.id),
                }
            }
        }
        self.stats
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);

        if !stale.is_empty() {
            self.prune(&stale);
        }
        for pattern in overflowed {
            self.report_overflow(topic, &pattern);
        }
        trace!(topic, delivered, "published");
        Ok(delivered)
    }

    /// Sends an envelope into a named pipe, creating the pipe on first use
    pub fn pipe_send(&self, name: &str, envelope: Envelope) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::BrokerClosed);
        }
        envelope.validate()?;
        if envelope.is_expired() {
            self.stats.expired.fetch_add(1, Ordering::Relaxed);
            debug!(pipe = name, envelope_id = %envelope.id, "dropping expired envelope at dispatch");
            return Ok(());
        }
        let pipe = self.get_or_create_pipe(name);
        if let Some(displaced) = pipe.push(envelope) {
            warn!(
                pipe = name,
                displaced_id = %displaced.id,
                "pipe full, dropping oldest"
            );
            self.stats.overflow_dropped.fetch_add(1, Ordering::Relaxed);
            self.report_overflow(name, name);
        }
        Ok(())
    }

    /// Attaches the single receiver to a pipe, creating it on first use
    pub fn open_pipe(&self, name: &str) -> Result<PipeReceiver, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::BrokerClosed);
        }
        let pipe = self.get_or_create_pipe(name);
        if !pipe.try_attach_receiver() {
            return Err(BrokerError::PipeReceiverAttached {
                name: name.to_owned(),
            });
        }
        Ok(PipeReceiver::new(pipe, Arc::clone(&self.stats)))
    }

    /// Queue depth of a pipe
    pub fn pipe_depth(&self, name: &str) -> Result<usize, BrokerError> {
        self.pipes
            .get(name)
            .map(|pipe| pipe.depth())
            .ok_or_else(|| BrokerError::UnknownPipe {
                name: name.to_owned(),
            })
    }

    /// Current counter values
    #[must_use]
    pub fn stats(&self) -> BrokerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of live subscriptions
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Closes the broker: wakes pipe receivers and severs subscriptions
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for pipe in self.pipes.iter() {
            pipe.value().close();
        }
        self.subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        debug!("broker closed");
    }

    /// Whether [`Broker::close`] has run
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn get_or_create_pipe(&self, name: &str) -> Arc<pipes::Pipe> {
        self.pipes
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(pipes::Pipe::new(name, self.default_capacity.as_usize())))
            .clone()
    }

    fn prune(&self, stale: &[Uuid]) {
        let mut subscriptions = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        subscriptions.retain(|entry| {
            if stale.contains(&entry.id) {
                trace!(subscription_id = %entry.id, "pruning closed subscription");
                false
            } else {
                true
            }
        });
    }

    /// Publishes a drop-oldest notice, guarding against self-recursion
    fn report_overflow(&self, destination: &str, binding: &str) {
        if destination == OVERFLOW_TOPIC {
            return;
        }
        let payload = serde_json::json!({
            "destination": destination,
            "binding": binding,
        });
        let event = Envelope::new(
            "broker",
            OVERFLOW_TOPIC,
            "overflow",
            serde_json::to_vec(&payload).unwrap_or_default(),
        );
        if let Err(error) = self.publish(OVERFLOW_TOPIC, event) {
            debug!(%error, "failed to publish overflow event");
        }
    }
}

/// Receiving end of one topic subscription
///
/// Dropping the subscription unsubscribes: the broker prunes the entry on
/// its next matching publish.
pub struct Subscription {
    id: Uuid,
    pattern: TopicPattern,
    receiver: broadcast::Receiver<Envelope>,
    stats: Arc<BrokerStats>,
}

impl Subscription {
    /// The compiled pattern this subscription matches
    #[must_use]
    pub fn pattern(&self) -> &TopicPattern {
        &self.pattern
    }

    /// Unique id of this subscription
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Receives the next envelope matched to this subscription
    ///
    /// Messages displaced under back-pressure are skipped (counted as
    /// overflow drops); expired envelopes are dropped here at dispatch
    /// time. Returns `None` once the broker side is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => {
                    if envelope.is_expired() {
                        self.stats.expired.fetch_add(1, Ordering::Relaxed);
                        debug!(envelope_id = %envelope.id, "dropping expired envelope at receive");
                        continue;
                    }
                    return Some(envelope);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.stats
                        .overflow_dropped
                        .fetch_add(skipped, Ordering::Relaxed);
                    warn!(pattern = %self.pattern, skipped, "subscription lagged, oldest dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive; `None` when no live envelope is queued
    pub fn try_recv(&mut self) -> Option<Envelope> {
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) if envelope.is_expired() => {
                    self.stats.expired.fetch_add(1, Ordering::Relaxed);
                }
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    self.stats
                        .overflow_dropped
                        .fetch_add(skipped, Ordering::Relaxed);
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn envelope(topic: &str) -> Envelope {
        Envelope::new("test-source", topic, "test", b"payload".to_vec())
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscription() {
        let broker = Broker::default();
        let mut sub = broker.subscribe("a:events").unwrap();
        let delivered = broker.publish("a:events", envelope("a:events")).unwrap();
        assert_eq!(delivered, 1);
        let received = sub.recv().await.unwrap();
        assert_eq!(received.destination, "a:events");
    }

    #[tokio::test]
    async fn each_matching_subscription_gets_one_copy() {
        let broker = Broker::default();
        let mut star_events = broker.subscribe("*:events").unwrap();
        let mut project_star = broker.subscribe("project-a:*").unwrap();
        let mut exact = broker.subscribe("project-a:events").unwrap();
        let mut other = broker.subscribe("project-b:*").unwrap();

        let delivered = broker
            .publish("project-a:events", envelope("project-a:events"))
            .unwrap();
        assert_eq!(delivered, 3);

        assert!(star_events.recv().await.is_some());
        assert!(project_star.recv().await.is_some());
        assert!(exact.recv().await.is_some());
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn publish_order_is_preserved_per_source() {
        let broker = Broker::default();
        let mut sub = broker.subscribe("seq:*").unwrap();
        for i in 0..10u64 {
            let mut env = envelope("seq:data");
            env.sequence = i;
            broker.publish("seq:data", env).unwrap();
        }
        for i in 0..10u64 {
            assert_eq!(sub.recv().await.unwrap().sequence, i);
        }
    }

    #[tokio::test]
    async fn expired_envelope_is_dropped_and_counted() {
        let broker = Broker::default();
        let mut sub = broker.subscribe("t:x").unwrap();
        let mut env = envelope("t:x");
        env.ttl_seconds = 1;
        env.timestamp = chrono::Utc::now() - chrono::Duration::seconds(5);

        let delivered = broker.publish("t:x", env).unwrap();
        assert_eq!(delivered, 0);
        assert_eq!(broker.stats().expired, 1);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn pipe_is_fifo() {
        let broker = Broker::default();
        let mut receiver = broker.open_pipe("work").unwrap();
        for i in 0..5u64 {
            let mut env = envelope("work");
            env.sequence = i;
            broker.pipe_send("work", env).unwrap();
        }
        let cancel = CancellationToken::new();
        for i in 0..5u64 {
            assert_eq!(receiver.recv(&cancel).await.unwrap().sequence, i);
        }
    }

    #[tokio::test]
    async fn pipe_allows_single_receiver() {
        let broker = Broker::default();
        let _first = broker.open_pipe("solo").unwrap();
        assert!(matches!(
            broker.open_pipe("solo"),
            Err(BrokerError::PipeReceiverAttached { .. })
        ));
        drop(_first);
        assert!(broker.open_pipe("solo").is_ok());
    }

    #[tokio::test]
    async fn pipe_overflow_drops_oldest() {
        let broker = Broker::new(ChannelCapacity::try_new(3).unwrap());
        for i in 0..5u64 {
            let mut env = envelope("work");
            env.sequence = i;
            broker.pipe_send("work", env).unwrap();
        }
        assert_eq!(broker.pipe_depth("work").unwrap(), 3);
        assert_eq!(broker.stats().overflow_dropped, 2);

        let mut receiver = broker.open_pipe("work").unwrap();
        let cancel = CancellationToken::new();
        // Oldest two were displaced.
        assert_eq!(receiver.recv(&cancel).await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn unknown_pipe_depth_errors() {
        let broker = Broker::default();
        assert!(matches!(
            broker.pipe_depth("nope"),
            Err(BrokerError::UnknownPipe { .. })
        ));
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned_on_next_publish() {
        let broker = Broker::default();
        let sub = broker.subscribe("gone:*").unwrap();
        assert_eq!(broker.subscription_count(), 1);
        drop(sub);
        broker.publish("gone:now", envelope("gone:now")).unwrap();
        assert_eq!(broker.subscription_count(), 0);
    }

    #[tokio::test]
    async fn closed_broker_rejects_operations() {
        let broker = Broker::default();
        broker.close();
        assert!(matches!(
            broker.publish("t:x", envelope("t:x")),
            Err(BrokerError::BrokerClosed)
        ));
        assert!(matches!(
            broker.subscribe("t:*"),
            Err(BrokerError::BrokerClosed)
        ));
    }
}
