//! The topicast broker.
//!
//! The broker owns the registry mapping each topic to its attached
//! subscriptions and performs publish fan-out. It is safe to call from
//! any number of tasks concurrently.
//!
//! Fan-out never holds the registry lock across a conduit hand-off: a
//! publish snapshots the topic's senders under a brief shard lock, then
//! delivers with a non-blocking send. A subscription detached while a
//! snapshot is in flight may or may not receive that one payload; that
//! snapshot is the atomicity boundary of publish vs. detach.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, trace, warn};

use crate::subscription::{Subscription, SubscriptionId};

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The topic name was empty. Topics are otherwise opaque strings.
    #[error("topic must not be empty")]
    EmptyTopic,
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Buffer capacity of each subscription's delivery conduit. When a
    /// subscriber's conduit is full, further deliveries to that
    /// subscriber are dropped rather than blocking the publisher.
    pub conduit_capacity: usize,
    /// Whether to remove a topic's registry entry once its last
    /// subscription detaches.
    pub auto_delete_empty_topics: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            conduit_capacity: 1024,
            auto_delete_empty_topics: true,
        }
    }
}

/// Registry entry for a single topic.
struct TopicEntry<T> {
    subscribers: HashMap<SubscriptionId, mpsc::Sender<T>>,
}

impl<T> TopicEntry<T> {
    fn new() -> Self {
        Self {
            subscribers: HashMap::new(),
        }
    }
}

/// The topic registry and fan-out engine.
///
/// `Broker<T>` is generic over the payload so serialization stays in the
/// transport layer; the server instantiates it with the raw message
/// bytes. Construct one per server (or per test) with [`Broker::new`];
/// there is no ambient singleton.
pub struct Broker<T> {
    /// Topics indexed by name.
    topics: DashMap<String, TopicEntry<T>>,
    /// Deliveries dropped because a subscriber's conduit was full.
    dropped: AtomicU64,
    /// Configuration.
    config: BrokerConfig,
}

impl<T: Clone> Broker<T> {
    /// Create a broker with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    /// Create a broker with custom configuration.
    #[must_use]
    pub fn with_config(config: BrokerConfig) -> Self {
        info!("Creating broker with config: {:?}", config);
        Self {
            topics: DashMap::new(),
            dropped: AtomicU64::new(0),
            config,
        }
    }

    /// Attach a new subscription to a topic.
    ///
    /// Every call creates a fresh subscription with its own id and
    /// conduit, even for the same topic.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::EmptyTopic`] if the topic is empty. The
    /// core performs no other validation of topic names.
    pub fn attach(&self, topic: &str) -> Result<Subscription<T>, BrokerError> {
        if topic.is_empty() {
            return Err(BrokerError::EmptyTopic);
        }

        let id = SubscriptionId::generate();
        let (tx, rx) = mpsc::channel(self.config.conduit_capacity);

        let mut entry = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| {
                debug!(topic = %topic, "Creating new topic");
                TopicEntry::new()
            });
        entry.subscribers.insert(id, tx);

        debug!(
            topic = %topic,
            subscription = %id,
            subscribers = entry.subscribers.len(),
            "Attached"
        );

        Ok(Subscription::new(topic.to_string(), id, rx))
    }

    /// Detach a subscription, unlinking it from the registry.
    ///
    /// The broker drops its sender for the subscription here; once any
    /// in-flight publish snapshots finish, the conduit closes and the
    /// subscription's `recv` yields `None`. Detach is terminal: calling
    /// it twice for the same subscription is a caller bug.
    pub fn detach(&self, sub: &Subscription<T>) {
        let mut removed = false;

        if let Some(mut entry) = self.topics.get_mut(sub.topic()) {
            removed = entry.subscribers.remove(&sub.id()).is_some();
            let now_empty = entry.subscribers.is_empty();
            drop(entry); // release the shard before removing the key

            if removed && now_empty && self.config.auto_delete_empty_topics {
                // A concurrent attach may have raced in; only remove if
                // the topic is still empty.
                self.topics
                    .remove_if(sub.topic(), |_, e| e.subscribers.is_empty());
            }
        }

        debug_assert!(removed, "detach called for a subscription that was not attached");

        if removed {
            debug!(topic = %sub.topic(), subscription = %sub.id(), "Detached");
        }
    }

    /// Publish a payload to every subscription currently attached to a
    /// topic.
    ///
    /// Returns the number of conduits the payload was handed to. Zero
    /// subscribers is a silent no-op. The hand-off is non-blocking: a
    /// subscriber whose conduit is full misses this payload instead of
    /// stalling publishers or other subscribers' detachment.
    pub fn publish(&self, topic: &str, payload: T) -> usize {
        // Snapshot the senders under the shard lock, deliver without it.
        let snapshot: Vec<(SubscriptionId, mpsc::Sender<T>)> = match self.topics.get(topic) {
            Some(entry) => entry
                .subscribers
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect(),
            None => {
                trace!(topic = %topic, "Publish to topic with no subscribers");
                return 0;
            }
        };

        let mut delivered = 0;
        for (id, tx) in snapshot {
            match tx.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(topic = %topic, subscription = %id, "Conduit full, dropping delivery");
                }
                Err(TrySendError::Closed(_)) => {
                    // Detached between snapshot and hand-off.
                    trace!(topic = %topic, subscription = %id, "Conduit closed mid-publish");
                }
            }
        }

        trace!(topic = %topic, recipients = delivered, "Published");
        delivered
    }

    /// Check if a topic has at least one attached subscription.
    #[must_use]
    pub fn topic_exists(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Get the number of subscriptions attached to a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|e| e.subscribers.len())
            .unwrap_or(0)
    }

    /// Get all topic names with at least one subscription.
    #[must_use]
    pub fn topic_names(&self) -> Vec<String> {
        self.topics.iter().map(|e| e.key().clone()).collect()
    }

    /// Get broker statistics.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            topic_count: self.topics.len(),
            subscription_count: self.topics.iter().map(|e| e.subscribers.len()).sum(),
            dropped_deliveries: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl<T: Clone> Default for Broker<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Broker statistics.
#[derive(Debug, Clone)]
pub struct BrokerStats {
    /// Number of topics with at least one subscription.
    pub topic_count: usize,
    /// Total number of attached subscriptions.
    pub subscription_count: usize,
    /// Deliveries dropped because a subscriber's conduit was full.
    pub dropped_deliveries: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_attach_empty_topic_rejected() {
        let broker: Broker<u32> = Broker::new();
        assert!(matches!(broker.attach(""), Err(BrokerError::EmptyTopic)));
        assert!(!broker.topic_exists(""));
    }

    #[test]
    fn test_attach_detach_registry() {
        let broker: Broker<u32> = Broker::new();

        let sub = broker.attach("events").unwrap();
        assert!(broker.topic_exists("events"));
        assert_eq!(broker.subscriber_count("events"), 1);

        broker.detach(&sub);
        // Last subscription gone, topic entry removed with it.
        assert!(!broker.topic_exists("events"));
        assert_eq!(broker.subscriber_count("events"), 0);
    }

    #[test]
    fn test_each_attach_is_distinct() {
        let broker: Broker<u32> = Broker::new();
        let s1 = broker.attach("t").unwrap();
        let s2 = broker.attach("t").unwrap();
        assert_ne!(s1.id(), s2.id());
        assert_eq!(broker.subscriber_count("t"), 2);
    }

    #[test]
    fn test_publish_no_subscribers_is_noop() {
        let broker: Broker<u32> = Broker::new();
        assert_eq!(broker.publish("empty-topic", 1), 0);
        assert!(!broker.topic_exists("empty-topic"));
    }

    #[tokio::test]
    async fn test_fanout_and_detach_on_one_topic() {
        let broker = Broker::new();
        let mut s1 = broker.attach("news").unwrap();
        let mut s2 = broker.attach("news").unwrap();

        assert_eq!(broker.publish("news", r#"{"x":1}"#), 2);
        assert_eq!(s1.recv().await, Some(r#"{"x":1}"#));
        assert_eq!(s2.recv().await, Some(r#"{"x":1}"#));

        broker.detach(&s1);

        assert_eq!(broker.publish("news", r#"{"x":2}"#), 1);
        assert_eq!(s2.recv().await, Some(r#"{"x":2}"#));
        // s1's conduit is closed and yields nothing further.
        assert_eq!(s1.recv().await, None);
        assert!(s1.is_closed());
    }

    #[tokio::test]
    async fn test_topic_isolation() {
        let broker = Broker::new();
        let mut a = broker.attach("alpha").unwrap();
        let mut b = broker.attach("beta").unwrap();

        assert_eq!(broker.publish("alpha", 1u32), 1);
        assert_eq!(a.recv().await, Some(1));
        // Nothing crossed over to the other topic.
        assert!(matches!(b.try_recv(), Err(crate::TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_per_subscriber_fifo() {
        let broker = Broker::new();
        let mut sub = broker.attach("ordered").unwrap();

        for i in 0..100u32 {
            assert_eq!(broker.publish("ordered", i), 1);
        }
        for i in 0..100u32 {
            assert_eq!(sub.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn test_no_delivery_after_detach() {
        let broker = Broker::new();
        let mut sub = broker.attach("t").unwrap();

        broker.publish("t", 1u32);
        assert_eq!(sub.recv().await, Some(1));

        broker.detach(&sub);
        assert_eq!(broker.publish("t", 2), 0);
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_stall_others() {
        let broker = Broker::with_config(BrokerConfig {
            conduit_capacity: 2,
            ..Default::default()
        });

        // One subscriber never drains its conduit.
        let slow = broker.attach("t").unwrap();
        let mut fast = broker.attach("t").unwrap();

        let run = timeout(Duration::from_secs(5), async {
            for i in 0..16u32 {
                broker.publish("t", i);
                assert_eq!(fast.recv().await, Some(i));
            }
            // Detaching the stalled subscriber is not blocked either.
            broker.detach(&slow);
        });
        run.await.expect("a full conduit stalled publish or detach");

        // 16 publishes against a capacity-2 conduit that never drained.
        assert_eq!(broker.stats().dropped_deliveries, 14);
        assert_eq!(broker.subscriber_count("t"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_publish_attach_detach() {
        const PUBLISHERS: usize = 4;
        const PER_PUBLISHER: u32 = 100;
        // Sentinel telling the drain task the publishers are done.
        const DONE: u32 = u32::MAX;

        let broker = Arc::new(Broker::with_config(BrokerConfig {
            conduit_capacity: 1024,
            ..Default::default()
        }));

        let mut sub = broker.attach("load").unwrap();
        let drain_broker = Arc::clone(&broker);
        let drain = tokio::spawn(async move {
            let mut next = [0u32; PUBLISHERS];
            loop {
                match sub.recv().await {
                    Some((DONE, _)) | None => break,
                    Some((p, i)) => {
                        // Per-publisher FIFO holds under concurrency.
                        assert_eq!(i, next[p as usize]);
                        next[p as usize] += 1;
                    }
                }
            }
            drain_broker.detach(&sub);
            next
        });

        // Attach/detach churn on the same topic while publishing.
        let churn_broker = Arc::clone(&broker);
        let churn = tokio::spawn(async move {
            for _ in 0..50 {
                let s = churn_broker.attach("load").unwrap();
                tokio::task::yield_now().await;
                churn_broker.detach(&s);
            }
        });

        let mut publishers = Vec::new();
        for p in 0..PUBLISHERS as u32 {
            let broker = Arc::clone(&broker);
            publishers.push(tokio::spawn(async move {
                for i in 0..PER_PUBLISHER {
                    broker.publish("load", (p, i));
                    tokio::task::yield_now().await;
                }
            }));
        }

        for task in publishers {
            task.await.unwrap();
        }
        churn.await.unwrap();

        broker.publish("load", (DONE, 0));
        let next = drain.await.unwrap();
        assert_eq!(next, [PER_PUBLISHER; PUBLISHERS]);
        assert_eq!(broker.subscriber_count("load"), 0);
    }

    #[test]
    fn test_stats() {
        let broker: Broker<u32> = Broker::new();
        let _s1 = broker.attach("a").unwrap();
        let _s2 = broker.attach("a").unwrap();
        let _s3 = broker.attach("b").unwrap();

        let stats = broker.stats();
        assert_eq!(stats.topic_count, 2);
        assert_eq!(stats.subscription_count, 3);
        assert_eq!(stats.dropped_deliveries, 0);

        let mut names = broker.topic_names();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_topics_case_sensitive() {
        let broker: Broker<u32> = Broker::new();
        let _s = broker.attach("News").unwrap();
        assert!(broker.topic_exists("News"));
        assert!(!broker.topic_exists("news"));
    }
}
