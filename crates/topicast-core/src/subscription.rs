//! Subscription handle for topicast.
//!
//! A subscription is one consumer's live attachment to a topic. It owns
//! the receiving half of a bounded delivery conduit; the broker holds the
//! sending half for as long as the subscription stays attached.

use std::fmt;

use tokio::sync::mpsc;
use uuid::Uuid;

pub use tokio::sync::mpsc::error::TryRecvError;

/// A unique subscription identifier.
///
/// Generated from 128 random bits so concurrent attach calls never need
/// to coordinate on a shared counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One consumer's attachment to a topic.
///
/// Created by [`Broker::attach`](crate::Broker::attach) and torn down by
/// [`Broker::detach`](crate::Broker::detach). The topic and id are fixed
/// at creation. The conduit closes once the broker has unlinked the
/// subscription and any in-flight publish snapshots have finished, after
/// which [`recv`](Subscription::recv) yields `None`.
pub struct Subscription<T> {
    topic: String,
    id: SubscriptionId,
    conduit: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(topic: String, id: SubscriptionId, conduit: mpsc::Receiver<T>) -> Self {
        Self { topic, id, conduit }
    }

    /// Get the topic this subscription is attached to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Get the subscription id.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next published payload.
    ///
    /// Returns `None` once the conduit is closed and drained, which
    /// signals that detachment has completed.
    pub async fn recv(&mut self) -> Option<T> {
        self.conduit.recv().await
    }

    /// Try to receive a payload without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`TryRecvError::Empty`] if no payload is buffered, or
    /// [`TryRecvError::Disconnected`] once the conduit is closed and
    /// drained.
    pub fn try_recv(&mut self) -> Result<T, TryRecvError> {
        self.conduit.try_recv()
    }

    /// Check whether the broker side of the conduit has been dropped.
    ///
    /// Buffered payloads may still be pending even when this returns
    /// `true`.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.conduit.is_closed()
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_ids_unique() {
        let ids: std::collections::HashSet<_> =
            (0..1000).map(|_| SubscriptionId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[tokio::test]
    async fn test_recv_none_after_sender_dropped() {
        let (tx, rx) = mpsc::channel::<u32>(4);
        let mut sub = Subscription::new("t".to_string(), SubscriptionId::generate(), rx);

        tx.send(7).await.unwrap();
        drop(tx);

        // Buffered payload is still delivered, then the conduit reports closed.
        assert_eq!(sub.recv().await, Some(7));
        assert_eq!(sub.recv().await, None);
        assert!(sub.is_closed());
    }

    #[test]
    fn test_accessors() {
        let (_tx, rx) = mpsc::channel::<u32>(1);
        let id = SubscriptionId::generate();
        let sub = Subscription::new("news".to_string(), id, rx);
        assert_eq!(sub.topic(), "news");
        assert_eq!(sub.id(), id);
    }
}
