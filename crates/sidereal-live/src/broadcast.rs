//! Fan-out of live events to subscribers.
//!
//! Every subscriber owns its own bounded queue, so a slow consumer only
//! ever loses its own events. `publish` never awaits: a full queue drops the
//! newest event for that subscriber and a closed queue is unregistered.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::Stream;
use tokio::sync::mpsc::{self, error::TrySendError};

pub type SubscriberId = String;

struct Slot<E> {
    tx: mpsc::Sender<E>,
    generation: u64,
    dropped: AtomicU64,
    overrun: AtomicBool,
}

type Registry<E> = DashMap<SubscriberId, Slot<E>>;

/// Publishes events to any number of independent subscribers.
pub struct Broadcaster<E> {
    name: &'static str,
    subscribers: Arc<Registry<E>>,
    queue_size: usize,
    generation: AtomicU64,
    dropped: AtomicU64,
}

impl<E> std::fmt::Debug for Broadcaster<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("name", &self.name)
            .field("subscribers", &self.subscribers.len())
            .field("queue_size", &self.queue_size)
            .finish_non_exhaustive()
    }
}

impl<E: Clone + Send + 'static> Broadcaster<E> {
    pub fn new(name: &'static str, queue_size: usize) -> Self {
        Self {
            name,
            subscribers: Arc::new(DashMap::new()),
            queue_size: queue_size.max(1),
            generation: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a subscriber under a fresh id.
    pub fn subscribe(&self) -> Subscription<E> {
        self.subscribe_with_id(uuid::Uuid::new_v4().to_string())
    }

    /// Register a subscriber under `id`, replacing any existing one.
    ///
    /// A replaced subscriber's stream ends once its queue is drained.
    pub fn subscribe_with_id(&self, id: impl Into<SubscriberId>) -> Subscription<E> {
        let id = id.into();
        let (tx, rx) = mpsc::channel(self.queue_size);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let slot = Slot {
            tx,
            generation,
            dropped: AtomicU64::new(0),
            overrun: AtomicBool::new(false),
        };
        if self.subscribers.insert(id.clone(), slot).is_some() {
            tracing::debug!(broadcaster = self.name, subscriber = %id, "Replaced subscriber");
        } else {
            tracing::debug!(broadcaster = self.name, subscriber = %id, "Subscriber added");
        }

        Subscription {
            id,
            generation,
            rx,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    /// Remove a subscriber. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let removed = self.subscribers.remove(id).is_some();
        if removed {
            tracing::debug!(broadcaster = self.name, subscriber = %id, "Subscriber removed");
        }
        removed
    }

    /// Deliver `event` to every current subscriber.
    ///
    /// Returns the number of subscribers the event was queued for.
    pub fn publish(&self, event: &E) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        for slot in self.subscribers.iter() {
            match slot.tx.try_send(event.clone()) {
                Ok(()) => {
                    slot.overrun.store(false, Ordering::Relaxed);
                    delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    let dropped = slot.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    if !slot.overrun.swap(true, Ordering::Relaxed) {
                        tracing::warn!(
                            broadcaster = self.name,
                            subscriber = %slot.key(),
                            dropped,
                            "Subscriber queue full, dropping events"
                        );
                    }
                }
                Err(TrySendError::Closed(_)) => closed.push(slot.key().clone()),
            }
        }

        for id in closed {
            self.subscribers
                .remove_if(&id, |_, slot| slot.tx.is_closed());
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Events dropped across all subscribers because their queue was full.
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Events dropped for one subscriber, if it is registered.
    pub fn dropped_for(&self, id: &str) -> Option<u64> {
        self.subscribers
            .get(id)
            .map(|slot| slot.dropped.load(Ordering::Relaxed))
    }
}

/// Receiving end of a subscription; unregisters itself when dropped.
pub struct Subscription<E> {
    id: SubscriberId,
    generation: u64,
    rx: mpsc::Receiver<E>,
    registry: Weak<Registry<E>>,
}

impl<E> Subscription<E> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the next event; `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

impl<E> Stream for Subscription<E> {
    type Item = E;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<E>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let generation = self.generation;
            registry.remove_if(&self.id, |_, slot| slot.generation == generation);
        }
    }
}

impl<E> std::fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn subscriber_sees_only_events_after_subscribing() {
        let broadcaster = Broadcaster::new("test", 8);
        broadcaster.publish(&0u32);

        let mut sub = broadcaster.subscribe();
        broadcaster.publish(&1);
        broadcaster.publish(&2);

        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(sub.next().await, Some(2));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn every_subscriber_gets_every_event() {
        let broadcaster = Broadcaster::new("test", 8);
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();

        assert_eq!(broadcaster.publish(&"x"), 2);
        assert_eq!(a.recv().await, Some("x"));
        assert_eq!(b.recv().await, Some("x"));
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_affect_fast_one() {
        let broadcaster = Broadcaster::new("test", 2);
        let mut slow = broadcaster.subscribe_with_id("slow");
        let mut fast = broadcaster.subscribe_with_id("fast");

        for i in 0..5u32 {
            broadcaster.publish(&i);
            assert_eq!(fast.recv().await, Some(i));
        }

        // Drop-newest: the slow queue keeps the first two events.
        assert_eq!(slow.try_recv(), Some(0));
        assert_eq!(slow.try_recv(), Some(1));
        assert_eq!(slow.try_recv(), None);
        assert_eq!(broadcaster.dropped_for("slow"), Some(3));
        assert_eq!(broadcaster.dropped_for("fast"), Some(0));
        assert_eq!(broadcaster.dropped_total(), 3);
    }

    #[test]
    fn dropping_subscription_unregisters_it() {
        let broadcaster = Broadcaster::<u32>::new("test", 4);
        let sub = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);

        drop(sub);
        assert_eq!(broadcaster.subscriber_count(), 0);
        assert_eq!(broadcaster.publish(&1), 0);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let broadcaster = Broadcaster::<u32>::new("test", 4);
        let mut sub = broadcaster.subscribe_with_id("a");

        assert!(broadcaster.unsubscribe("a"));
        assert!(!broadcaster.unsubscribe("a"));
        assert!(!broadcaster.unsubscribe("never-registered"));
        assert_eq!(broadcaster.publish(&1), 0);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn replaced_subscription_ends_and_keeps_new_one() {
        let broadcaster = Broadcaster::new("test", 4);
        let mut old = broadcaster.subscribe_with_id("tab");
        let mut new = broadcaster.subscribe_with_id("tab");
        assert_eq!(broadcaster.subscriber_count(), 1);

        assert_eq!(old.recv().await, None);
        drop(old);
        assert_eq!(broadcaster.subscriber_count(), 1);

        broadcaster.publish(&7u32);
        assert_eq!(new.recv().await, Some(7));
    }

    #[test]
    fn closed_receivers_are_pruned_on_publish() {
        let broadcaster = Broadcaster::<u32>::new("test", 4);
        let mut sub = broadcaster.subscribe_with_id("gone");
        sub.rx.close();

        assert_eq!(broadcaster.publish(&1), 0);
        assert_eq!(broadcaster.subscriber_count(), 0);
        drop(sub);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }
}
