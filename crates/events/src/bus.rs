//! Subscription fan-out (mechanics only).
//!
//! Messages are hints pushed over in-process channels. Delivery is
//! best-effort: a subscriber whose receiver was dropped is removed on the next
//! publish, and nothing is persisted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;

/// Identifier of a subscription within one [`Fanout`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Receiving end of a subscription.
///
/// Designed for single-threaded consumption; hand messages to other threads
/// yourself if needed.
#[derive(Debug)]
pub struct Subscription<M> {
    id: SubscriptionId,
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain every message already queued.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("subscriber list lock poisoned")]
    Poisoned,
}

#[derive(Debug)]
struct Subscriber<M, K> {
    id: SubscriptionId,
    key: K,
    sender: Sender<M>,
}

/// Keyed pub/sub fan-out.
///
/// Each subscriber registers with a key (e.g. the consumer group it belongs
/// to); publishers decide per key which message, if any, to deliver.
#[derive(Debug)]
pub struct Fanout<M, K = ()> {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber<M, K>>>,
}

impl<M, K> Default for Fanout<M, K> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<M, K> Fanout<M, K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, key: K) -> Result<Subscription<M>, FanoutError> {
        let (sender, receiver) = mpsc::channel();
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        self.subscribers
            .lock()
            .map_err(|_| FanoutError::Poisoned)?
            .push(Subscriber { id, key, sender });

        Ok(Subscription { id, receiver })
    }

    /// Remove a subscription; returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, FanoutError> {
        let mut subs = self.subscribers.lock().map_err(|_| FanoutError::Poisoned)?;
        let before = subs.len();
        subs.retain(|s| s.id != id);
        Ok(subs.len() != before)
    }

    pub fn subscriber_count(&self) -> Result<usize, FanoutError> {
        Ok(self.subscribers.lock().map_err(|_| FanoutError::Poisoned)?.len())
    }

    /// Deliver `message_for(key)` to every subscriber it returns `Some` for.
    ///
    /// Returns the number of deliveries. Dead subscribers are dropped.
    pub fn publish_with<F>(&self, mut message_for: F) -> Result<usize, FanoutError>
    where
        F: FnMut(&K) -> Option<M>,
    {
        let mut subs = self.subscribers.lock().map_err(|_| FanoutError::Poisoned)?;
        let mut delivered = 0;

        subs.retain(|s| match message_for(&s.key) {
            Some(message) => {
                let alive = s.sender.send(message).is_ok();
                delivered += usize::from(alive);
                alive
            }
            None => true,
        });

        Ok(delivered)
    }

    /// Deliver `message` to every subscriber.
    pub fn publish(&self, message: M) -> Result<usize, FanoutError>
    where
        M: Clone,
    {
        self.publish_with(|_| Some(message.clone()))
    }
}

impl<M, K: Clone> Fanout<M, K> {
    /// Keys of the live subscriptions, with duplicates.
    pub fn keys(&self) -> Result<Vec<K>, FanoutError> {
        Ok(self
            .subscribers
            .lock()
            .map_err(|_| FanoutError::Poisoned)?
            .iter()
            .map(|s| s.key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_reaches_every_subscriber() {
        let fanout: Fanout<u32> = Fanout::new();
        let a = fanout.subscribe(()).unwrap();
        let b = fanout.subscribe(()).unwrap();

        assert_eq!(fanout.publish(7).unwrap(), 2);
        assert_eq!(a.try_recv().unwrap(), 7);
        assert_eq!(b.try_recv().unwrap(), 7);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn keyed_publish_filters_by_key() {
        let fanout: Fanout<&'static str, &'static str> = Fanout::new();
        let blue = fanout.subscribe("blue").unwrap();
        let green = fanout.subscribe("green").unwrap();

        fanout
            .publish_with(|key| (*key == "blue").then_some("for blue"))
            .unwrap();

        assert_eq!(blue.drain(), vec!["for blue"]);
        assert!(green.drain().is_empty());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let fanout: Fanout<u32> = Fanout::new();
        let kept = fanout.subscribe(()).unwrap();
        drop(fanout.subscribe(()).unwrap());

        assert_eq!(fanout.publish(1).unwrap(), 1);
        assert_eq!(fanout.subscriber_count().unwrap(), 1);
        assert_eq!(kept.recv().unwrap(), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let fanout: Fanout<u32> = Fanout::new();
        let sub = fanout.subscribe(()).unwrap();

        assert!(fanout.unsubscribe(sub.id()).unwrap());
        assert!(!fanout.unsubscribe(sub.id()).unwrap());
        assert_eq!(fanout.publish(1).unwrap(), 0);
        assert!(sub.try_recv().is_err());
    }

    #[test]
    fn panicking_publisher_surfaces_as_poisoned() {
        let fanout: Fanout<u32> = Fanout::new();
        let _sub = fanout.subscribe(()).unwrap();

        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = fanout.publish_with(|_| -> Option<u32> { panic!("publisher failed") });
        }));
        assert!(panicked.is_err());

        assert!(matches!(fanout.publish(1), Err(FanoutError::Poisoned)));
        assert!(matches!(fanout.subscribe(()), Err(FanoutError::Poisoned)));
    }
}
