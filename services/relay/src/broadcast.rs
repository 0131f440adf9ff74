//! Buffered broadcast channel
//!
//! Turns single-shot debug events into a live multi-subscriber stream.
//! A bounded backlog of recent events is replayed to every subscriber on
//! attach, then live events follow in publish order.
//!
//! Publish and subscribe-replay run under one mutex and never suspend while
//! holding it, so a subscriber sees the backlog followed by every later
//! publish with no gap and no duplicate.
//!
//! Each subscriber owns a bounded queue. Live delivery uses `try_send`: a
//! subscriber whose queue is full (or whose receiver is gone) is
//! unregistered on the spot, leaving the publisher and every other
//! subscriber untouched.

use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use chrono::Utc;
use futures::Stream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use types::event::DebugEvent;
use types::ids::SubscriberId;

/// Configuration for the broadcast channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastConfig {
    /// Maximum number of events retained for replay.
    pub backlog_capacity: usize,
    /// Live events a subscriber may have pending before it is dropped.
    pub subscriber_queue: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            backlog_capacity: 100,
            subscriber_queue: 256,
        }
    }
}

/// Lifetime counters of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Events published.
    pub published: u64,
    /// Events evicted from the backlog.
    pub evicted: u64,
    /// Subscribers unregistered because delivery failed.
    pub dropped_subscribers: u64,
}

struct Inner {
    backlog: VecDeque<DebugEvent>,
    subscribers: BTreeMap<SubscriberId, mpsc::Sender<DebugEvent>>,
    next_sequence: u64,
    next_subscriber: u64,
    stats: BroadcastStats,
}

/// Process-wide fan-out of debug events.
///
/// Cheap to clone; clones share the same backlog and subscriber set.
#[derive(Clone)]
pub struct BroadcastChannel {
    inner: Arc<Mutex<Inner>>,
    config: BroadcastConfig,
}

impl BroadcastChannel {
    pub fn new(config: BroadcastConfig) -> Self {
        let config = BroadcastConfig {
            backlog_capacity: config.backlog_capacity.max(1),
            subscriber_queue: config.subscriber_queue.max(1),
        };
        info!(
            backlog_capacity = config.backlog_capacity,
            subscriber_queue = config.subscriber_queue,
            "BroadcastChannel initialized"
        );

        Self {
            inner: Arc::new(Mutex::new(Inner {
                backlog: VecDeque::with_capacity(config.backlog_capacity),
                subscribers: BTreeMap::new(),
                next_sequence: 1,
                next_subscriber: 1,
                stats: BroadcastStats::default(),
            })),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(BroadcastConfig::default())
    }

    pub fn config(&self) -> BroadcastConfig {
        self.config
    }

    /// Append an event to the backlog and deliver it to every subscriber.
    ///
    /// Returns the event as published, with its sequence number assigned.
    pub fn publish(&self, event: DebugEvent) -> DebugEvent {
        let mut inner = lock(&self.inner);

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        let event = event.sequenced(sequence, Utc::now());

        if inner.backlog.len() >= self.config.backlog_capacity {
            inner.backlog.pop_front();
            inner.stats.evicted += 1;
        }
        inner.backlog.push_back(event.clone());
        inner.stats.published += 1;

        let mut failed = Vec::new();
        for (id, sender) in &inner.subscribers {
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = %id, sequence, "Subscriber lagging, dropping it");
                    failed.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscriber = %id, sequence, "Subscriber gone");
                    failed.push(*id);
                }
            }
        }
        for id in failed {
            inner.subscribers.remove(&id);
            inner.stats.dropped_subscribers += 1;
        }

        debug!(
            sequence,
            topic = %event.topic,
            subscribers = inner.subscribers.len(),
            "Published event"
        );
        event
    }

    /// Register a subscriber, replaying the current backlog into it first.
    pub fn subscribe(&self) -> Subscription {
        let mut inner = lock(&self.inner);

        let (sender, receiver) =
            mpsc::channel(self.config.backlog_capacity + self.config.subscriber_queue);
        for event in &inner.backlog {
            // Capacity covers a full backlog, so replay cannot fail.
            let replayed = sender.try_send(event.clone()).is_ok();
            debug_assert!(replayed);
        }

        let id = SubscriberId::new(inner.next_subscriber);
        inner.next_subscriber += 1;
        inner.subscribers.insert(id, sender);

        debug!(
            subscriber = %id,
            replayed = inner.backlog.len(),
            "Registered subscriber"
        );

        Subscription {
            id,
            receiver,
            channel: Arc::downgrade(&self.inner),
        }
    }

    /// Unregister a subscriber. Unknown or already removed ids are ignored.
    ///
    /// Returns whether a subscriber was removed.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        remove_subscriber(&self.inner, id)
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }

    pub fn backlog_len(&self) -> usize {
        lock(&self.inner).backlog.len()
    }

    /// Copy of the backlog, oldest first.
    pub fn backlog(&self) -> Vec<DebugEvent> {
        lock(&self.inner).backlog.iter().cloned().collect()
    }

    pub fn stats(&self) -> BroadcastStats {
        lock(&self.inner).stats
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

fn remove_subscriber(inner: &Mutex<Inner>, id: SubscriberId) -> bool {
    let removed = lock(inner).subscribers.remove(&id).is_some();
    if removed {
        debug!(subscriber = %id, "Unregistered subscriber");
    }
    removed
}

/// One live consumer of a [`BroadcastChannel`].
///
/// Yields the replayed backlog, then live events. Dropping it unregisters
/// the subscriber.
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<DebugEvent>,
    channel: Weak<Mutex<Inner>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event; `None` once the subscriber has been unregistered and its
    /// queue drained.
    pub async fn recv(&mut self) -> Option<DebugEvent> {
        self.receiver.recv().await
    }

    /// Next already-queued event, without waiting.
    pub fn try_recv(&mut self) -> Option<DebugEvent> {
        self.receiver.try_recv().ok()
    }

    /// Unregister from the channel. Safe to call repeatedly.
    pub fn unsubscribe(&mut self) {
        if let Some(inner) = self.channel.upgrade() {
            remove_subscriber(&inner, self.id);
        }
    }
}

impl Stream for Subscription {
    type Item = DebugEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
