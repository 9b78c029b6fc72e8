//! In-process topic pub/sub.
//!
//! The broker fans published messages out to every subscriber of a topic.
//! Delivery is at-most-once from the publishing instant: each subscriber
//! owns a bounded queue, and a subscriber that falls behind loses messages
//! (counted) rather than blocking the publisher or its peers.

pub mod topics;

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Queue depth per subscriber.
const SUBSCRIBER_QUEUE: usize = 256;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Value>,
}

/// Topic-based publish/subscribe hub.
///
/// Cheap to share: wrap in an `Arc` and hand a clone of that to every
/// component.
#[derive(Default)]
pub struct Broker {
    topics: DashMap<String, Vec<Subscriber>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl Broker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic. The returned receiver yields every message
    /// published after this call, subject to the bounded queue.
    pub fn subscribe(&self, topic: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        debug!(topic = %topic, subscriber = id, "Subscribed");
        rx
    }

    /// Publish a message to a topic. Returns the number of subscribers the
    /// message was enqueued for.
    ///
    /// Never blocks: a full subscriber queue drops the message for that
    /// subscriber only; closed receivers are pruned.
    pub fn publish(&self, topic: &str, message: Value) -> usize {
        let Some(mut subscribers) = self.topics.get_mut(topic) else {
            trace!(topic = %topic, "Publish with no subscribers");
            return 0;
        };

        let mut delivered = 0;
        subscribers.retain(|sub| match sub.tx.try_send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(topic = %topic, subscriber = sub.id, "Subscriber queue full, message dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(topic = %topic, subscriber = sub.id, "Pruning closed subscriber");
                false
            }
        });

        delivered
    }

    /// Total messages dropped across all subscribers since startup.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of live subscribers on a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |subs| subs.len())
    }
}
