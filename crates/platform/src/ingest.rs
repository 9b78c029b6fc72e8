//! Bounded per-service ingest buffers between subscriptions and the
//! detector.
//!
//! Writers never block: a full buffer evicts its oldest event and counts
//! the drop. Per-service FIFO order is preserved; no ordering is promised
//! across services.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::trace;

use crate::types::LogEvent;

/// Default per-service buffer capacity.
pub const DEFAULT_CAPACITY: usize = 1_000;

/// Shared ingest queue, one buffer per `service_id`.
pub struct IngestQueue {
    buffers: DashMap<String, Arc<Mutex<VecDeque<LogEvent>>>>,
    capacity: usize,
    notify: Notify,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl IngestQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            buffers: DashMap::new(),
            capacity: capacity.max(1),
            notify: Notify::new(),
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Push an event; evicts the oldest event of the same service when the
    /// buffer is full. Never blocks.
    pub fn push(&self, event: LogEvent) {
        let buffer = self
            .buffers
            .entry(event.service_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::with_capacity(16))))
            .clone();

        {
            let mut queue = buffer.lock().unwrap_or_else(|e| e.into_inner());
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(service_id = %event.service_id, "Ingest buffer full, dropped oldest");
            }
            queue.push_back(event);
        }

        self.pushed.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    /// Receive the next event from any service buffer, waiting when all
    /// buffers are empty.
    pub async fn recv(&self) -> LogEvent {
        loop {
            // Arm the waiter before scanning so a push between scan and
            // await cannot be missed.
            let notified = self.notify.notified();

            if let Some(event) = self.try_pop() {
                return event;
            }

            notified.await;
        }
    }

    /// Pop one event without waiting.
    pub fn try_pop(&self) -> Option<LogEvent> {
        for entry in &self.buffers {
            let mut queue = entry.value().lock().unwrap_or_else(|e| e.into_inner());
            if let Some(event) = queue.pop_front() {
                return Some(event);
            }
        }
        None
    }

    /// Total events accepted.
    #[must_use]
    pub fn pushed_count(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Total events evicted due to backpressure.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Events currently buffered across all services.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.buffers
            .iter()
            .map(|entry| {
                entry
                    .value()
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .len()
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogLevel;
    use chrono::Utc;
    use std::collections::HashMap;

    fn event(service_id: &str, message: &str) -> LogEvent {
        LogEvent {
            service_id: service_id.to_string(),
            environment_id: None,
            service_name: None,
            timestamp: Utc::now(),
            level: LogLevel::Error,
            message: message.to_string(),
            severity_score: LogLevel::Error.score(),
            raw_metadata: HashMap::new(),
            source: None,
        }
    }

    #[tokio::test]
    async fn per_service_fifo_order() {
        let queue = IngestQueue::new(10);
        queue.push(event("svc-1", "first"));
        queue.push(event("svc-1", "second"));

        assert_eq!(queue.recv().await.message, "first");
        assert_eq!(queue.recv().await.message, "second");
    }

    #[tokio::test]
    async fn full_buffer_drops_oldest() {
        let queue = IngestQueue::new(2);
        queue.push(event("svc-1", "a"));
        queue.push(event("svc-1", "b"));
        queue.push(event("svc-1", "c"));

        assert_eq!(queue.dropped_count(), 1);
        assert_eq!(queue.recv().await.message, "b");
        assert_eq!(queue.recv().await.message, "c");
    }

    #[tokio::test]
    async fn recv_wakes_on_push() {
        let queue = IngestQueue::new(10);
        let reader = Arc::clone(&queue);

        let handle = tokio::spawn(async move { reader.recv().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.push(event("svc-1", "late"));

        let received = handle.await.unwrap();
        assert_eq!(received.message, "late");
    }

    #[tokio::test]
    async fn buffers_are_independent_per_service() {
        let queue = IngestQueue::new(1);
        queue.push(event("svc-1", "a"));
        queue.push(event("svc-2", "b"));
        assert_eq!(queue.dropped_count(), 0);
        assert_eq!(queue.depth(), 2);
    }
}
