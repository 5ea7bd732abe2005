//! Event Publisher — fans incoming events out to heterogeneous subscribers.
//!
//! Each subscriber gets its own bounded, evict-oldest queue (same
//! [`EvictingQueue`] primitive the Stream Worker uses for frames) and its
//! own delivery task, so a slow consumer only ever loses its own events and
//! never stalls the Correlation Engine or other subscribers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::EventEnvelope;
use crate::util::EvictingQueue;

const DEFAULT_QUEUE_DEPTH: usize = 1024;
const DISCONNECT_GRACE: Duration = Duration::from_secs(30);

struct Subscriber {
    queue: Arc<EvictingQueue<EventEnvelope>>,
}

/// Fan-out hub. Cheap to clone; all clones share the same subscriber table.
#[derive(Clone)]
pub struct Publisher {
    subscribers: Arc<Mutex<HashMap<Uuid, Subscriber>>>,
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// `Subscribe(kind, sink) -> subscription_id`. `sink` receives queued
    /// events through the returned `mpsc::Receiver`; delivery is driven by
    /// a dedicated task that pops from the subscriber's evicting queue and
    /// forwards to `sink`, so `Publish` itself never touches the channel.
    pub fn subscribe(&self) -> (Uuid, mpsc::Receiver<EventEnvelope>) {
        let id = Uuid::new_v4();
        let queue = Arc::new(EvictingQueue::new(DEFAULT_QUEUE_DEPTH));
        self.subscribers.lock().insert(
            id,
            Subscriber {
                queue: queue.clone(),
            },
        );

        let (sink_tx, sink_rx) = mpsc::channel(DEFAULT_QUEUE_DEPTH);
        let subscribers = self.subscribers.clone();
        tokio::spawn(async move {
            loop {
                match queue.pop().await {
                    Some(event) => {
                        if sink_tx.send(event).await.is_err() {
                            // Receiver gone; keep draining into the grace period
                            // instead of dropping the subscriber immediately, in
                            // case the caller reconnects to the same id.
                            tokio::time::sleep(DISCONNECT_GRACE).await;
                            subscribers.lock().remove(&id);
                            queue.close();
                            return;
                        }
                    }
                    None => return,
                }
            }
        });

        info!(subscription_id = %id, "Subscriber connected");
        (id, sink_rx)
    }

    pub fn unsubscribe(&self, id: Uuid) {
        if let Some(sub) = self.subscribers.lock().remove(&id) {
            sub.queue.close();
            info!(subscription_id = %id, "Subscriber removed");
        }
    }

    /// `Publish(event)`. Non-blocking: pushes into each subscriber's
    /// evicting queue and returns. Overflow silently drops the oldest
    /// queued event for that subscriber and increments its drop counter.
    pub fn publish(&self, event: EventEnvelope) {
        let subscribers = self.subscribers.lock();
        for (id, sub) in subscribers.iter() {
            if sub.queue.push(event.clone()) {
                warn!(subscription_id = %id, dropped = sub.queue.dropped_count(), "Subscriber queue overflow");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let publisher = Publisher::new();
        let (_id, mut rx) = publisher.subscribe();

        publisher.publish(EventEnvelope::WorkerStatus {
            timestamp: Utc::now(),
            camera_id: "cam0".into(),
            state: "running".into(),
            stats: Default::default(),
        });

        let received = rx.recv().await;
        assert!(received.is_some());
    }

    #[tokio::test]
    async fn unsubscribe_closes_the_queue() {
        let publisher = Publisher::new();
        let (id, mut rx) = publisher.subscribe();
        publisher.unsubscribe(id);
        assert_eq!(publisher.subscriber_count(), 0);
        assert!(rx.recv().await.is_none());
    }
}
