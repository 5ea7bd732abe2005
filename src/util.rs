//! Bounded queue with an evict-oldest-on-overflow drop policy.
//!
//! Generalizes the "non-blocking send, drop on full" idiom used throughout
//! the ingestion pipeline (frame buffers prefer the newest frame; publisher
//! subscriber queues drop the oldest undelivered event) into one reusable
//! primitive. Producers never block; only the queue's own mutex is held,
//! and only briefly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

pub struct EvictingQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl<T> EvictingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Push a new item, evicting the oldest queued item if at capacity.
    /// Returns `true` if an eviction occurred.
    pub fn push(&self, item: T) -> bool {
        let evicted = {
            let mut guard = self.inner.lock();
            let evicted = if guard.len() >= self.capacity {
                guard.pop_front();
                true
            } else {
                false
            };
            guard.push_back(item);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    /// Pop the oldest item, waiting until one is available or the queue is
    /// closed. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut guard = self.inner.lock();
                if let Some(item) = guard.pop_front() {
                    return Some(item);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Drain all queued items without waiting.
    pub fn drain(&self) -> Vec<T> {
        self.inner.lock().drain(..).collect()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Exponential backoff with jitter, capped, matching the Stream Worker's
/// reconnect policy (base 2s, +/-25% jitter, cap 30s).
pub fn jittered_backoff(attempt: u32, base: std::time::Duration, cap: std::time::Duration) -> std::time::Duration {
    let exp = 2u64.saturating_pow(attempt.min(16));
    let scaled = base.saturating_mul(exp as u32).min(cap);
    let jitter_frac = pseudo_jitter(attempt);
    let millis = scaled.as_millis() as f64 * (1.0 + jitter_frac);
    std::time::Duration::from_millis(millis.max(0.0) as u64).min(cap)
}

/// Deterministic pseudo-random jitter in `[-0.25, 0.25]`, seeded by the
/// attempt counter. Deterministic so reconnect timing stays testable
/// without pulling in a `rand` dependency for one call site.
fn pseudo_jitter(attempt: u32) -> f64 {
    let h = attempt.wrapping_mul(2654435761).wrapping_add(0x9E3779B9);
    let unit = (h % 10000) as f64 / 10000.0; // [0, 1)
    (unit - 0.5) * 0.5 // [-0.25, 0.25)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_when_full() {
        let q: EvictingQueue<i32> = EvictingQueue::new(2);
        assert!(!q.push(1));
        assert!(!q.push(2));
        assert!(q.push(3));
        assert_eq!(q.drain(), vec![2, 3]);
    }

    #[tokio::test]
    async fn pop_returns_none_after_close_when_empty() {
        let q: EvictingQueue<i32> = EvictingQueue::new(4);
        q.close();
        assert_eq!(q.pop().await, None);
    }

    #[test]
    fn backoff_is_capped_and_grows() {
        let base = std::time::Duration::from_secs(2);
        let cap = std::time::Duration::from_secs(30);
        let small = jittered_backoff(1, base, cap);
        let large = jittered_backoff(10, base, cap);
        assert!(small <= cap);
        assert!(large <= cap);
    }
}
