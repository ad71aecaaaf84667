//! Cache of recently handled gossip message ids.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct Inner {
    order: VecDeque<(String, Instant)>,
    ids: HashSet<String>,
}

/// Bounded, expiring set of message ids. The oldest id is evicted when
/// full.
pub struct RecentMessages {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl RecentMessages {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(Inner {
                order: VecDeque::with_capacity(capacity),
                ids: HashSet::with_capacity(capacity),
            }),
        }
    }

    /// Remember `id`. Returns false if it was already known.
    pub async fn insert(&self, id: String) -> bool {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let now = Instant::now();
        while let Some((_, seen_at)) = inner.order.front() {
            if now.saturating_duration_since(*seen_at) < self.ttl {
                break;
            }
            if let Some((old, _)) = inner.order.pop_front() {
                inner.ids.remove(&old);
            }
        }
        if inner.ids.contains(&id) {
            return false;
        }
        if inner.order.len() == self.capacity {
            if let Some((old, _)) = inner.order.pop_front() {
                inner.ids.remove(&old);
            }
        }
        inner.ids.insert(id.clone());
        inner.order.push_back((id, now));
        true
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.order.len()
    }
}
