//! Coalescing work queue with single-flight keys.
//!
//! A key is pending at most once. A key handed to a worker stays in flight
//! until [`WorkQueue::done`]; adds in the meantime are parked and released
//! when the worker finishes, so no two workers ever hold the same key.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tracing::{debug, trace};

struct State<K> {
    order: VecDeque<K>,
    pending: FxHashSet<K>,
    in_flight: FxHashSet<K>,
    dirty: FxHashSet<K>,
    cap: usize,
    dropped: u64,
    closed: bool,
}

impl<K: Clone + Eq + Hash> State<K> {
    fn enqueue(&mut self, key: K) -> bool {
        if self.pending.contains(&key) {
            return false;
        }
        if self.order.len() >= self.cap {
            if let Some(old) = self.order.pop_front() {
                self.pending.remove(&old);
                self.dropped += 1;
            }
        }
        self.pending.insert(key.clone());
        self.order.push_back(key);
        true
    }
}

pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
}

impl<K: Clone + Eq + Hash + std::fmt::Debug> WorkQueue<K> {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            state: Mutex::new(State {
                order: VecDeque::new(),
                pending: FxHashSet::default(),
                in_flight: FxHashSet::default(),
                dirty: FxHashSet::default(),
                cap: cap.max(1),
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add(&self, key: K) {
        let mut s = self.lock();
        if s.closed {
            return;
        }
        if s.in_flight.contains(&key) {
            trace!(?key, "key in flight; deferred");
            s.dirty.insert(key);
            return;
        }
        if s.enqueue(key) {
            drop(s);
            self.notify.notify_one();
        }
    }

    /// Next key to work on, or `None` once the queue is shut down.
    pub async fn next(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut s = self.lock();
                if s.closed {
                    return None;
                }
                if let Some(key) = s.order.pop_front() {
                    s.pending.remove(&key);
                    s.in_flight.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release `key`; a deferred add re-queues it.
    pub fn done(&self, key: &K) {
        let mut s = self.lock();
        s.in_flight.remove(key);
        if s.dirty.remove(key) && !s.closed && s.enqueue(key.clone()) {
            drop(s);
            self.notify.notify_one();
        }
    }

    pub fn shutdown(&self) {
        let mut s = self.lock();
        s.closed = true;
        debug!(pending = s.order.len(), in_flight = s.in_flight.len(), "work queue shut down");
        drop(s);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize { self.lock().order.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn dropped(&self) -> u64 { self.lock().dropped }
    pub fn in_flight(&self) -> usize { self.lock().in_flight.len() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn coalesces_pending_keys() {
        let q = WorkQueue::with_capacity(8);
        q.add("a");
        q.add("b");
        q.add("a");
        assert_eq!(q.len(), 2);
        assert_eq!(q.next().await, Some("a"));
        assert_eq!(q.next().await, Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn in_flight_keys_are_never_handed_out_twice() {
        let q = WorkQueue::with_capacity(8);
        q.add("a");
        assert_eq!(q.next().await, Some("a"));
        q.add("a");
        q.add("a");
        assert!(q.is_empty(), "re-add while in flight must wait");
        q.add("b");
        assert_eq!(q.next().await, Some("b"));
        q.done(&"a");
        assert_eq!(q.len(), 1);
        assert_eq!(q.next().await, Some("a"));
        q.done(&"a");
        q.done(&"b");
        assert!(q.is_empty());
        assert_eq!(q.in_flight(), 0);
    }

    #[tokio::test]
    async fn drops_oldest_beyond_capacity() {
        let q = WorkQueue::with_capacity(2);
        q.add(1);
        q.add(2);
        q.add(3);
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.next().await, Some(2));
    }

    #[tokio::test]
    async fn waiting_worker_wakes_on_add_and_shutdown() {
        let q = Arc::new(WorkQueue::with_capacity(4));
        let w = tokio::spawn({
            let q = q.clone();
            async move { (q.next().await, q.next().await) }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.add("x");
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.shutdown();
        assert_eq!(w.await.unwrap(), (Some("x"), None));
    }
}
