//! Deduplicating, rate-limited work queue.
//!
//! Holds at most one pending entry per key. A key re-added while a worker
//! is processing it is marked dirty and handed out again exactly once
//! after `done`, so a key is never reconciled by two workers at once.

use crate::backoff::ItemRateLimiter;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// What kind of event produced a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Object appeared
    Add,
    /// Object changed, resynced or was requeued
    Update,
    /// Object disappeared
    Delete,
}

impl EventKind {
    /// Lowercase name used in logs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// An item handed to a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem<T> {
    /// Identity key
    pub key: T,
    /// Most recent event kind seen for the key
    pub hint: EventKind,
}

#[derive(Debug)]
struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    hints: HashMap<T, EventKind>,
    shutting_down: bool,
}

/// Work queue keyed by `T`
pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    available: Notify,
    limiter: ItemRateLimiter<T>,
    shutdown: CancellationToken,
}

impl<T> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue").finish_non_exhaustive()
    }
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Creates a queue whose rate-limited requeues back off from `base` up to `max`
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                hints: HashMap::new(),
                shutting_down: false,
            }),
            available: Notify::new(),
            limiter: ItemRateLimiter::new(base, max),
            shutdown: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues `key`, or records the newer hint if it is already pending
    pub fn add(&self, key: T, hint: EventKind) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        state.hints.insert(key.clone(), hint);
        if !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.available.notify_one();
    }

    /// Blocks until an item is available; `None` once shut down and empty
    pub async fn get(&self) -> Option<WorkItem<T>> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let hint = state.hints.remove(&key).unwrap_or(EventKind::Update);
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.available.notify_one();
                    }
                    return Some(WorkItem { key, hint });
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks `key` as processed, requeueing it if it was re-added meanwhile
    pub fn done(&self, key: &T) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.available.notify_one();
        }
    }

    /// Re-adds `key` after its per-key exponential backoff delay
    pub fn add_rate_limited(self: &Arc<Self>, key: T) {
        let delay = self.limiter.when(&key);
        self.add_after(key, delay);
    }

    /// Re-adds `key` after `delay`; dropped if the queue shuts down first
    pub fn add_after(self: &Arc<Self>, key: T, delay: Duration) {
        if delay.is_zero() {
            self.add(key, EventKind::Update);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = queue.shutdown.cancelled() => {}
                () = tokio::time::sleep(delay) => queue.add(key, EventKind::Update),
            }
        });
    }

    /// Re-adds `key` after the longest backoff delay, leaving its history untouched
    pub fn add_at_max_backoff(self: &Arc<Self>, key: T) {
        let delay = self.limiter.max_delay();
        self.add_after(key, delay);
    }

    /// Clears the backoff history of `key`
    pub fn forget(&self, key: &T) {
        self.limiter.forget(key);
    }

    /// Consecutive rate-limited requeues of `key`
    pub fn num_requeues(&self, key: &T) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// Pending items, excluding those being processed
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no items are pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting new items; pending items are still handed out
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.shutdown.cancel();
        self.available.notify_waiters();
    }

    /// Stops accepting new items and discards pending ones
    ///
    /// In-flight items are unaffected; `get` returns `None` immediately.
    pub fn shut_down_now(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            state.queue.clear();
            state.dirty.clear();
            state.hints.clear();
        }
        self.shutdown.cancel();
        self.available.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<WorkQueue<&'static str>> {
        Arc::new(WorkQueue::new(Duration::from_millis(5), Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn test_add_coalesces_pending_duplicates() {
        let q = queue();
        q.add("a", EventKind::Add);
        q.add("a", EventKind::Update);
        q.add("b", EventKind::Add);
        assert_eq!(q.len(), 2);

        let first = q.get().await.unwrap();
        assert_eq!(first, WorkItem { key: "a", hint: EventKind::Update });
    }

    #[tokio::test]
    async fn test_readd_while_processing_redelivers_once() {
        let q = queue();
        q.add("a", EventKind::Add);
        let item = q.get().await.unwrap();

        for _ in 0..5 {
            q.add("a", EventKind::Update);
        }
        assert_eq!(q.len(), 0, "in-flight key must not be queued twice");

        q.done(&item.key);
        assert_eq!(q.len(), 1);
        let again = q.get().await.unwrap();
        assert_eq!(again.key, "a");
        q.done(&again.key);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_get_blocks_until_add() {
        let q = queue();
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.add("late", EventKind::Add);
        let item = waiter.await.unwrap().unwrap();
        assert_eq!(item.key, "late");
    }

    #[tokio::test]
    async fn test_shut_down_drains_then_stops() {
        let q = queue();
        q.add("a", EventKind::Add);
        q.shut_down();
        q.add("b", EventKind::Add);

        assert_eq!(q.get().await.unwrap().key, "a");
        assert!(q.get().await.is_none());
    }

    #[tokio::test]
    async fn test_shut_down_wakes_blocked_consumers() {
        let q = queue();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let q = Arc::clone(&q);
                tokio::spawn(async move { q.get().await })
            })
            .collect();
        tokio::task::yield_now().await;
        q.shut_down();
        for waiter in waiters {
            assert!(waiter.await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_shut_down_now_discards_pending() {
        let q = queue();
        q.add("a", EventKind::Add);
        q.add("b", EventKind::Add);
        q.shut_down_now();
        assert!(q.get().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_delivers_later() {
        let q = queue();
        q.add_after("a", Duration::from_secs(30));
        tokio::task::yield_now().await;
        assert!(q.is_empty());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(q.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_backoff_grows_until_forget() {
        let q = queue();
        q.add_rate_limited("a");
        q.add_rate_limited("a");
        assert_eq!(q.num_requeues(&"a"), 2);
        q.forget(&"a");
        assert_eq!(q.num_requeues(&"a"), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(q.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_add_dropped_after_shutdown() {
        let q = queue();
        q.add_after("a", Duration::from_secs(1));
        q.shut_down();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(q.is_empty());
    }
}
