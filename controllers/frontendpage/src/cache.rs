//! Watch-fed resource cache.
//!
//! A `ResourceCache` holds the last observed version of every object of one
//! kind, keyed by `namespace/name`. It is written only by the task driving
//! [`ResourceCache::run`] and read concurrently by reconcile workers.
//! Entries are `Arc`s that are swapped wholesale on update, so a reader
//! holding an entry never sees a partially applied change.

use crate::backoff::ExponentialBackoff;
use crate::error::ControllerError;
use crate::handlers::EventHandler;
use cluster_client::{ClusterError, ObjectKey, ResourceReader};
use futures::{Stream, StreamExt};
use kube::{Resource, ResourceExt};
use kube_runtime::watcher;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tuning for a [`ResourceCache`]
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Period of full resyncs to registered handlers
    pub resync_period: Duration,
    /// Consecutive watch failures before the cache reports unhealthy
    pub failure_threshold: u32,
    /// First reconnect delay after a watch failure
    pub backoff_base: Duration,
    /// Cap for reconnect delays
    pub backoff_max: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            resync_period: Duration::from_secs(30),
            failure_threshold: 5,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Type-erased view of a cache used for readiness and metrics
pub trait CacheStatus: Send + Sync {
    /// Cache name used in logs and metric labels
    fn name(&self) -> &str;
    /// Whether the initial list has completed
    fn has_synced(&self) -> bool;
    /// Whether the watch is below the failure threshold
    fn is_healthy(&self) -> bool;
    /// Number of cached objects
    fn len(&self) -> usize;
    /// Total watch failures since start
    fn watch_failures(&self) -> u64;
    /// Keys of every cached object
    fn keys(&self) -> Vec<ObjectKey>;
    /// Receiver that flips to `true` once the initial list completed
    fn subscribe_synced(&self) -> watch::Receiver<bool>;
}

/// Waits until `cache` completed its initial list or `cancel` fires
///
/// Returns whether the cache synced.
pub async fn wait_for_sync(cache: &dyn CacheStatus, cancel: &CancellationToken) -> bool {
    let mut synced = cache.subscribe_synced();
    tokio::select! {
        res = synced.wait_for(|s| *s) => res.is_ok(),
        () = cancel.cancelled() => false,
    }
}

type Store<K> = HashMap<ObjectKey, Arc<K>>;

enum Change<K> {
    Added(Arc<K>),
    Updated(Arc<K>, Arc<K>),
    Deleted(Arc<K>),
}

/// Indexed snapshot of one watched resource kind
pub struct ResourceCache<K> {
    name: String,
    options: CacheOptions,
    store: RwLock<Store<K>>,
    init_buffer: Mutex<Option<Store<K>>>,
    handlers: RwLock<Vec<Arc<dyn EventHandler<K>>>>,
    synced: watch::Sender<bool>,
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    total_failures: AtomicU64,
}

impl<K> fmt::Debug for ResourceCache<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCache")
            .field("name", &self.name)
            .field("synced", &*self.synced.borrow())
            .finish_non_exhaustive()
    }
}

impl<K> ResourceCache<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    /// Creates an empty, unsynced cache
    #[must_use]
    pub fn new(name: impl Into<String>, options: CacheOptions) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            name: name.into(),
            options,
            store: RwLock::new(HashMap::new()),
            init_buffer: Mutex::new(None),
            handlers: RwLock::new(Vec::new()),
            synced,
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            total_failures: AtomicU64::new(0),
        }
    }

    /// Registers an observer for add/update/delete/resync notifications
    pub fn add_handler(&self, handler: Arc<dyn EventHandler<K>>) {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner).push(handler);
    }

    /// Cached object for `key`
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.store.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    /// Every cached object
    pub fn list(&self) -> Vec<Arc<K>> {
        self.store.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect()
    }

    /// Keys of every cached object
    pub fn keys(&self) -> Vec<ObjectKey> {
        self.store.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }

    /// Applies one watcher event and notifies handlers of the resulting changes
    pub fn apply(&self, event: watcher::Event<K>) {
        let changes = match event {
            watcher::Event::Init => {
                *self.init_buffer.lock().unwrap_or_else(PoisonError::into_inner) = Some(HashMap::new());
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                let mut buffer = self.init_buffer.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(pending) = buffer.as_mut() {
                    if let Some(key) = ObjectKey::from_resource(&obj) {
                        pending.insert(key, Arc::new(obj));
                    }
                    Vec::new()
                } else {
                    drop(buffer);
                    self.upsert(obj).into_iter().collect()
                }
            }
            watcher::Event::InitDone => self.finish_relist(),
            watcher::Event::Apply(obj) => self.upsert(obj).into_iter().collect(),
            watcher::Event::Delete(obj) => self.remove(&obj).into_iter().collect(),
        };
        self.notify(changes);
    }

    fn upsert(&self, obj: K) -> Option<Change<K>> {
        let Some(key) = ObjectKey::from_resource(&obj) else {
            warn!(cache = %self.name, name = %obj.name_any(), "ignoring object without namespace");
            return None;
        };
        let new = Arc::new(obj);
        let old = self
            .store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&new));
        Some(match old {
            Some(old) => Change::Updated(old, new),
            None => Change::Added(new),
        })
    }

    fn remove(&self, obj: &K) -> Option<Change<K>> {
        let key = ObjectKey::from_resource(obj)?;
        let removed = self.store.write().unwrap_or_else(PoisonError::into_inner).remove(&key);
        Some(Change::Deleted(removed.unwrap_or_else(|| Arc::new(obj.clone()))))
    }

    fn finish_relist(&self) -> Vec<Change<K>> {
        let Some(fresh) = self.init_buffer.lock().unwrap_or_else(PoisonError::into_inner).take()
        else {
            return Vec::new();
        };
        let previous = std::mem::replace(
            &mut *self.store.write().unwrap_or_else(PoisonError::into_inner),
            fresh.clone(),
        );

        let mut changes = Vec::new();
        for (key, new) in &fresh {
            match previous.get(key) {
                None => changes.push(Change::Added(Arc::clone(new))),
                Some(old) if old.resource_version() != new.resource_version() => {
                    changes.push(Change::Updated(Arc::clone(old), Arc::clone(new)));
                }
                Some(_) => {}
            }
        }
        for (key, old) in previous {
            if !fresh.contains_key(&key) {
                changes.push(Change::Deleted(old));
            }
        }

        if !self.has_synced() {
            info!(cache = %self.name, objects = fresh.len(), "cache synced");
        }
        self.synced.send_replace(true);
        changes
    }

    fn notify(&self, changes: Vec<Change<K>>) {
        if changes.is_empty() {
            return;
        }
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner).clone();
        for change in &changes {
            for handler in &handlers {
                match change {
                    Change::Added(obj) => handler.on_add(obj),
                    Change::Updated(old, new) => handler.on_update(old, new),
                    Change::Deleted(obj) => handler.on_delete(obj),
                }
            }
        }
    }

    /// Re-delivers every cached object to handlers
    pub fn resync(&self) {
        let objects = self.list();
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner).clone();
        debug!(cache = %self.name, objects = objects.len(), "resync");
        for obj in &objects {
            for handler in &handlers {
                handler.on_resync(obj);
            }
        }
    }

    /// Drives the cache from `stream` until `cancel` fires.
    ///
    /// Watch errors are retried with exponential backoff; the underlying
    /// watcher re-lists and re-watches on the next poll. After
    /// `failure_threshold` consecutive errors the cache reports unhealthy
    /// until an event arrives again. The stream ending is terminal and is
    /// returned as an error.
    pub async fn run<S>(&self, stream: S, cancel: CancellationToken) -> Result<(), ControllerError>
    where
        S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send,
    {
        let stream = stream.fuse();
        tokio::pin!(stream);
        let period = self.options.resync_period;
        let mut resync = tokio::time::interval_at(Instant::now() + period, period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backoff = ExponentialBackoff::new(self.options.backoff_base, self.options.backoff_max);

        info!(cache = %self.name, "starting watch");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!(cache = %self.name, "watch stopped");
                    return Ok(());
                }
                _ = resync.tick(), if self.has_synced() => self.resync(),
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        backoff.reset();
                        self.record_success();
                        self.apply(event);
                    }
                    Some(Err(err)) => {
                        self.record_failure(&err);
                        let delay = backoff.next_backoff();
                        tokio::select! {
                            () = cancel.cancelled() => return Ok(()),
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => {
                        self.healthy.store(false, Ordering::SeqCst);
                        error!(cache = %self.name, "watch stream ended");
                        return Err(ControllerError::Watch(format!("{} watch stream ended", self.name)));
                    }
                },
            }
        }
    }

    fn record_success(&self) {
        if self.consecutive_failures.swap(0, Ordering::SeqCst) > 0 && !self.healthy.swap(true, Ordering::SeqCst) {
            info!(cache = %self.name, "watch recovered");
        }
    }

    fn record_failure(&self, err: &watcher::Error) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.options.failure_threshold {
            if self.healthy.swap(false, Ordering::SeqCst) {
                error!(cache = %self.name, failures, error = %err, "watch failing persistently, reporting not ready");
            }
        } else {
            warn!(cache = %self.name, failures, error = %err, "watch error, retrying");
        }
    }
}

impl<K> CacheStatus for ResourceCache<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn len(&self) -> usize {
        self.store.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn watch_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    fn keys(&self) -> Vec<ObjectKey> {
        ResourceCache::keys(self)
    }

    fn subscribe_synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }
}

#[async_trait::async_trait]
impl<K> ResourceReader<K> for ResourceCache<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, ClusterError> {
        if !CacheStatus::has_synced(self) {
            return Err(ClusterError::Unavailable(format!("{} cache not synced", self.name)));
        }
        Ok(ResourceCache::get(self, &ObjectKey::new(namespace, name)).map(|obj| (*obj).clone()))
    }
}

#[cfg(test)]
#[path = "cache_test.rs"]
mod cache_test;
