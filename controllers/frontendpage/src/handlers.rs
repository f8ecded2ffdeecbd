//! Cache event handlers.
//!
//! Handlers do nothing but turn cache notifications into work item keys;
//! all real work happens in the engine's pull loop.

use crate::config::EventFilter;
use crate::queue::{EventKind, WorkQueue};
use cluster_client::ObjectKey;
use kube::Resource;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Receives change notifications from a [`ResourceCache`](crate::cache::ResourceCache)
pub trait EventHandler<K>: Send + Sync {
    /// Object observed for the first time
    fn on_add(&self, obj: &K);
    /// Object changed from `old` to `new`
    fn on_update(&self, old: &K, new: &K);
    /// Object removed
    fn on_delete(&self, obj: &K);
    /// Object re-delivered by a periodic resync
    fn on_resync(&self, obj: &K);
}

/// Late-bound queue handle.
///
/// Caches run for the whole process lifetime while queues only exist while
/// this instance leads. Events arriving with no queue installed are dropped;
/// each leadership term starts with a full resync instead.
#[derive(Debug, Default)]
pub struct QueueSlot {
    queue: RwLock<Option<Arc<WorkQueue<ObjectKey>>>>,
}

impl QueueSlot {
    /// Routes subsequent events into `queue`
    pub fn install(&self, queue: Arc<WorkQueue<ObjectKey>>) {
        *self.queue.write().unwrap_or_else(PoisonError::into_inner) = Some(queue);
    }

    /// Stops routing events
    pub fn clear(&self) {
        *self.queue.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Currently installed queue
    pub fn current(&self) -> Option<Arc<WorkQueue<ObjectKey>>> {
        self.queue.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Enqueues `key` if a queue is installed
    pub fn add(&self, key: ObjectKey, hint: EventKind) {
        if let Some(queue) = self.current() {
            queue.add(key, hint);
        }
    }
}

/// Enqueues the key of the changed object itself
#[derive(Debug)]
pub struct EnqueueHandler {
    slot: Arc<QueueSlot>,
    filter: EventFilter,
    skip_unchanged_generation: bool,
}

impl EnqueueHandler {
    /// Creates a handler feeding `slot`
    #[must_use]
    pub fn new(slot: Arc<QueueSlot>, filter: EventFilter) -> Self {
        Self { slot, filter, skip_unchanged_generation: false }
    }

    /// Ignore updates that leave `metadata.generation` unchanged
    ///
    /// Status writes do not bump the generation, so this drops the events
    /// caused by the reconciler's own status updates.
    #[must_use]
    pub fn with_generation_predicate(mut self) -> Self {
        self.skip_unchanged_generation = true;
        self
    }

    fn enqueue<K: Resource>(&self, obj: &K, hint: EventKind) {
        let Some(key) = ObjectKey::from_resource(obj) else {
            return;
        };
        if self.filter.log_events {
            debug!(event = hint.as_str(), key = %key, "enqueue");
        }
        self.slot.add(key, hint);
    }
}

impl<K: Resource + Send + Sync> EventHandler<K> for EnqueueHandler {
    fn on_add(&self, obj: &K) {
        self.enqueue(obj, EventKind::Add);
    }

    fn on_update(&self, old: &K, new: &K) {
        if !self.filter.handle_updates {
            return;
        }
        let (before, after) = (old.meta().generation, new.meta().generation);
        if self.skip_unchanged_generation && before.is_some() && before == after {
            return;
        }
        self.enqueue(new, EventKind::Update);
    }

    fn on_delete(&self, obj: &K) {
        if self.filter.handle_deletes {
            self.enqueue(obj, EventKind::Delete);
        }
    }

    fn on_resync(&self, obj: &K) {
        self.enqueue(obj, EventKind::Update);
    }
}

/// Enqueues the controlling owner of the changed object
#[derive(Debug)]
pub struct OwnerEnqueueHandler {
    slot: Arc<QueueSlot>,
    owner_kind: String,
    log_events: bool,
}

impl OwnerEnqueueHandler {
    /// Creates a handler mapping children to owners of kind `owner_kind`
    #[must_use]
    pub fn new(slot: Arc<QueueSlot>, owner_kind: impl Into<String>, log_events: bool) -> Self {
        Self { slot, owner_kind: owner_kind.into(), log_events }
    }

    /// Key of the controller owner of `obj`, if it is of the expected kind
    pub fn owner_key<K: Resource>(&self, obj: &K) -> Option<ObjectKey> {
        let meta = obj.meta();
        let owner = meta
            .owner_references
            .as_ref()?
            .iter()
            .find(|o| o.controller == Some(true) && o.kind == self.owner_kind)?;
        Some(ObjectKey::new(meta.namespace.clone()?, owner.name.clone()))
    }

    fn enqueue<K: Resource>(&self, obj: &K, hint: EventKind) {
        if let Some(key) = self.owner_key(obj) {
            if self.log_events {
                debug!(event = hint.as_str(), owner = %key, "enqueue owner");
            }
            self.slot.add(key, EventKind::Update);
        }
    }
}

impl<K: Resource + Send + Sync> EventHandler<K> for OwnerEnqueueHandler {
    fn on_add(&self, obj: &K) {
        self.enqueue(obj, EventKind::Add);
    }

    fn on_update(&self, old: &K, new: &K) {
        let before = self.owner_key(old);
        self.enqueue(new, EventKind::Update);
        if before.is_some() && before != self.owner_key(new) {
            self.enqueue(old, EventKind::Update);
        }
    }

    fn on_delete(&self, obj: &K) {
        self.enqueue(obj, EventKind::Delete);
    }

    fn on_resync(&self, _obj: &K) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::api::ObjectMeta;
    use std::time::Duration;

    fn installed_slot() -> (Arc<QueueSlot>, Arc<WorkQueue<ObjectKey>>) {
        let slot = Arc::new(QueueSlot::default());
        let queue = Arc::new(WorkQueue::new(Duration::from_millis(5), Duration::from_secs(1)));
        slot.install(Arc::clone(&queue));
        (slot, queue)
    }

    fn deployment(generation: i64, owner: Option<&str>) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("demo-deployment".into()),
                namespace: Some("web".into()),
                generation: Some(generation),
                owner_references: owner.map(|name| {
                    vec![OwnerReference {
                        api_version: "k8scli.dev/v1".into(),
                        kind: "FrontendPage".into(),
                        name: name.into(),
                        uid: "uid-1".into(),
                        controller: Some(true),
                        block_owner_deletion: Some(true),
                    }]
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_generation_predicate_skips_status_only_updates() {
        let (slot, queue) = installed_slot();
        let handler = EnqueueHandler::new(slot, EventFilter::default()).with_generation_predicate();

        handler.on_update(&deployment(1, None), &deployment(1, None));
        assert!(queue.is_empty());

        handler.on_update(&deployment(1, None), &deployment(2, None));
        let item = queue.get().await.unwrap();
        assert_eq!(item.key, ObjectKey::new("web", "demo-deployment"));
        assert_eq!(item.hint, EventKind::Update);
    }

    #[test]
    fn test_filter_disables_updates_and_deletes() {
        let (slot, queue) = installed_slot();
        let filter = EventFilter { log_events: false, handle_updates: false, handle_deletes: false };
        let handler = EnqueueHandler::new(slot, filter);

        handler.on_update(&deployment(1, None), &deployment(2, None));
        handler.on_delete(&deployment(2, None));
        assert!(queue.is_empty());

        handler.on_add(&deployment(1, None));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_owner_handler_enqueues_owner_key() {
        let (slot, queue) = installed_slot();
        let handler = OwnerEnqueueHandler::new(slot, "FrontendPage", false);

        handler.on_add(&deployment(1, Some("demo")));
        handler.on_add(&deployment(1, None));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.unwrap().key, ObjectKey::new("web", "demo"));
    }

    #[test]
    fn test_events_without_queue_are_dropped() {
        let slot = Arc::new(QueueSlot::default());
        let handler = EnqueueHandler::new(Arc::clone(&slot), EventFilter::default());
        EventHandler::<Deployment>::on_add(&handler, &deployment(1, None));
        assert!(slot.current().is_none());
    }
}
