//! Mock cluster client for unit testing
//!
//! In-memory implementation of [`ResourceClient`] that behaves like the
//! API server where reconcilers care: resourceVersion compare-and-swap on
//! replace, generation bumps on spec changes, uid assignment, status kept
//! apart from spec writes, and merge-patch on the status subresource.
//! Writes are recorded so tests can assert that a pass was a no-op.

use crate::client_trait::{ResourceClient, ResourceReader};
use crate::error::ClusterError;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Failure injected into mock calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// API server unreachable (transient)
    Unavailable,
    /// Optimistic concurrency failure (transient)
    Conflict,
    /// Request timed out (transient)
    Timeout,
    /// Request rejected by validation (permanent)
    Invalid,
}

impl FaultKind {
    fn to_error(self, verb: &str) -> ClusterError {
        match self {
            Self::Unavailable => ClusterError::Transport(format!("{verb}: connection refused")),
            Self::Conflict => ClusterError::Conflict(format!("{verb}: injected conflict")),
            Self::Timeout => ClusterError::Timeout(format!("{verb}: injected timeout")),
            Self::Invalid => ClusterError::Api {
                code: 422,
                message: format!("{verb}: injected validation failure"),
            },
        }
    }
}

/// A recorded write call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCall {
    /// `create`, `replace`, `delete` or `patch_status`
    pub verb: &'static str,
    /// Target namespace
    pub namespace: String,
    /// Target name
    pub name: String,
}

#[derive(Debug)]
struct Store<K> {
    objects: BTreeMap<(String, String), K>,
    next_version: u64,
    next_uid: u64,
}

#[derive(Debug, Default)]
struct Faults {
    all: Option<FaultKind>,
    writes: Option<FaultKind>,
}

/// Mock cluster client for testing
///
/// Clones share everything. [`MockResourceClient::sharing`] creates a
/// handle onto the same objects with its own faults and write log, which
/// models two processes talking to one API server.
#[derive(Debug)]
pub struct MockResourceClient<K> {
    store: Arc<Mutex<Store<K>>>,
    faults: Arc<Mutex<Faults>>,
    writes: Arc<Mutex<Vec<WriteCall>>>,
}

impl<K> Clone for MockResourceClient<K> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            faults: Arc::clone(&self.faults),
            writes: Arc::clone(&self.writes),
        }
    }
}

impl<K> Default for MockResourceClient<K> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

impl<K> MockResourceClient<K> {
    /// Create an empty mock
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(Store {
                objects: BTreeMap::new(),
                next_version: 1,
                next_uid: 1,
            })),
            faults: Arc::new(Mutex::new(Faults::default())),
            writes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// New handle onto the same objects with independent faults and write log
    #[must_use]
    pub fn sharing(other: &Self) -> Self {
        Self {
            store: Arc::clone(&other.store),
            faults: Arc::new(Mutex::new(Faults::default())),
            writes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fail every call (reads included) through this handle
    pub fn fail_all(&self, fault: Option<FaultKind>) {
        lock(&self.faults).all = fault;
    }

    /// Fail every write through this handle
    pub fn fail_writes(&self, fault: Option<FaultKind>) {
        lock(&self.faults).writes = fault;
    }

    /// Recorded writes made through this handle
    #[must_use]
    pub fn writes(&self) -> Vec<WriteCall> {
        lock(&self.writes).clone()
    }

    /// Number of writes made through this handle
    #[must_use]
    pub fn write_count(&self) -> usize {
        lock(&self.writes).len()
    }

    /// Number of writes targeting `name`
    #[must_use]
    pub fn writes_to(&self, name: &str) -> usize {
        lock(&self.writes).iter().filter(|w| w.name == name).count()
    }

    /// Forget recorded writes
    pub fn clear_writes(&self) {
        lock(&self.writes).clear();
    }

    fn check(&self, verb: &str, write: bool) -> Result<(), ClusterError> {
        let faults = lock(&self.faults);
        if let Some(fault) = faults.all {
            return Err(fault.to_error(verb));
        }
        match faults.writes {
            Some(fault) if write => Err(fault.to_error(verb)),
            _ => Ok(()),
        }
    }

    fn record(&self, verb: &'static str, namespace: &str, name: &str) {
        lock(&self.writes).push(WriteCall {
            verb,
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
    }
}

impl<K> MockResourceClient<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned,
{
    /// Seed an object without recording a write
    ///
    /// Missing uid, generation and resourceVersion are filled in.
    pub fn insert(&self, mut obj: K) {
        let mut store = lock(&self.store);
        let key = (obj.namespace().unwrap_or_default(), obj.name_any());
        let meta = obj.meta_mut();
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{}", store.next_uid));
            store.next_uid += 1;
        }
        meta.generation.get_or_insert(1);
        meta.resource_version = Some(store.next_version.to_string());
        store.next_version += 1;
        store.objects.insert(key, obj);
    }

    /// Current copy of `namespace/name`, bypassing faults
    #[must_use]
    pub fn object(&self, namespace: &str, name: &str) -> Option<K> {
        lock(&self.store)
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Set `status` directly, as the platform would, without recording a write
    pub fn set_status(&self, namespace: &str, name: &str, status: Value) -> Result<(), ClusterError> {
        let mut store = lock(&self.store);
        let version = store.next_version;
        let key = (namespace.to_string(), name.to_string());
        let current = store
            .objects
            .get(&key)
            .ok_or_else(|| ClusterError::NotFound(format!("{namespace}/{name}")))?;
        let mut value = serde_json::to_value(current)?;
        value["status"] = status;
        let mut updated: K = serde_json::from_value(value)?;
        updated.meta_mut().resource_version = Some(version.to_string());
        store.next_version += 1;
        store.objects.insert(key, updated);
        Ok(())
    }
}

#[async_trait::async_trait]
impl<K> ResourceReader<K> for MockResourceClient<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, ClusterError> {
        self.check("get", false)?;
        Ok(self.object(namespace, name))
    }
}

#[async_trait::async_trait]
impl<K> ResourceClient<K> for MockResourceClient<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn create(&self, obj: &K) -> Result<K, ClusterError> {
        self.check("create", true)?;
        let namespace = obj
            .namespace()
            .ok_or_else(|| ClusterError::InvalidRequest("object has no namespace".to_string()))?;
        let name = obj.name_any();
        let mut store = lock(&self.store);
        let key = (namespace.clone(), name.clone());
        if store.objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists(format!("{namespace}/{name}")));
        }
        let mut created = obj.clone();
        let meta = created.meta_mut();
        meta.uid = Some(format!("uid-{}", store.next_uid));
        meta.generation = Some(1);
        meta.resource_version = Some(store.next_version.to_string());
        store.next_uid += 1;
        store.next_version += 1;
        store.objects.insert(key, created.clone());
        drop(store);
        self.record("create", &namespace, &name);
        Ok(created)
    }

    async fn replace(&self, obj: &K) -> Result<K, ClusterError> {
        self.check("replace", true)?;
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let mut store = lock(&self.store);
        let key = (namespace.clone(), name.clone());
        let current = store
            .objects
            .get(&key)
            .ok_or_else(|| ClusterError::NotFound(format!("{namespace}/{name}")))?;

        let requested = obj.resource_version();
        if requested.is_some() && requested != current.resource_version() {
            return Err(ClusterError::Conflict(format!(
                "{namespace}/{name}: resourceVersion {} is stale",
                requested.unwrap_or_default()
            )));
        }

        let current_value = serde_json::to_value(current)?;
        let mut value = serde_json::to_value(obj)?;
        let spec_changed = value.get("spec") != current_value.get("spec");
        match current_value.get("status") {
            Some(status) => value["status"] = status.clone(),
            None => {
                if let Value::Object(map) = &mut value {
                    map.remove("status");
                }
            }
        }
        let mut updated: K = serde_json::from_value(value)?;
        let generation = current.meta().generation.unwrap_or(1);
        let meta = updated.meta_mut();
        meta.uid.clone_from(&current.meta().uid);
        meta.generation = Some(if spec_changed { generation + 1 } else { generation });
        meta.resource_version = Some(store.next_version.to_string());
        store.next_version += 1;
        store.objects.insert(key, updated.clone());
        drop(store);
        self.record("replace", &namespace, &name);
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.check("delete", true)?;
        let removed = lock(&self.store)
            .objects
            .remove(&(namespace.to_string(), name.to_string()));
        if removed.is_none() {
            return Err(ClusterError::NotFound(format!("{namespace}/{name}")));
        }
        self.record("delete", namespace, name);
        Ok(())
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<K, ClusterError> {
        self.check("patch_status", true)?;
        let mut store = lock(&self.store);
        let key = (namespace.to_string(), name.to_string());
        let current = store
            .objects
            .get(&key)
            .ok_or_else(|| ClusterError::NotFound(format!("{namespace}/{name}")))?;
        let precondition = patch.pointer("/metadata/resourceVersion").and_then(Value::as_str);
        if let Some(expected) = precondition {
            if current.meta().resource_version.as_deref() != Some(expected) {
                return Err(ClusterError::Conflict(format!(
                    "{namespace}/{name}: resourceVersion {expected} is stale"
                )));
            }
        }
        let mut value = serde_json::to_value(current)?;
        if let Some(status) = patch.get("status") {
            let target = value
                .as_object_mut()
                .map(|map| map.entry("status").or_insert(Value::Null))
                .ok_or_else(|| ClusterError::InvalidRequest("object is not a map".to_string()))?;
            merge_patch(target, status);
        }
        let mut updated: K = serde_json::from_value(value)?;
        updated.meta_mut().resource_version = Some(store.next_version.to_string());
        store.next_version += 1;
        store.objects.insert(key, updated.clone());
        drop(store);
        self.record("patch_status", namespace, name);
        Ok(updated)
    }
}
