//! Capability traits for cluster access
//!
//! Reconcilers take these traits instead of `kube::Api` so they can be
//! driven by the in-memory mock in unit tests. All async methods must be
//! `Send` to work with Tokio's work-stealing runtime.

use crate::error::ClusterError;

/// Read access to one resource type
#[async_trait::async_trait]
pub trait ResourceReader<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// Fetches `namespace/name`, `Ok(None)` when it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, ClusterError>;
}

/// Read/write access to one namespaced resource type
#[async_trait::async_trait]
pub trait ResourceClient<K>: ResourceReader<K>
where
    K: Send + Sync + 'static,
{
    /// Creates `obj` in its `metadata.namespace`
    async fn create(&self, obj: &K) -> Result<K, ClusterError>;

    /// Replaces `obj`; fails with `Conflict` when `metadata.resourceVersion` is stale
    async fn replace(&self, obj: &K) -> Result<K, ClusterError>;

    /// Deletes `namespace/name`
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// Merge-patches the status subresource with `patch` (`{"status": {...}}`).
    ///
    /// A `metadata.resourceVersion` in the patch is a precondition; a stale
    /// one fails with `Conflict`.
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, ClusterError>;
}
