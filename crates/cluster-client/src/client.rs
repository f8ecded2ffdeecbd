//! `kube::Api` backed implementation of the capability traits

use crate::client_trait::{ResourceClient, ResourceReader};
use crate::error::ClusterError;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::core::NamespaceResourceScope;
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::debug;

/// Cluster client for a single namespaced resource type.
///
/// Every request is bounded by `request_timeout` so a stalled API server
/// cannot block a reconcile worker past the shutdown grace period.
pub struct KubeResourceClient<K> {
    client: Client,
    request_timeout: Duration,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for KubeResourceClient<K> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            request_timeout: self.request_timeout,
            _kind: PhantomData,
        }
    }
}

impl<K> fmt::Debug for KubeResourceClient<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeResourceClient")
            .field("kind", &std::any::type_name::<K>())
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl<K> KubeResourceClient<K>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + fmt::Debug
        + Send
        + Sync
        + 'static,
    K::DynamicType: Default,
{
    /// Creates a client over `client` with a per-request timeout
    #[must_use]
    pub fn new(client: Client, request_timeout: Duration) -> Self {
        Self { client, request_timeout, _kind: PhantomData }
    }

    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn bounded<T, F>(&self, verb: &str, target: &str, request: F) -> Result<T, ClusterError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        debug!(verb, target, "cluster request");
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(result) => result.map_err(ClusterError::from),
            Err(_) => Err(ClusterError::Timeout(format!(
                "{verb} {target} exceeded {:?}",
                self.request_timeout
            ))),
        }
    }
}

fn namespace_of<K: Resource>(obj: &K) -> Result<String, ClusterError> {
    obj.meta()
        .namespace
        .clone()
        .ok_or_else(|| ClusterError::InvalidRequest("object has no namespace".to_string()))
}

#[async_trait::async_trait]
impl<K> ResourceReader<K> for KubeResourceClient<K>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + fmt::Debug
        + Send
        + Sync
        + 'static,
    K::DynamicType: Default,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, ClusterError> {
        let api = self.api(namespace);
        self.bounded("get", &format!("{namespace}/{name}"), api.get_opt(name)).await
    }
}

#[async_trait::async_trait]
impl<K> ResourceClient<K> for KubeResourceClient<K>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + fmt::Debug
        + Send
        + Sync
        + 'static,
    K::DynamicType: Default,
{
    async fn create(&self, obj: &K) -> Result<K, ClusterError> {
        let namespace = namespace_of(obj)?;
        let target = format!("{namespace}/{}", obj.name_any());
        let api = self.api(&namespace);
        match self.bounded("create", &target, api.create(&PostParams::default(), obj)).await {
            Err(ClusterError::Conflict(msg)) => Err(ClusterError::AlreadyExists(msg)),
            other => other,
        }
    }

    async fn replace(&self, obj: &K) -> Result<K, ClusterError> {
        let namespace = namespace_of(obj)?;
        let name = obj.name_any();
        let target = format!("{namespace}/{name}");
        let api = self.api(&namespace);
        self.bounded("replace", &target, api.replace(&name, &PostParams::default(), obj))
            .await
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let api = self.api(namespace);
        self.bounded(
            "delete",
            &format!("{namespace}/{name}"),
            api.delete(name, &DeleteParams::background()),
        )
        .await
        .map(|_| ())
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, ClusterError> {
        let api = self.api(namespace);
        self.bounded(
            "patch_status",
            &format!("{namespace}/{name}"),
            api.patch_status(name, &PatchParams::default(), &Patch::Merge(patch)),
        )
        .await
    }
}
