//! Kubernetes watch streams.
//!
//! Every cache is fed by a plain `kube_runtime::watcher` stream. The stream
//! re-lists and re-watches on its own after an error; pacing between
//! attempts is left to [`ResourceCache::run`](crate::cache::ResourceCache::run).

use crate::resources::OWNER_LABEL;
use futures::Stream;
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource};
use kube_runtime::watcher;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

/// Item type of every watch stream
pub type WatchItem<K> = Result<watcher::Event<K>, watcher::Error>;

/// API handle scoped to `namespace`, or cluster-wide when `None`
pub fn scoped_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Watch config for the FrontendPage resource itself
#[must_use]
pub fn page_watch_config() -> watcher::Config {
    watcher::Config::default()
}

/// Watch config for owned children, restricted to objects carrying the owner label
#[must_use]
pub fn child_watch_config() -> watcher::Config {
    watcher::Config::default().labels(OWNER_LABEL)
}

/// List-then-watch stream over `api`
pub fn watch<K>(api: Api<K>, config: watcher::Config) -> impl Stream<Item = WatchItem<K>> + Send + 'static
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    watcher(api, config)
}
