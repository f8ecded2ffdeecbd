//! Create-or-update of owned child resources.
//!
//! Children have deterministic names, so the manager fetches by name,
//! creates when absent, and otherwise compares only the fields this
//! controller manages. An update is issued only when one of them differs,
//! which keeps our own writes from retriggering reconciliation forever.
//!
//! Compared fields, each switchable through [`DiffPolicy`]:
//!
//! | policy     | Deployment                                   | Service            |
//! |------------|----------------------------------------------|--------------------|
//! | `replicas` | `spec.replicas`                              | -                  |
//! | `image`    | image of the `frontend` container            | -                  |
//! | `template` | selector, pod template labels, object labels | selector, labels   |
//! | `env`      | env of the `frontend` container              | -                  |
//! | `ports`    | ports of the `frontend` container            | `spec.ports`       |
//!
//! The Service type and the controller owner reference are always
//! compared.

use crate::error::ControllerError;
use crate::resources::CONTAINER_NAME;
use cluster_client::{ClusterError, ResourceClient};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Fields compared when deciding whether a child needs an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffPolicy {
    /// Compare the replica count
    pub replicas: bool,
    /// Compare the container image
    pub image: bool,
    /// Compare selector and labels
    pub template: bool,
    /// Compare container environment
    pub env: bool,
    /// Compare container and service ports
    pub ports: bool,
}

impl Default for DiffPolicy {
    fn default() -> Self {
        Self { replicas: true, image: true, template: true, env: true, ports: true }
    }
}

/// What `create_or_update` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildOutcome {
    /// Child did not exist and was created
    Created,
    /// Child existed and a managed field was updated
    Updated,
    /// Child already matched; no write was issued
    Unchanged,
}

/// A resource kind the controller owns
pub trait OwnedChild: Resource + Clone + Send + Sync + 'static {
    /// Kind name used in logs
    const KIND: &'static str;

    /// Whether any managed field of `existing` differs from `desired`
    fn differs(existing: &Self, desired: &Self, policy: &DiffPolicy) -> bool;

    /// Copies the managed fields of `desired` onto `existing`, keeping server-populated ones
    fn merge_into(existing: &mut Self, desired: &Self);
}

fn labels_cover(actual: Option<&BTreeMap<String, String>>, wanted: Option<&BTreeMap<String, String>>) -> bool {
    let Some(wanted) = wanted else {
        return true;
    };
    let Some(actual) = actual else {
        return wanted.is_empty();
    };
    wanted.iter().all(|(k, v)| actual.get(k) == Some(v))
}

fn merge_labels(target: &mut Option<BTreeMap<String, String>>, desired: Option<&BTreeMap<String, String>>) {
    if let Some(desired) = desired {
        let labels = target.get_or_insert_with(BTreeMap::new);
        labels.extend(desired.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

fn frontend_container(deployment: &Deployment) -> Option<&Container> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == CONTAINER_NAME)
}

fn empty_if_none<T>(v: Option<&Vec<T>>) -> &[T] {
    v.map(Vec::as_slice).unwrap_or_default()
}

impl OwnedChild for Deployment {
    const KIND: &'static str = "Deployment";

    fn differs(existing: &Self, desired: &Self, policy: &DiffPolicy) -> bool {
        let (Some(have), Some(want)) = (existing.spec.as_ref(), desired.spec.as_ref()) else {
            return existing.spec.is_none() != desired.spec.is_none();
        };
        if policy.replicas && have.replicas != want.replicas {
            return true;
        }
        if policy.template {
            let have_pod_labels = have.template.metadata.as_ref().and_then(|m| m.labels.as_ref());
            let want_pod_labels = want.template.metadata.as_ref().and_then(|m| m.labels.as_ref());
            if have.selector.match_labels != want.selector.match_labels
                || !labels_cover(have_pod_labels, want_pod_labels)
                || !labels_cover(existing.metadata.labels.as_ref(), desired.metadata.labels.as_ref())
            {
                return true;
            }
        }
        let (Some(have_c), Some(want_c)) = (frontend_container(existing), frontend_container(desired)) else {
            return frontend_container(desired).is_some();
        };
        (policy.image && have_c.image != want_c.image)
            || (policy.env && empty_if_none(have_c.env.as_ref()) != empty_if_none(want_c.env.as_ref()))
            || (policy.ports && empty_if_none(have_c.ports.as_ref()) != empty_if_none(want_c.ports.as_ref()))
    }

    fn merge_into(existing: &mut Self, desired: &Self) {
        merge_labels(&mut existing.metadata.labels, desired.metadata.labels.as_ref());
        let Some(want) = desired.spec.as_ref() else {
            return;
        };
        let have = existing.spec.get_or_insert_with(Default::default);
        have.replicas = want.replicas;
        have.selector.match_labels.clone_from(&want.selector.match_labels);

        let want_pod_labels = want.template.metadata.as_ref().and_then(|m| m.labels.as_ref());
        let pod_meta = have.template.metadata.get_or_insert_with(ObjectMeta::default);
        merge_labels(&mut pod_meta.labels, want_pod_labels);

        let Some(want_c) = frontend_container(desired) else {
            return;
        };
        let pod = have.template.spec.get_or_insert_with(Default::default);
        match pod.containers.iter_mut().find(|c| c.name == CONTAINER_NAME) {
            Some(have_c) => {
                have_c.image.clone_from(&want_c.image);
                have_c.env.clone_from(&want_c.env);
                have_c.ports.clone_from(&want_c.ports);
            }
            None => pod.containers.push(want_c.clone()),
        }
    }
}

impl OwnedChild for Service {
    const KIND: &'static str = "Service";

    fn differs(existing: &Self, desired: &Self, policy: &DiffPolicy) -> bool {
        let (Some(have), Some(want)) = (existing.spec.as_ref(), desired.spec.as_ref()) else {
            return existing.spec.is_none() != desired.spec.is_none();
        };
        let have_type = have.type_.as_deref().unwrap_or("ClusterIP");
        let want_type = want.type_.as_deref().unwrap_or("ClusterIP");
        if have_type != want_type {
            return true;
        }
        if policy.template
            && (have.selector != want.selector
                || !labels_cover(existing.metadata.labels.as_ref(), desired.metadata.labels.as_ref()))
        {
            return true;
        }
        policy.ports && empty_if_none(have.ports.as_ref()) != empty_if_none(want.ports.as_ref())
    }

    fn merge_into(existing: &mut Self, desired: &Self) {
        merge_labels(&mut existing.metadata.labels, desired.metadata.labels.as_ref());
        let Some(want) = desired.spec.as_ref() else {
            return;
        };
        let have = existing.spec.get_or_insert_with(Default::default);
        have.type_.clone_from(&want.type_);
        have.selector.clone_from(&want.selector);
        have.ports.clone_from(&want.ports);
    }
}

fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references.as_ref()?.iter().find(|o| o.controller == Some(true))
}

fn has_owner(meta: &ObjectMeta, owner: &OwnerReference) -> bool {
    meta.owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|o| o.uid == owner.uid))
}

fn set_owner(meta: &mut ObjectMeta, owner: &OwnerReference) {
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    refs.retain(|o| o.uid != owner.uid);
    refs.push(owner.clone());
}

/// Create-or-update for one child kind
pub struct ChildResourceManager<C> {
    client: Arc<dyn ResourceClient<C>>,
    policy: DiffPolicy,
}

impl<C> std::fmt::Debug for ChildResourceManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildResourceManager").field("policy", &self.policy).finish_non_exhaustive()
    }
}

impl<C: OwnedChild> ChildResourceManager<C> {
    /// Creates a manager writing through `client`
    #[must_use]
    pub fn new(client: Arc<dyn ResourceClient<C>>, policy: DiffPolicy) -> Self {
        Self { client, policy }
    }

    /// Ensures `desired` exists and is controlled by `owner`.
    ///
    /// Returns what was done and the child as stored in the cluster.
    /// A child with the same name controlled by a different owner is left
    /// alone and reported as [`ControllerError::OwnershipConflict`].
    pub async fn create_or_update(
        &self,
        owner: &OwnerReference,
        mut desired: C,
    ) -> Result<(ChildOutcome, C), ControllerError> {
        let name = desired.name_any();
        let namespace = desired.namespace().ok_or_else(|| {
            ClusterError::InvalidRequest(format!("{} {name} has no namespace", C::KIND))
        })?;
        set_owner(desired.meta_mut(), owner);

        let Some(existing) = self.client.get(&namespace, &name).await? else {
            let created = match self.client.create(&desired).await {
                Ok(created) => created,
                // lost a race with another writer; retry sees it on the next pass
                Err(ClusterError::AlreadyExists(msg)) => return Err(ClusterError::Conflict(msg).into()),
                Err(err) => return Err(err.into()),
            };
            info!(kind = C::KIND, namespace = %namespace, name = %name, owner = %owner.name, "created child");
            return Ok((ChildOutcome::Created, created));
        };

        if let Some(controller) = controller_of(existing.meta()) {
            if controller.uid != owner.uid {
                return Err(ControllerError::OwnershipConflict(format!(
                    "{} {namespace}/{name} is controlled by {} {}",
                    C::KIND, controller.kind, controller.name
                )));
            }
        }

        let adopt = !has_owner(existing.meta(), owner);
        if !adopt && !C::differs(&existing, &desired, &self.policy) {
            debug!(kind = C::KIND, namespace = %namespace, name = %name, "child up to date");
            return Ok((ChildOutcome::Unchanged, existing));
        }

        let mut updated = existing.clone();
        C::merge_into(&mut updated, &desired);
        set_owner(updated.meta_mut(), owner);
        let stored = self.client.replace(&updated).await?;
        info!(kind = C::KIND, namespace = %namespace, name = %name, adopted = adopt, "updated child");
        Ok((ChildOutcome::Updated, stored))
    }
}

#[cfg(test)]
#[path = "children_test.rs"]
mod children_test;
