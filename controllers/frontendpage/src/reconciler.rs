//! FrontendPage reconciler.
//!
//! Drives each FrontendPage through `"" -> Pending -> Running | Failed`:
//!
//! 1. First sight (empty phase): persist `Pending` before anything else.
//! 2. Create or update `<name>-deployment` and `<name>-service`, both
//!    controlled by the page so the garbage collector reaps them with it.
//! 3. A child write failure sets `Failed` with the error as message and
//!    requeues after the configured delay.
//! 4. Otherwise `Running` once the Deployment reports all replicas ready,
//!    else `Pending` with a requeue.
//!
//! Status goes through the status subresource and is written only when
//! its content changed, so a converged page costs no writes per pass.
//! Every status patch carries the resourceVersion the pass started from:
//! a pass working from a stale cached snapshot gets a conflict and is
//! retried instead of overwriting newer status.

use crate::children::ChildResourceManager;
use crate::engine::{Action, Reconcile};
use crate::error::ControllerError;
use crate::resources::{build_deployment, build_service};
use cluster_client::{ClusterError, ObjectKey, ResourceClient, ResourceReader};
use crds::{FrontendPage, FrontendPagePhase, FrontendPageStatus, deployment_name, service_name, service_url};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::{Resource, ResourceExt};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Reconciles FrontendPage resources
pub struct FrontendPageReconciler {
    pages: Arc<dyn ResourceReader<FrontendPage>>,
    page_status: Arc<dyn ResourceClient<FrontendPage>>,
    deployments: ChildResourceManager<Deployment>,
    services: ChildResourceManager<Service>,
    requeue_after: Duration,
}

impl std::fmt::Debug for FrontendPageReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrontendPageReconciler")
            .field("requeue_after", &self.requeue_after)
            .finish_non_exhaustive()
    }
}

fn status_patch(resource_version: Option<&str>, status: &FrontendPageStatus) -> Value {
    // explicit nulls so merge-patch clears fields that no longer apply
    let mut patch = json!({
        "status": {
            "phase": status.phase,
            "ready": status.ready,
            "url": status.url,
            "deploymentName": status.deployment_name,
            "serviceName": status.service_name,
            "lastUpdated": status.last_updated,
            "observedGeneration": status.observed_generation,
            "message": status.message,
        }
    });
    if let Some(version) = resource_version {
        patch["metadata"] = json!({ "resourceVersion": version });
    }
    patch
}

fn deployment_ready(deployment: &Deployment) -> bool {
    let desired = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    let ready = deployment.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
    desired > 0 && ready == desired
}

impl FrontendPageReconciler {
    /// Creates a reconciler.
    ///
    /// `pages` serves reads (normally the watch cache), `page_status` the
    /// status subresource writes.
    #[must_use]
    pub fn new(
        pages: Arc<dyn ResourceReader<FrontendPage>>,
        page_status: Arc<dyn ResourceClient<FrontendPage>>,
        deployments: ChildResourceManager<Deployment>,
        services: ChildResourceManager<Service>,
        requeue_after: Duration,
    ) -> Self {
        Self { pages, page_status, deployments, services, requeue_after }
    }

    /// Writes `next` unless it only differs from the page's status in `lastUpdated`.
    ///
    /// On success `page` carries the stored status and resourceVersion, so a
    /// later write in the same pass is checked against this one.
    async fn write_status(&self, page: &mut FrontendPage, next: FrontendPageStatus) -> Result<(), ControllerError> {
        let current = page.status.clone().unwrap_or_default();
        if current.same_content(&next) {
            debug!(phase = ?next.phase, "status unchanged");
            return Ok(());
        }
        let namespace = page.namespace().unwrap_or_default();
        let patch = status_patch(page.metadata.resource_version.as_deref(), &next);
        let stored = self.page_status.patch_status(&namespace, &page.name_any(), &patch).await?;
        info!(
            phase = next.phase.map(FrontendPagePhase::as_str),
            ready = next.ready,
            "status updated"
        );
        page.metadata.resource_version = stored.metadata.resource_version;
        page.status = Some(stored.status.unwrap_or(next));
        Ok(())
    }

    /// Records `message` as a `Failed` status and requeues
    async fn fail(&self, page: &mut FrontendPage, message: String) -> Result<Action, ControllerError> {
        let failed = FrontendPageStatus {
            phase: Some(FrontendPagePhase::Failed),
            ready: false,
            message: Some(message),
            last_updated: Some(chrono::Utc::now()),
            observed_generation: page.metadata.generation,
            ..page.status.clone().unwrap_or_default()
        };
        self.write_status(page, failed).await?;
        Ok(Action::requeue(self.requeue_after))
    }

    #[instrument(skip(self, cancel), fields(key = %key))]
    async fn reconcile_page(
        &self,
        key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> Result<Action, ControllerError> {
        let Some(mut page) = self.pages.get(&key.namespace, &key.name).await? else {
            debug!("FrontendPage not found, assuming deleted");
            return Ok(Action::Done);
        };
        if page.meta().deletion_timestamp.is_some() {
            debug!("FrontendPage is being deleted, children follow through garbage collection");
            return Ok(Action::Done);
        }

        let name = page.name_any();
        let generation = page.metadata.generation;
        if page.status.as_ref().is_none_or(|s| s.phase.is_none()) {
            let pending = FrontendPageStatus {
                phase: Some(FrontendPagePhase::Pending),
                ready: false,
                deployment_name: Some(deployment_name(&name)),
                service_name: Some(service_name(&name)),
                observed_generation: generation,
                message: Some("Reconciling".to_string()),
                last_updated: Some(chrono::Utc::now()),
                url: None,
            };
            self.write_status(&mut page, pending).await?;
        }

        let owner = page.controller_owner_ref(&()).ok_or_else(|| {
            ClusterError::InvalidRequest(format!("FrontendPage {key} has no uid"))
        })?;

        if cancel.is_cancelled() {
            return Err(ControllerError::Cancelled);
        }
        let deployment = match self.deployments.create_or_update(&owner, build_deployment(&page)).await {
            Ok((_, deployment)) => deployment,
            Err(err) => {
                warn!(error = %err, "child resource write failed");
                return self.fail(&mut page, err.to_string()).await;
            }
        };
        let service = match self.services.create_or_update(&owner, build_service(&page)).await {
            Ok((_, service)) => service,
            Err(err) => {
                warn!(error = %err, "child resource write failed");
                return self.fail(&mut page, err.to_string()).await;
            }
        };

        let ready = deployment_ready(&deployment);
        let deploy_name = deployment.name_any();
        let svc_name = service.name_any();
        let next = FrontendPageStatus {
            phase: Some(if ready { FrontendPagePhase::Running } else { FrontendPagePhase::Pending }),
            ready,
            url: Some(service_url(&svc_name, &key.namespace, &page.spec.path)),
            message: Some(if ready {
                format!("Deployment {deploy_name} is ready")
            } else {
                format!("Deployment {deploy_name} is not ready yet")
            }),
            deployment_name: Some(deploy_name),
            service_name: Some(svc_name),
            observed_generation: generation,
            last_updated: Some(chrono::Utc::now()),
        };
        self.write_status(&mut page, next).await?;

        Ok(if ready { Action::Done } else { Action::requeue(self.requeue_after) })
    }
}

#[async_trait::async_trait]
impl Reconcile for FrontendPageReconciler {
    async fn reconcile(
        &self,
        key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> Result<Action, ControllerError> {
        self.reconcile_page(key, cancel).await
    }
}

#[cfg(test)]
#[path = "reconciler_test.rs"]
mod reconciler_test;
