//! Unit tests for the FrontendPage reconciler

use super::*;
use crate::cache::{CacheOptions, ResourceCache};
use crate::children::DiffPolicy;
use crate::test_utils::{NAMESPACE, frontend_page, owner_ref};
use cluster_client::{FaultKind, MockResourceClient};
use kube_runtime::watcher;

const REQUEUE: Duration = Duration::from_secs(30);

struct Harness {
    pages: MockResourceClient<FrontendPage>,
    deployments: MockResourceClient<Deployment>,
    services: MockResourceClient<Service>,
    reconciler: FrontendPageReconciler,
}

impl Harness {
    fn new() -> Self {
        let pages = MockResourceClient::<FrontendPage>::new();
        Self::reading_from(pages.clone(), Arc::new(pages))
    }

    /// Harness whose reconciler reads pages through an informer cache
    fn cached() -> (Self, Arc<ResourceCache<FrontendPage>>) {
        let cache = Arc::new(ResourceCache::<FrontendPage>::new("frontendpages", CacheOptions::default()));
        let harness = Self::reading_from(
            MockResourceClient::<FrontendPage>::new(),
            Arc::clone(&cache) as Arc<dyn ResourceReader<FrontendPage>>,
        );
        (harness, cache)
    }

    fn reading_from(pages: MockResourceClient<FrontendPage>, reader: Arc<dyn ResourceReader<FrontendPage>>) -> Self {
        let deployments = MockResourceClient::<Deployment>::new();
        let services = MockResourceClient::<Service>::new();
        let reconciler = FrontendPageReconciler::new(
            reader,
            Arc::new(pages.clone()),
            ChildResourceManager::new(Arc::new(deployments.clone()), DiffPolicy::default()),
            ChildResourceManager::new(Arc::new(services.clone()), DiffPolicy::default()),
            REQUEUE,
        );
        Self { pages, deployments, services, reconciler }
    }

    async fn pass(&self, name: &str) -> Result<Action, ControllerError> {
        self.reconciler
            .reconcile(&ObjectKey::new(NAMESPACE, name), &CancellationToken::new())
            .await
    }

    fn page(&self, name: &str) -> FrontendPage {
        self.pages.object(NAMESPACE, name).unwrap()
    }

    fn status(&self, name: &str) -> FrontendPageStatus {
        self.page(name).status.unwrap_or_default()
    }

    fn deployment(&self, name: &str) -> Deployment {
        self.deployments.object(NAMESPACE, &deployment_name(name)).unwrap()
    }

    fn mark_ready(&self, name: &str, replicas: i32) {
        self.deployments
            .set_status(
                NAMESPACE,
                &deployment_name(name),
                json!({"replicas": replicas, "readyReplicas": replicas}),
            )
            .unwrap();
    }

    async fn scale(&self, name: &str, replicas: i32) {
        let mut page = self.page(name);
        page.spec.replicas = replicas;
        self.pages.replace(&page).await.unwrap();
    }

    /// Delivers the stored page to `cache` as a watch event
    fn observe(&self, cache: &ResourceCache<FrontendPage>, name: &str) {
        cache.apply(watcher::Event::Apply(self.page(name)));
    }

    fn clear_writes(&self) {
        self.pages.clear_writes();
        self.deployments.clear_writes();
        self.services.clear_writes();
    }

    fn total_writes(&self) -> usize {
        self.pages.write_count() + self.deployments.write_count() + self.services.write_count()
    }
}

#[tokio::test]
async fn test_first_pass_creates_children_and_waits_for_readiness() {
    let h = Harness::new();
    h.pages.insert(frontend_page("demo", 2, "nginx:1.21"));

    let action = h.pass("demo").await.unwrap();

    assert_eq!(action, Action::Requeue(REQUEUE));
    let status = h.status("demo");
    assert_eq!(status.phase, Some(FrontendPagePhase::Pending));
    assert!(!status.ready);
    assert_eq!(status.deployment_name.as_deref(), Some("demo-deployment"));
    assert_eq!(status.service_name.as_deref(), Some("demo-service"));
    assert_eq!(status.message.as_deref(), Some("Deployment demo-deployment is not ready yet"));
    assert_eq!(status.observed_generation, Some(1));
    assert!(status.last_updated.is_some());
    // Pending first, then the post-apply status
    assert_eq!(h.pages.writes_to("demo"), 2);
}

#[tokio::test]
async fn test_second_pass_is_a_no_op() {
    let h = Harness::new();
    h.pages.insert(frontend_page("demo", 2, "nginx:1.21"));
    h.pass("demo").await.unwrap();
    h.clear_writes();

    let action = h.pass("demo").await.unwrap();

    assert_eq!(action, Action::Requeue(REQUEUE));
    assert_eq!(h.total_writes(), 0);
}

#[tokio::test]
async fn test_converged_page_is_a_no_op() {
    let h = Harness::new();
    h.pages.insert(frontend_page("demo", 2, "nginx:1.21"));
    h.pass("demo").await.unwrap();
    h.mark_ready("demo", 2);
    h.pass("demo").await.unwrap();
    h.clear_writes();

    assert_eq!(h.pass("demo").await.unwrap(), Action::Done);
    assert_eq!(h.total_writes(), 0);
}

#[tokio::test]
async fn test_children_are_owned_by_page() {
    let h = Harness::new();
    h.pages.insert(frontend_page("demo", 1, "nginx:1.20"));
    h.pass("demo").await.unwrap();

    let page = h.page("demo");
    let uid = page.metadata.uid.clone().unwrap();
    let deployment = h.deployment("demo");
    let service = h.services.object(NAMESPACE, "demo-service").unwrap();
    for refs in [deployment.metadata.owner_references, service.metadata.owner_references] {
        let refs = refs.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].uid, uid);
        assert_eq!(refs[0].kind, "FrontendPage");
        assert_eq!(refs[0].controller, Some(true));
    }
}

#[tokio::test]
async fn test_ready_deployment_sets_running() {
    let h = Harness::new();
    h.pages.insert(frontend_page("demo", 2, "nginx:1.21"));
    h.pass("demo").await.unwrap();
    h.mark_ready("demo", 2);

    let action = h.pass("demo").await.unwrap();

    assert_eq!(action, Action::Done);
    let status = h.status("demo");
    assert_eq!(status.phase, Some(FrontendPagePhase::Running));
    assert!(status.ready);
    assert_eq!(status.url.as_deref(), Some("http://demo-service.default.svc.cluster.local/demo"));
    assert_eq!(status.message.as_deref(), Some("Deployment demo-deployment is ready"));
}

#[tokio::test]
async fn test_partially_ready_deployment_stays_pending() {
    let h = Harness::new();
    h.pages.insert(frontend_page("demo", 3, "nginx:1.21"));
    h.pass("demo").await.unwrap();
    h.mark_ready("demo", 2);

    assert_eq!(h.pass("demo").await.unwrap(), Action::Requeue(REQUEUE));
    assert_eq!(h.status("demo").phase, Some(FrontendPagePhase::Pending));
}

#[tokio::test]
async fn test_missing_page_is_success() {
    let h = Harness::new();

    assert_eq!(h.pass("ghost").await.unwrap(), Action::Done);
    assert_eq!(h.total_writes(), 0);
}

#[tokio::test]
async fn test_page_being_deleted_is_left_alone() {
    let h = Harness::new();
    let mut page = frontend_page("demo", 1, "nginx:1.20");
    page.metadata.deletion_timestamp = Some(serde_json::from_value(json!("2026-01-01T00:00:00Z")).unwrap());
    h.pages.insert(page);

    assert_eq!(h.pass("demo").await.unwrap(), Action::Done);
    assert_eq!(h.total_writes(), 0);
}

#[tokio::test]
async fn test_child_write_failure_sets_failed_and_requeues() {
    let h = Harness::new();
    h.pages.insert(frontend_page("demo", 1, "nginx:1.20"));
    h.deployments.fail_writes(Some(FaultKind::Unavailable));

    let action = h.pass("demo").await.unwrap();

    assert_eq!(action, Action::Requeue(REQUEUE));
    let status = h.status("demo");
    assert_eq!(status.phase, Some(FrontendPagePhase::Failed));
    assert!(!status.ready);
    assert!(status.message.unwrap().contains("connection refused"));
    assert_eq!(h.services.write_count(), 0);
}

#[tokio::test]
async fn test_recovers_from_failed() {
    let h = Harness::new();
    h.pages.insert(frontend_page("demo", 1, "nginx:1.20"));
    h.deployments.fail_writes(Some(FaultKind::Unavailable));
    h.pass("demo").await.unwrap();
    h.deployments.fail_writes(None);

    h.pass("demo").await.unwrap();
    h.mark_ready("demo", 1);
    h.pass("demo").await.unwrap();

    let status = h.status("demo");
    assert_eq!(status.phase, Some(FrontendPagePhase::Running));
    assert_eq!(status.message.as_deref(), Some("Deployment demo-deployment is ready"));
}

#[tokio::test]
async fn test_foreign_child_marks_page_failed() {
    let h = Harness::new();
    let mut other = frontend_page("other", 1, "nginx:1.20");
    other.metadata.uid = Some("other-uid".to_string());
    let mut squatter = build_deployment(&frontend_page("demo", 1, "nginx:1.20"));
    squatter.metadata.owner_references = Some(vec![owner_ref(&other)]);
    h.deployments.insert(squatter);
    h.pages.insert(frontend_page("demo", 1, "nginx:1.20"));

    assert_eq!(h.pass("demo").await.unwrap(), Action::Requeue(REQUEUE));
    let status = h.status("demo");
    assert_eq!(status.phase, Some(FrontendPagePhase::Failed));
    assert!(status.message.unwrap().contains("controlled by FrontendPage other"));
}

#[tokio::test]
async fn test_status_write_failure_is_retryable() {
    let h = Harness::new();
    h.pages.insert(frontend_page("demo", 1, "nginx:1.20"));
    h.pages.fail_writes(Some(FaultKind::Conflict));

    let err = h.pass("demo").await.unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(h.deployments.write_count(), 0);
}

#[tokio::test]
async fn test_observed_generation_follows_spec_changes() {
    let h = Harness::new();
    h.pages.insert(frontend_page("demo", 1, "nginx:1.20"));
    h.pass("demo").await.unwrap();
    assert_eq!(h.status("demo").observed_generation, Some(1));

    h.scale("demo", 2).await;
    h.pass("demo").await.unwrap();

    assert_eq!(h.page("demo").metadata.generation, Some(2));
    assert_eq!(h.status("demo").observed_generation, Some(2));
}

#[tokio::test]
async fn test_cancelled_pass_writes_no_children() {
    let h = Harness::new();
    h.pages.insert(frontend_page("demo", 1, "nginx:1.20"));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h
        .reconciler
        .reconcile(&ObjectKey::new(NAMESPACE, "demo"), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, ControllerError::Cancelled));
    assert_eq!(h.deployments.write_count(), 0);
}

#[tokio::test]
async fn test_demo_lifecycle() {
    let h = Harness::new();
    h.pages.insert(frontend_page("demo", 2, "nginx:1.21"));

    h.pass("demo").await.unwrap();
    let spec = h.deployment("demo").spec.unwrap();
    assert_eq!(spec.replicas, Some(2));
    let container = &spec.template.spec.unwrap().containers[0];
    assert_eq!(container.image.as_deref(), Some("nginx:1.21"));
    let service = h.services.object(NAMESPACE, "demo-service").unwrap();
    assert_eq!(service.spec.unwrap().ports.unwrap()[0].port, 80);

    h.clear_writes();
    h.scale("demo", 3).await;
    h.pass("demo").await.unwrap();
    assert_eq!(h.deployment("demo").spec.unwrap().replicas, Some(3));
    assert_eq!(h.deployments.writes_to("demo-deployment"), 1);
    assert_eq!(h.services.write_count(), 0);

    let uid = h.page("demo").metadata.uid.unwrap();
    h.pages.delete(NAMESPACE, "demo").await.unwrap();
    assert_eq!(h.pass("demo").await.unwrap(), Action::Done);
    // removal of the children is left to the garbage collector
    let refs = h.deployment("demo").metadata.owner_references.unwrap();
    assert_eq!(refs[0].uid, uid);
    let refs = h.services.object(NAMESPACE, "demo-service").unwrap().metadata.owner_references.unwrap();
    assert_eq!(refs[0].uid, uid);
}

fn initial_list(cache: &ResourceCache<FrontendPage>, pages: Vec<FrontendPage>) {
    cache.apply(watcher::Event::Init);
    for page in pages {
        cache.apply(watcher::Event::InitApply(page));
    }
    cache.apply(watcher::Event::InitDone);
}

#[tokio::test]
async fn test_unsynced_cache_is_retryable_without_writes() {
    let (h, _cache) = Harness::cached();
    h.pages.insert(frontend_page("demo", 2, "nginx:1.21"));

    let err = h.pass("demo").await.unwrap_err();

    assert!(matches!(err, ControllerError::Cluster(ClusterError::Unavailable(_))));
    assert!(err.is_retryable());
    assert_eq!(h.total_writes(), 0);
}

#[tokio::test]
async fn test_cached_page_converges_as_watch_events_arrive() {
    let (h, cache) = Harness::cached();
    h.pages.insert(frontend_page("demo", 2, "nginx:1.21"));
    initial_list(&cache, vec![h.page("demo")]);

    assert_eq!(h.pass("demo").await.unwrap(), Action::Requeue(REQUEUE));
    assert_eq!(h.status("demo").phase, Some(FrontendPagePhase::Pending));
    h.observe(&cache, "demo");
    h.mark_ready("demo", 2);

    assert_eq!(h.pass("demo").await.unwrap(), Action::Done);
    assert_eq!(h.status("demo").phase, Some(FrontendPagePhase::Running));
    h.observe(&cache, "demo");
    h.clear_writes();

    assert_eq!(h.pass("demo").await.unwrap(), Action::Done);
    assert_eq!(h.total_writes(), 0);
}

#[tokio::test]
async fn test_stale_cached_page_does_not_overwrite_newer_status() {
    let (h, cache) = Harness::cached();
    h.pages.insert(frontend_page("demo", 2, "nginx:1.21"));
    let before_status = h.page("demo");
    initial_list(&cache, vec![h.page("demo")]);
    h.pass("demo").await.unwrap();
    h.observe(&cache, "demo");
    h.mark_ready("demo", 2);
    h.pass("demo").await.unwrap();
    assert_eq!(h.status("demo").phase, Some(FrontendPagePhase::Running));

    // the watch has not yet delivered any of the status writes
    cache.apply(watcher::Event::Apply(before_status));
    h.clear_writes();

    let err = h.pass("demo").await.unwrap_err();

    assert!(matches!(err, ControllerError::Cluster(ClusterError::Conflict(_))));
    assert!(err.is_retryable());
    assert_eq!(h.total_writes(), 0);
    let status = h.status("demo");
    assert_eq!(status.phase, Some(FrontendPagePhase::Running));
    assert!(status.ready);

    h.observe(&cache, "demo");
    assert_eq!(h.pass("demo").await.unwrap(), Action::Done);
    assert_eq!(h.total_writes(), 0);
}
