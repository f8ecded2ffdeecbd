//! FrontendPage Controller
//!
//! Reconciles FrontendPage custom resources into an owned Deployment and
//! Service and reports progress in the FrontendPage status:
//! - FrontendPage: watched through a shared cache, the primary resource
//! - Deployment / Service: owned children, changes re-enqueue the owner
//! - Lease: only the elected instance runs reconcile workers
//!
//! Caches, probes and metrics run on every replica so a new leader starts warm.

mod backoff;
mod cache;
mod children;
mod config;
mod engine;
mod error;
mod handlers;
mod leader;
mod manager;
mod metrics;
mod probes;
mod queue;
mod reconciler;
mod resources;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::cache::{CacheOptions, CacheStatus, ResourceCache};
use crate::children::ChildResourceManager;
use crate::config::{ControllerConfig, LogFormat};
use crate::engine::Reconcile;
use crate::error::ControllerError;
use crate::handlers::{EnqueueHandler, EventHandler, OwnerEnqueueHandler, QueueSlot};
use crate::leader::LeaderElector;
use crate::manager::ControllerManager;
use crate::metrics::Metrics;
use crate::reconciler::FrontendPageReconciler;
use cluster_client::{KubeResourceClient, ResourceReader};
use crds::FrontendPage;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::Service;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CONTROLLER_NAME: &str = "frontendpage";

fn init_tracing(config: &ControllerConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Cancels `cancel` on the first SIGTERM or SIGINT
fn shutdown_on_signal(cancel: CancellationToken) -> Result<(), ControllerError> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
        }
        cancel.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    // kube's rustls feature needs a process-wide crypto provider
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        eprintln!("rustls crypto provider already installed");
    }

    let config = Arc::new(ControllerConfig::load()?);
    init_tracing(&config);

    info!("Starting FrontendPage Controller");
    info!("Configuration:");
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Workers: {}", config.workers);
    info!("  Requeue after: {:?}", config.requeue_after);
    info!(
        "  Leader election: {}",
        if config.leader_election.enabled { config.leader_election.identity.as_str() } else { "disabled" }
    );

    let client = kube::Client::try_default().await?;
    let metrics = Arc::new(Metrics::new()?);
    let namespace = config.namespace.as_deref();
    let cache_options = CacheOptions {
        resync_period: config.resync_period,
        failure_threshold: config.watch_failure_threshold,
        ..CacheOptions::default()
    };

    let slot = Arc::new(QueueSlot::default());
    let pages = Arc::new(ResourceCache::<FrontendPage>::new("frontendpages", cache_options.clone()));
    pages.add_handler(Arc::new(
        EnqueueHandler::new(Arc::clone(&slot), config.events).with_generation_predicate(),
    ) as Arc<dyn EventHandler<FrontendPage>>);
    let owner_handler = Arc::new(OwnerEnqueueHandler::new(
        Arc::clone(&slot),
        "FrontendPage",
        config.events.log_events,
    ));
    let deployments = Arc::new(ResourceCache::<Deployment>::new("deployments", cache_options.clone()));
    deployments.add_handler(Arc::clone(&owner_handler) as Arc<dyn EventHandler<Deployment>>);
    let services = Arc::new(ResourceCache::<Service>::new("services", cache_options));
    services.add_handler(owner_handler as Arc<dyn EventHandler<Service>>);

    let reconciler = FrontendPageReconciler::new(
        Arc::clone(&pages) as Arc<dyn ResourceReader<FrontendPage>>,
        Arc::new(KubeResourceClient::<FrontendPage>::new(client.clone(), config.request_timeout)),
        ChildResourceManager::new(
            Arc::new(KubeResourceClient::<Deployment>::new(client.clone(), config.request_timeout)),
            config.diff_policy,
        ),
        ChildResourceManager::new(
            Arc::new(KubeResourceClient::<Service>::new(client.clone(), config.request_timeout)),
            config.diff_policy,
        ),
        config.requeue_after,
    );

    let mut manager = ControllerManager::new(Arc::clone(&config), Arc::clone(&metrics));
    manager.add_cache(
        Arc::clone(&pages),
        watcher::watch(watcher::scoped_api::<FrontendPage>(client.clone(), namespace), watcher::page_watch_config()),
    );
    manager.add_cache(
        deployments,
        watcher::watch(watcher::scoped_api::<Deployment>(client.clone(), namespace), watcher::child_watch_config()),
    );
    manager.add_cache(
        services,
        watcher::watch(watcher::scoped_api::<Service>(client.clone(), namespace), watcher::child_watch_config()),
    );
    manager.add_controller(
        CONTROLLER_NAME,
        Arc::new(reconciler) as Arc<dyn Reconcile>,
        slot,
        pages as Arc<dyn CacheStatus>,
    );
    if config.leader_election.enabled {
        let leases = KubeResourceClient::<Lease>::new(client, config.request_timeout);
        manager = manager.with_leader_election(LeaderElector::new(
            Arc::new(leases),
            config.leader_election.clone(),
            Arc::clone(&metrics),
        ));
    }

    let cancel = CancellationToken::new();
    shutdown_on_signal(cancel.clone())?;
    manager.run(cancel).await?;

    info!("Shutdown complete");
    Ok(())
}
