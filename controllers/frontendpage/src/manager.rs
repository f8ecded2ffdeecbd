//! Controller manager.
//!
//! Owns the process-lifetime pieces (caches, probe servers) and the
//! per-term pieces (work queues, engines). Caches run on every instance
//! so a new leader starts warm; engines only run while the lease is held.
//!
//! Term lifecycle:
//!
//! 1. wait for every cache to sync
//! 2. install a fresh queue into each controller's [`QueueSlot`] and
//!    enqueue every key of its primary cache
//! 3. start the engines
//! 4. on term end clear the slots and stop the engines within the grace period

use crate::cache::{CacheStatus, ResourceCache, wait_for_sync};
use crate::config::ControllerConfig;
use crate::engine::{Engine, Reconcile};
use crate::error::ControllerError;
use crate::handlers::QueueSlot;
use crate::leader::LeaderElector;
use crate::metrics::Metrics;
use crate::probes::{self, ProbeState};
use crate::queue::{EventKind, WorkQueue};
use crate::watcher::WatchItem;
use futures::Stream;
use futures::future::BoxFuture;
use kube::Resource;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

type WatchTask = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<(), ControllerError>> + Send>;

/// A reconcile engine registered with the manager
struct Registration {
    name: String,
    reconciler: Arc<dyn Reconcile>,
    slot: Arc<QueueSlot>,
    primary: Arc<dyn CacheStatus>,
}

/// Composes caches, engines, probes and leader election
pub struct ControllerManager {
    config: Arc<ControllerConfig>,
    metrics: Arc<Metrics>,
    caches: Vec<Arc<dyn CacheStatus>>,
    watches: Mutex<Vec<WatchTask>>,
    controllers: Vec<Registration>,
    elector: Option<LeaderElector>,
}

impl std::fmt::Debug for ControllerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerManager")
            .field("caches", &self.caches.iter().map(|c| c.name().to_string()).collect::<Vec<_>>())
            .field("controllers", &self.controllers.iter().map(|c| c.name.clone()).collect::<Vec<_>>())
            .field("leader_election", &self.elector.is_some())
            .finish_non_exhaustive()
    }
}

impl ControllerManager {
    /// Creates an empty manager
    #[must_use]
    pub fn new(config: Arc<ControllerConfig>, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            metrics,
            caches: Vec::new(),
            watches: Mutex::new(Vec::new()),
            controllers: Vec::new(),
            elector: None,
        }
    }

    /// Gates engines behind `elector`; without one every instance reconciles
    #[must_use]
    pub fn with_leader_election(mut self, elector: LeaderElector) -> Self {
        self.elector = Some(elector);
        self
    }

    /// Registers `cache`, to be fed from `stream` for the whole run
    pub fn add_cache<K, S>(&mut self, cache: Arc<ResourceCache<K>>, stream: S)
    where
        K: Resource + Clone + Send + Sync + 'static,
        S: Stream<Item = WatchItem<K>> + Send + 'static,
    {
        self.caches.push(Arc::clone(&cache) as Arc<dyn CacheStatus>);
        let task: WatchTask = Box::new(move |cancel| {
            Box::pin(async move { cache.run(stream, cancel).await })
        });
        self.watches.get_mut().unwrap_or_else(PoisonError::into_inner).push(task);
    }

    /// Registers an engine driven by `reconciler`.
    ///
    /// Cache handlers feed it through `slot`; each term starts by
    /// enqueueing every key held by `primary`.
    pub fn add_controller(
        &mut self,
        name: impl Into<String>,
        reconciler: Arc<dyn Reconcile>,
        slot: Arc<QueueSlot>,
        primary: Arc<dyn CacheStatus>,
    ) {
        self.controllers.push(Registration { name: name.into(), reconciler, slot, primary });
    }

    async fn wait_for_caches(&self, cancel: &CancellationToken) -> bool {
        for cache in &self.caches {
            if !wait_for_sync(cache.as_ref(), cancel).await {
                return false;
            }
        }
        true
    }

    /// One leadership term; returns once `term` fired and engines stopped
    async fn lead(&self, term: CancellationToken) {
        if !self.wait_for_caches(&term).await {
            return;
        }
        let mut engines = Vec::with_capacity(self.controllers.len());
        for controller in &self.controllers {
            let queue = Arc::new(WorkQueue::new(self.config.backoff_base, self.config.backoff_max));
            controller.slot.install(Arc::clone(&queue));
            let keys = controller.primary.keys();
            let resynced = keys.len();
            for key in keys {
                queue.add(key, EventKind::Update);
            }
            info!(controller = %controller.name, keys = resynced, "enqueued cached objects for new term");
            engines.push(Engine::start(
                &controller.name,
                Arc::clone(&controller.reconciler),
                queue,
                self.config.workers,
                Arc::clone(&self.metrics),
            ));
        }

        term.cancelled().await;

        for (controller, engine) in self.controllers.iter().zip(engines) {
            controller.slot.clear();
            engine.stop(self.config.shutdown_grace).await;
        }
    }

    fn on_stop(&self) {
        for controller in &self.controllers {
            controller.slot.clear();
        }
        info!("reconciliation stopped");
    }

    async fn leadership(&self, cancel: CancellationToken) -> Result<(), ControllerError> {
        match &self.elector {
            Some(elector) => elector.run(cancel, |term| self.lead(term), || self.on_stop()).await,
            None => {
                info!("leader election disabled, reconciling unconditionally");
                self.lead(cancel).await;
                self.on_stop();
                Ok(())
            }
        }
    }

    /// Runs until `cancel` fires or a cache fails terminally.
    ///
    /// A terminal cache failure stops the engines, releases the lease and
    /// is returned as the error.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ControllerError> {
        let inner = cancel.child_token();
        let mut tasks = JoinSet::new();
        let watches = std::mem::take(self.watches.get_mut().unwrap_or_else(PoisonError::into_inner));
        for watch in watches {
            tasks.spawn(watch(inner.clone()));
        }
        let state = ProbeState::new(self.caches.clone(), Arc::clone(&self.metrics));
        tasks.spawn(probes::serve_all(
            self.config.health_addr,
            self.config.metrics_addr,
            state,
            inner.clone(),
        ));
        info!(caches = self.caches.len(), controllers = self.controllers.len(), "controller manager started");

        let mut failure = None;
        let leadership = self.leadership(inner.clone());
        tokio::pin!(leadership);
        let outcome = loop {
            tokio::select! {
                res = &mut leadership => break res,
                Some(joined) = tasks.join_next(), if failure.is_none() => {
                    let err = match joined {
                        Ok(Ok(())) if inner.is_cancelled() => continue,
                        Ok(Ok(())) => ControllerError::Watch("background task exited unexpectedly".to_string()),
                        Ok(Err(err)) => err,
                        Err(join) => ControllerError::Watch(format!("background task panicked: {join}")),
                    };
                    error!(error = %err, "terminal failure, shutting down");
                    failure = Some(err);
                    inner.cancel();
                }
            }
        };

        inner.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Ok(Err(err)) = joined {
                warn!(error = %err, "background task failed during shutdown");
            }
        }
        info!("controller manager stopped");
        match failure {
            Some(err) => Err(err),
            None => outcome,
        }
    }
}
