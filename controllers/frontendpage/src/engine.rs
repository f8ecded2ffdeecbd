//! Generic reconcile engine.
//!
//! Runs N worker tasks that pull keys from a [`WorkQueue`], call a
//! [`Reconcile`] implementation and report the outcome back to the queue:
//!
//! - `Ok(Action::Done)`: backoff history cleared
//! - `Ok(Action::Requeue(d))`: backoff cleared, key re-added after `d`
//! - not-found error: the object is gone, treated as success
//! - retryable error: key re-added with per-key exponential backoff
//! - other errors: logged, key re-added after the maximum backoff delay

use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::queue::WorkQueue;
use cluster_client::ObjectKey;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of a successful reconcile pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Converged; wait for the next event
    Done,
    /// Look again after the given delay
    Requeue(Duration),
}

impl Action {
    /// Requeue after `delay`
    #[must_use]
    pub fn requeue(delay: Duration) -> Self {
        Self::Requeue(delay)
    }
}

/// A reconcile function for one resource kind.
///
/// Implementations must be idempotent: running twice against the same
/// observed state must produce no additional writes and no error.
#[async_trait::async_trait]
pub trait Reconcile: Send + Sync + 'static {
    /// Drives the object identified by `key` toward its desired state.
    ///
    /// `cancel` fires when the engine gives up waiting for in-flight work.
    async fn reconcile(
        &self,
        key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> Result<Action, ControllerError>;
}

/// Running set of workers for one controller
#[derive(Debug)]
pub struct Engine {
    name: String,
    queue: Arc<WorkQueue<ObjectKey>>,
    workers: Vec<JoinHandle<()>>,
    abort: CancellationToken,
    metrics: Arc<Metrics>,
}

impl Engine {
    /// Spawns `workers` tasks pulling from `queue`
    pub fn start<R: Reconcile + ?Sized>(
        name: &str,
        reconciler: Arc<R>,
        queue: Arc<WorkQueue<ObjectKey>>,
        workers: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        let abort = CancellationToken::new();
        let handles = (0..workers)
            .map(|id| {
                let ctx = WorkerContext {
                    controller: name.to_string(),
                    id,
                    reconciler: Arc::clone(&reconciler),
                    queue: Arc::clone(&queue),
                    abort: abort.clone(),
                    metrics: Arc::clone(&metrics),
                };
                tokio::spawn(ctx.run())
            })
            .collect();
        metrics.set_workers(name, workers);
        info!(controller = name, workers, "engine started");
        Self { name: name.to_string(), queue, workers: handles, abort, metrics }
    }

    /// Queue the workers pull from
    #[cfg(test)]
    pub fn queue(&self) -> &Arc<WorkQueue<ObjectKey>> {
        &self.queue
    }

    /// Shuts the queue down and waits for workers to exit.
    ///
    /// Pending keys are discarded. In-flight reconciles get `grace` to
    /// finish before their cancellation token fires.
    pub async fn stop(mut self, grace: Duration) {
        self.queue.shut_down_now();
        let workers = futures::future::join_all(self.workers.drain(..));
        tokio::pin!(workers);
        let results = if let Ok(results) = tokio::time::timeout(grace, &mut workers).await {
            results
        } else {
            warn!(controller = %self.name, ?grace, "in-flight reconciles exceeded grace period, cancelling");
            self.abort.cancel();
            workers.await
        };
        for result in results {
            if let Err(err) = result {
                error!(controller = %self.name, error = %err, "worker task failed");
            }
        }
        self.metrics.set_workers(&self.name, 0);
        self.metrics.set_queue_depth(&self.name, 0);
        info!(controller = %self.name, "engine stopped");
    }
}

struct WorkerContext<R: ?Sized> {
    controller: String,
    id: usize,
    reconciler: Arc<R>,
    queue: Arc<WorkQueue<ObjectKey>>,
    abort: CancellationToken,
    metrics: Arc<Metrics>,
}

impl<R: Reconcile + ?Sized> WorkerContext<R> {
    async fn run(self) {
        debug!(controller = %self.controller, worker = self.id, "worker started");
        while let Some(item) = self.queue.get().await {
            let key = item.key;
            debug!(controller = %self.controller, worker = self.id, key = %key, hint = item.hint.as_str(), "reconciling");
            let started = Instant::now();
            let result = tokio::select! {
                res = self.reconciler.reconcile(&key, &self.abort) => res,
                () = self.abort.cancelled() => Err(ControllerError::Cancelled),
            };
            let outcome = self.handle(&key, result);
            self.metrics.observe_reconcile(&self.controller, outcome, started.elapsed());
            self.queue.done(&key);
            self.metrics.set_queue_depth(&self.controller, self.queue.len());
        }
        debug!(controller = %self.controller, worker = self.id, "worker exited");
    }

    fn handle(&self, key: &ObjectKey, result: Result<Action, ControllerError>) -> &'static str {
        match result {
            Ok(Action::Done) => {
                self.queue.forget(key);
                "success"
            }
            Ok(Action::Requeue(delay)) => {
                self.queue.forget(key);
                self.queue.add_after(key.clone(), delay);
                "requeue"
            }
            Err(err) if err.is_not_found() => {
                debug!(controller = %self.controller, key = %key, "object gone, nothing to do");
                self.queue.forget(key);
                "success"
            }
            Err(ControllerError::Cancelled) => "cancelled",
            Err(err) if err.is_retryable() => {
                warn!(
                    controller = %self.controller,
                    key = %key,
                    error = %err,
                    retries = self.queue.num_requeues(key),
                    "reconcile failed, retrying with backoff"
                );
                self.queue.add_rate_limited(key.clone());
                "error"
            }
            Err(err) => {
                error!(
                    controller = %self.controller,
                    key = %key,
                    error = %err,
                    "reconcile failed, not retryable, retrying at maximum backoff"
                );
                self.queue.forget(key);
                self.queue.add_at_max_backoff(key.clone());
                "failed"
            }
        }
    }
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod engine_test;
