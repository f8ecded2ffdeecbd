//! Leader election using Kubernetes Leases
//!
//! Only the lease holder runs reconcile engines. The lease is a
//! coordination.k8s.io/v1 Lease written with resourceVersion
//! compare-and-swap: if the lease changes between read and write the
//! write fails with 409 Conflict and the attempt counts as lost.
//!
//! The elector fails closed. A holder that has not confirmed renewal
//! within the renew deadline stops leading even if nobody else has taken
//! the lease, and `on_stop` returns before it tries to acquire again.

use crate::config::LeaderElectionConfig;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use chrono::{DateTime, SecondsFormat, Utc};
use cluster_client::{ClusterError, ResourceClient};
use futures::FutureExt;
use futures::future::FusedFuture;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn micro_time(at: DateTime<Utc>) -> Result<MicroTime, ClusterError> {
    Ok(serde_json::from_value(Value::String(at.to_rfc3339_opts(SecondsFormat::Micros, true)))?)
}

fn parse_micro_time(time: &MicroTime) -> Option<DateTime<Utc>> {
    let Value::String(text) = serde_json::to_value(time).ok()? else {
        return None;
    };
    DateTime::parse_from_rfc3339(&text).ok().map(|t| t.with_timezone(&Utc))
}

fn lease_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    if spec.holder_identity.as_deref().is_none_or(str::is_empty) {
        return true;
    }
    let renewed = spec.renew_time.as_ref().and_then(parse_micro_time);
    match (renewed, spec.lease_duration_seconds) {
        (Some(renewed), Some(secs)) => now > renewed + chrono::Duration::seconds(i64::from(secs)),
        _ => true,
    }
}

/// Why a leadership term ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TermEnd {
    Shutdown,
    LeaseLost,
    DeadlineExceeded,
    WorkExited,
}

/// Lease-based leader elector
pub struct LeaderElector {
    leases: Arc<dyn ResourceClient<Lease>>,
    config: LeaderElectionConfig,
    is_leader: AtomicBool,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("identity", &self.config.identity)
            .field("lease", &self.config.lease_name)
            .field("is_leader", &self.is_leader())
            .finish_non_exhaustive()
    }
}

impl LeaderElector {
    /// Creates an elector competing for `config.lease_name`
    #[must_use]
    pub fn new(
        leases: Arc<dyn ResourceClient<Lease>>,
        config: LeaderElectionConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { leases, config, is_leader: AtomicBool::new(false), metrics }
    }

    /// Whether this instance currently leads
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    fn set_leader(&self, leading: bool) {
        self.is_leader.store(leading, Ordering::SeqCst);
        self.metrics.set_leader(leading);
    }

    fn lease_seconds(&self) -> i32 {
        i32::try_from(self.config.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }

    fn held_spec(
        &self,
        now: DateTime<Utc>,
        acquired: Option<MicroTime>,
        transitions: i32,
    ) -> Result<LeaseSpec, ClusterError> {
        Ok(LeaseSpec {
            holder_identity: Some(self.config.identity.clone()),
            lease_duration_seconds: Some(self.lease_seconds()),
            acquire_time: Some(match acquired {
                Some(at) => at,
                None => micro_time(now)?,
            }),
            renew_time: Some(micro_time(now)?),
            lease_transitions: Some(transitions),
            ..Default::default()
        })
    }

    /// Try to acquire or renew the lease atomically
    ///
    /// `Ok(false)` means someone else holds a valid lease or won the race.
    async fn try_acquire_or_renew(&self) -> Result<bool, ClusterError> {
        let namespace = &self.config.lease_namespace;
        let now = Utc::now();

        let Some(lease) = self.leases.get(namespace, &self.config.lease_name).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.config.lease_name.clone()),
                    namespace: Some(namespace.clone()),
                    ..Default::default()
                },
                spec: Some(self.held_spec(now, None, 0)?),
            };
            return match self.leases.create(&lease).await {
                Ok(_) => {
                    info!(identity = %self.config.identity, lease = %self.config.lease_name, "created lease");
                    Ok(true)
                }
                Err(ClusterError::AlreadyExists(_) | ClusterError::Conflict(_)) => {
                    debug!(identity = %self.config.identity, "lease creation conflict, will retry");
                    Ok(false)
                }
                Err(err) => Err(err),
            };
        };

        let spec = lease.spec.clone().unwrap_or_default();
        let holder = spec.holder_identity.as_deref();
        let transitions = spec.lease_transitions.unwrap_or(0);
        let renewing = holder == Some(self.config.identity.as_str());
        if !renewing && !lease_expired(&spec, now) {
            debug!(identity = %self.config.identity, holder = ?holder, "lease held by another");
            return Ok(false);
        }

        let mut updated = lease.clone();
        updated.spec = Some(if renewing {
            self.held_spec(now, spec.acquire_time.clone(), transitions)?
        } else {
            self.held_spec(now, None, transitions + 1)?
        });

        match self.leases.replace(&updated).await {
            Ok(_) if renewing => {
                debug!(identity = %self.config.identity, "lease renewed");
                Ok(true)
            }
            Ok(_) => {
                info!(identity = %self.config.identity, transitions = transitions + 1, previous = ?holder, "took over lease");
                Ok(true)
            }
            Err(ClusterError::Conflict(_)) => {
                debug!(identity = %self.config.identity, "lease changed concurrently");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Clears the holder so a successor can acquire without waiting for expiry
    async fn release(&self) -> Result<(), ClusterError> {
        let namespace = &self.config.lease_namespace;
        let Some(mut lease) = self.leases.get(namespace, &self.config.lease_name).await? else {
            return Ok(());
        };
        let Some(spec) = lease.spec.as_mut() else {
            return Ok(());
        };
        if spec.holder_identity.as_deref() != Some(self.config.identity.as_str()) {
            debug!(identity = %self.config.identity, "not the lease holder, nothing to release");
            return Ok(());
        }
        spec.holder_identity = None;
        spec.renew_time = None;
        self.leases.replace(&lease).await?;
        info!(identity = %self.config.identity, "lease released");
        Ok(())
    }

    /// One acquire-or-renew attempt bounded by `budget`.
    ///
    /// On success returns the instant the attempt started. The lease's
    /// renew time is stamped before the request is sent, so the holder's
    /// own deadline must count from the same point, not from the response.
    async fn attempt(&self, budget: Duration) -> Result<Option<Instant>, ClusterError> {
        let started = Instant::now();
        match tokio::time::timeout(budget, self.try_acquire_or_renew()).await {
            Ok(Ok(true)) => Ok(Some(started)),
            Ok(Ok(false)) => Ok(None),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ClusterError::Timeout(format!(
                "lease {} not confirmed within {budget:?}",
                self.config.lease_name
            ))),
        }
    }

    /// Blocks until the lease is held; `None` if `cancel` fired first.
    ///
    /// Returns the instant the successful attempt started.
    async fn acquire(&self, cancel: &CancellationToken) -> Option<Instant> {
        info!(identity = %self.config.identity, lease = %self.config.lease_name, "waiting for leadership");
        loop {
            match self.attempt(self.config.renew_deadline).await {
                Ok(Some(started)) => return Some(started),
                Ok(None) => {}
                Err(err) => warn!(identity = %self.config.identity, error = %err, "failed to acquire lease, retrying"),
            }
            tokio::select! {
                () = cancel.cancelled() => return None,
                () = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Renews every retry period until the term has to end.
    ///
    /// `confirmed` is the start of the attempt that last confirmed the lease.
    async fn hold(&self, cancel: &CancellationToken, confirmed: Instant) -> TermEnd {
        let mut last_renewal = confirmed;
        loop {
            let deadline = last_renewal + self.config.renew_deadline;
            let next = (Instant::now() + self.config.retry_period).min(deadline);
            tokio::select! {
                () = cancel.cancelled() => return TermEnd::Shutdown,
                () = tokio::time::sleep_until(next) => {}
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return TermEnd::DeadlineExceeded;
            }
            match self.attempt(remaining).await {
                Ok(Some(started)) => last_renewal = started,
                Ok(None) => return TermEnd::LeaseLost,
                Err(err) => warn!(identity = %self.config.identity, error = %err, "lease renewal failed"),
            }
        }
    }

    /// Runs leadership terms until `cancel` fires.
    ///
    /// Each term calls `on_start` once with a token that is cancelled when
    /// the term ends; the returned future is awaited to completion before
    /// `on_stop` runs. Only then is the lease contested again. On shutdown
    /// the lease is released.
    pub async fn run<S, F, T>(
        &self,
        cancel: CancellationToken,
        mut on_start: S,
        mut on_stop: T,
    ) -> Result<(), ControllerError>
    where
        S: FnMut(CancellationToken) -> F,
        F: Future<Output = ()>,
        T: FnMut(),
    {
        while let Some(confirmed) = self.acquire(&cancel).await {
            self.set_leader(true);
            info!(identity = %self.config.identity, "leadership acquired");

            let term = cancel.child_token();
            let work = on_start(term.clone()).fuse();
            tokio::pin!(work);
            let end = tokio::select! {
                end = self.hold(&cancel, confirmed) => end,
                () = &mut work => TermEnd::WorkExited,
            };

            term.cancel();
            if !work.is_terminated() {
                work.await;
            }
            self.set_leader(false);
            on_stop();

            match end {
                TermEnd::Shutdown => info!(identity = %self.config.identity, "leadership ended by shutdown"),
                TermEnd::WorkExited if cancel.is_cancelled() => {}
                other => warn!(identity = %self.config.identity, reason = ?other, "leadership lost"),
            }
            if cancel.is_cancelled() {
                break;
            }
        }

        if let Err(err) = self.release().await {
            warn!(identity = %self.config.identity, error = %err, "failed to release lease");
        }
        Ok(())
    }
}
