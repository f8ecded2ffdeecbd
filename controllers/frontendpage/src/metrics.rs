//! Prometheus metrics for the controller.

use crate::cache::CacheStatus;
use prometheus::{
    Encoder, Gauge, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

const PREFIX: &str = "frontendpage_controller";

/// Metric handles registered in one private registry
pub struct Metrics {
    registry: Registry,
    started: Instant,
    uptime_seconds: Gauge,
    cache_objects: IntGaugeVec,
    cache_synced: IntGaugeVec,
    watch_failures: IntGaugeVec,
    workers: IntGaugeVec,
    queue_depth: IntGaugeVec,
    reconcile_total: IntCounterVec,
    reconcile_duration: HistogramVec,
    leader: IntGauge,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics").field("started", &self.started).finish_non_exhaustive()
    }
}

impl Metrics {
    /// Creates and registers every metric
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let name = |suffix: &str| format!("{PREFIX}_{suffix}");

        let uptime_seconds = Gauge::with_opts(Opts::new(name("uptime_seconds"), "Seconds since process start"))?;
        let cache_objects = IntGaugeVec::new(
            Opts::new(name("cache_objects"), "Objects held per resource cache"),
            &["cache"],
        )?;
        let cache_synced = IntGaugeVec::new(
            Opts::new(name("cache_synced"), "Whether the cache completed its initial list"),
            &["cache"],
        )?;
        let watch_failures = IntGaugeVec::new(
            Opts::new(name("watch_failures"), "Watch stream failures since start"),
            &["cache"],
        )?;
        let workers = IntGaugeVec::new(
            Opts::new(name("workers"), "Running reconcile workers"),
            &["controller"],
        )?;
        let queue_depth = IntGaugeVec::new(
            Opts::new(name("queue_depth"), "Keys waiting in the work queue"),
            &["controller"],
        )?;
        let reconcile_total = IntCounterVec::new(
            Opts::new(name("reconcile_total"), "Reconcile passes by outcome"),
            &["controller", "result"],
        )?;
        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new(name("reconcile_duration_seconds"), "Reconcile pass latency"),
            &["controller"],
        )?;
        let leader = IntGauge::with_opts(Opts::new(name("leader"), "1 while this instance holds the lease"))?;

        registry.register(Box::new(uptime_seconds.clone()))?;
        registry.register(Box::new(cache_objects.clone()))?;
        registry.register(Box::new(cache_synced.clone()))?;
        registry.register(Box::new(watch_failures.clone()))?;
        registry.register(Box::new(workers.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(leader.clone()))?;

        Ok(Self {
            registry,
            started: Instant::now(),
            uptime_seconds,
            cache_objects,
            cache_synced,
            watch_failures,
            workers,
            queue_depth,
            reconcile_total,
            reconcile_duration,
            leader,
        })
    }

    /// Sets the worker gauge of `controller`
    pub fn set_workers(&self, controller: &str, workers: usize) {
        self.workers
            .with_label_values(&[controller])
            .set(i64::try_from(workers).unwrap_or(i64::MAX));
    }

    /// Sets the queue depth gauge of `controller`
    pub fn set_queue_depth(&self, controller: &str, depth: usize) {
        self.queue_depth
            .with_label_values(&[controller])
            .set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    /// Records one reconcile pass
    pub fn observe_reconcile(&self, controller: &str, result: &str, elapsed: Duration) {
        self.reconcile_total.with_label_values(&[controller, result]).inc();
        self.reconcile_duration
            .with_label_values(&[controller])
            .observe(elapsed.as_secs_f64());
    }

    /// Sets the leader gauge
    pub fn set_leader(&self, leading: bool) {
        self.leader.set(i64::from(leading));
    }

    /// Refreshes point-in-time gauges and renders the text exposition
    pub fn render(&self, caches: &[Arc<dyn CacheStatus>]) -> Result<String, prometheus::Error> {
        self.uptime_seconds.set(self.started.elapsed().as_secs_f64());
        for cache in caches {
            let label = [cache.name()];
            self.cache_objects
                .with_label_values(&label)
                .set(i64::try_from(cache.len()).unwrap_or(i64::MAX));
            self.cache_synced.with_label_values(&label).set(i64::from(cache.has_synced()));
            self.watch_failures
                .with_label_values(&label)
                .set(i64::try_from(cache.watch_failures()).unwrap_or(i64::MAX));
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
