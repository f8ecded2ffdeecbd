//! Controller configuration.
//!
//! Built once at startup from defaults, an optional YAML file named by
//! `CONTROLLER_CONFIG`, and environment variables (highest precedence),
//! then validated and shared read-only with every component.

use crate::children::DiffPolicy;
use crate::error::ControllerError;
use serde::Deserialize;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    Text,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

/// Which cache events turn into work items
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventFilter {
    /// Log every add/update/delete at debug level
    pub log_events: bool,
    /// Enqueue on update events
    pub handle_updates: bool,
    /// Enqueue on delete events
    pub handle_deletes: bool,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self { log_events: true, handle_updates: true, handle_deletes: true }
    }
}

/// Lease-based leader election settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderElectionConfig {
    /// Run the elector at all; when false every instance reconciles
    pub enabled: bool,
    /// Lease object name
    pub lease_name: String,
    /// Lease object namespace
    pub lease_namespace: String,
    /// Holder identity written into the lease
    pub identity: String,
    /// How long a lease is valid after its last renewal
    pub lease_duration: Duration,
    /// Give up leadership if renewal has not succeeded for this long
    pub renew_deadline: Duration,
    /// Interval between acquire attempts and between renewals
    pub retry_period: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            enabled: true,
            lease_name: "k8s-cli-manager".to_string(),
            lease_namespace: "default".to_string(),
            identity: format!("frontendpage-controller-{}", &suffix[..8]),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

/// Complete controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace to watch, `None` for all namespaces
    pub namespace: Option<String>,
    /// Worker tasks per reconcile engine
    pub workers: usize,
    /// Period of full cache resyncs
    pub resync_period: Duration,
    /// Fixed requeue delay for not-ready pages and failed child writes
    pub requeue_after: Duration,
    /// First rate-limited retry delay
    pub backoff_base: Duration,
    /// Cap for rate-limited retry delays
    pub backoff_max: Duration,
    /// Timeout applied to every cluster API request
    pub request_timeout: Duration,
    /// How long engines may drain before in-flight reconciles are cancelled
    pub shutdown_grace: Duration,
    /// Consecutive watch failures before readiness reports not-ready
    pub watch_failure_threshold: u32,
    /// Event handling options
    pub events: EventFilter,
    /// Bind address of the metrics endpoint
    pub metrics_addr: SocketAddr,
    /// Bind address of the health and readiness endpoints
    pub health_addr: SocketAddr,
    /// Leader election
    pub leader_election: LeaderElectionConfig,
    /// Fields compared when deciding whether a child needs an update
    pub diff_policy: DiffPolicy,
    /// Default tracing level when `RUST_LOG` is unset
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            workers: 2,
            resync_period: Duration::from_secs(30),
            requeue_after: Duration::from_secs(30),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            request_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(4),
            watch_failure_threshold: 5,
            events: EventFilter::default(),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            leader_election: LeaderElectionConfig::default(),
            diff_policy: DiffPolicy::default(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

/// On-disk configuration; every field optional
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FileConfig {
    namespace: Option<String>,
    workers: Option<usize>,
    resync_period_seconds: Option<u64>,
    requeue_after_seconds: Option<u64>,
    backoff_base_millis: Option<u64>,
    backoff_max_seconds: Option<u64>,
    request_timeout_seconds: Option<u64>,
    shutdown_grace_seconds: Option<u64>,
    watch_failure_threshold: Option<u32>,
    log_events: Option<bool>,
    handle_updates: Option<bool>,
    handle_deletes: Option<bool>,
    metrics_addr: Option<SocketAddr>,
    health_addr: Option<SocketAddr>,
    log_level: Option<String>,
    log_format: Option<LogFormat>,
    #[serde(default)]
    leader_election: FileLeaderElection,
    #[serde(default)]
    diff: FileDiffPolicy,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FileLeaderElection {
    enabled: Option<bool>,
    lease_name: Option<String>,
    lease_namespace: Option<String>,
    identity: Option<String>,
    lease_duration_seconds: Option<u64>,
    renew_deadline_seconds: Option<u64>,
    retry_period_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FileDiffPolicy {
    replicas: Option<bool>,
    image: Option<bool>,
    template: Option<bool>,
    env: Option<bool>,
    ports: Option<bool>,
}

fn parse<T>(key: &str, value: &str) -> Result<T, ControllerError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ControllerError::InvalidConfig(format!("{key}={value:?}: {e}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ControllerError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ControllerError::InvalidConfig(format!("{key}={value:?}: expected a boolean"))),
    }
}

impl ControllerConfig {
    /// Loads configuration from the process environment
    pub fn load() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, which maps variable names to values
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(path) = lookup("CONTROLLER_CONFIG") {
            let text = std::fs::read_to_string(&path).map_err(|e| {
                ControllerError::InvalidConfig(format!("cannot read config file {path}: {e}"))
            })?;
            config.apply_yaml(&text)?;
        }
        config.apply_env(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlays settings from a YAML document
    pub fn apply_yaml(&mut self, text: &str) -> Result<(), ControllerError> {
        let file: FileConfig = serde_yaml::from_str(text)
            .map_err(|e| ControllerError::InvalidConfig(format!("config file: {e}")))?;

        let secs = Duration::from_secs;
        if file.namespace.is_some() {
            self.namespace = file.namespace;
        }
        self.workers = file.workers.unwrap_or(self.workers);
        self.resync_period = file.resync_period_seconds.map_or(self.resync_period, secs);
        self.requeue_after = file.requeue_after_seconds.map_or(self.requeue_after, secs);
        self.backoff_base = file.backoff_base_millis.map_or(self.backoff_base, Duration::from_millis);
        self.backoff_max = file.backoff_max_seconds.map_or(self.backoff_max, secs);
        self.request_timeout = file.request_timeout_seconds.map_or(self.request_timeout, secs);
        self.shutdown_grace = file.shutdown_grace_seconds.map_or(self.shutdown_grace, secs);
        self.watch_failure_threshold =
            file.watch_failure_threshold.unwrap_or(self.watch_failure_threshold);
        self.events.log_events = file.log_events.unwrap_or(self.events.log_events);
        self.events.handle_updates = file.handle_updates.unwrap_or(self.events.handle_updates);
        self.events.handle_deletes = file.handle_deletes.unwrap_or(self.events.handle_deletes);
        self.metrics_addr = file.metrics_addr.unwrap_or(self.metrics_addr);
        self.health_addr = file.health_addr.unwrap_or(self.health_addr);
        if let Some(level) = file.log_level {
            self.log_level = level;
        }
        self.log_format = file.log_format.unwrap_or(self.log_format);

        let le = file.leader_election;
        let current = &mut self.leader_election;
        current.enabled = le.enabled.unwrap_or(current.enabled);
        if let Some(name) = le.lease_name {
            current.lease_name = name;
        }
        if let Some(ns) = le.lease_namespace {
            current.lease_namespace = ns;
        }
        if let Some(identity) = le.identity {
            current.identity = identity;
        }
        current.lease_duration = le.lease_duration_seconds.map_or(current.lease_duration, secs);
        current.renew_deadline = le.renew_deadline_seconds.map_or(current.renew_deadline, secs);
        current.retry_period = le.retry_period_seconds.map_or(current.retry_period, secs);

        let diff = file.diff;
        let policy = &mut self.diff_policy;
        policy.replicas = diff.replicas.unwrap_or(policy.replicas);
        policy.image = diff.image.unwrap_or(policy.image);
        policy.template = diff.template.unwrap_or(policy.template);
        policy.env = diff.env.unwrap_or(policy.env);
        policy.ports = diff.ports.unwrap_or(policy.ports);
        Ok(())
    }

    fn apply_env<F>(&mut self, lookup: &F) -> Result<(), ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let secs = |key: &str, current: Duration| -> Result<Duration, ControllerError> {
            get(key).map_or(Ok(current), |v| parse(key, &v).map(Duration::from_secs))
        };
        let flag = |key: &str, current: bool| -> Result<bool, ControllerError> {
            get(key).map_or(Ok(current), |v| parse_bool(key, &v))
        };

        if let Some(ns) = get("WATCH_NAMESPACE") {
            self.namespace = Some(ns);
        }
        if let Some(v) = get("WORKERS") {
            self.workers = parse("WORKERS", &v)?;
        }
        self.resync_period = secs("RESYNC_PERIOD_SECONDS", self.resync_period)?;
        self.requeue_after = secs("REQUEUE_AFTER_SECONDS", self.requeue_after)?;
        if let Some(v) = get("BACKOFF_BASE_MILLIS") {
            self.backoff_base = Duration::from_millis(parse("BACKOFF_BASE_MILLIS", &v)?);
        }
        self.backoff_max = secs("BACKOFF_MAX_SECONDS", self.backoff_max)?;
        self.request_timeout = secs("REQUEST_TIMEOUT_SECONDS", self.request_timeout)?;
        self.shutdown_grace = secs("SHUTDOWN_GRACE_SECONDS", self.shutdown_grace)?;
        if let Some(v) = get("WATCH_FAILURE_THRESHOLD") {
            self.watch_failure_threshold = parse("WATCH_FAILURE_THRESHOLD", &v)?;
        }
        self.events.log_events = flag("LOG_EVENTS", self.events.log_events)?;
        self.events.handle_updates = flag("HANDLE_UPDATES", self.events.handle_updates)?;
        self.events.handle_deletes = flag("HANDLE_DELETES", self.events.handle_deletes)?;
        if let Some(v) = get("METRICS_ADDR") {
            self.metrics_addr = parse("METRICS_ADDR", &v)?;
        }
        if let Some(v) = get("HEALTH_ADDR") {
            self.health_addr = parse("HEALTH_ADDR", &v)?;
        }
        if let Some(level) = get("LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(v) = get("LOG_FORMAT") {
            self.log_format = parse("LOG_FORMAT", &v)?;
        }

        let le = &mut self.leader_election;
        le.enabled = flag("ENABLE_LEADER_ELECTION", le.enabled)?;
        if let Some(name) = get("LEADER_ELECTION_ID") {
            le.lease_name = name;
        }
        if let Some(ns) = get("LEASE_NAMESPACE").or_else(|| get("POD_NAMESPACE")) {
            le.lease_namespace = ns;
        }
        if let Some(identity) = get("POD_NAME") {
            le.identity = identity;
        } else if let Some(host) = get("HOSTNAME") {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            le.identity = format!("{host}-{}", &suffix[..8]);
        }
        le.lease_duration = secs("LEASE_DURATION_SECONDS", le.lease_duration)?;
        le.renew_deadline = secs("RENEW_DEADLINE_SECONDS", le.renew_deadline)?;
        le.retry_period = secs("RETRY_PERIOD_SECONDS", le.retry_period)?;

        let policy = &mut self.diff_policy;
        policy.replicas = flag("DIFF_REPLICAS", policy.replicas)?;
        policy.image = flag("DIFF_IMAGE", policy.image)?;
        policy.template = flag("DIFF_TEMPLATE", policy.template)?;
        policy.env = flag("DIFF_ENV", policy.env)?;
        policy.ports = flag("DIFF_PORTS", policy.ports)?;
        Ok(())
    }

    /// Checks cross-field constraints
    pub fn validate(&self) -> Result<(), ControllerError> {
        let invalid = |msg: String| Err(ControllerError::InvalidConfig(msg));
        if self.workers == 0 {
            return invalid("workers must be at least 1".to_string());
        }
        if self.backoff_base > self.backoff_max {
            return invalid("backoff base must not exceed backoff max".to_string());
        }
        if self.resync_period.is_zero() || self.request_timeout.is_zero() {
            return invalid("resync period and request timeout must be positive".to_string());
        }

        let le = &self.leader_election;
        if !le.enabled {
            return Ok(());
        }
        if le.lease_name.is_empty() || le.identity.is_empty() {
            return invalid("lease name and identity must be set".to_string());
        }
        if le.lease_duration.as_secs() == 0 {
            return invalid("lease duration must be at least one second".to_string());
        }
        if le.renew_deadline >= le.lease_duration {
            return invalid(format!(
                "renew deadline {:?} must be shorter than lease duration {:?}",
                le.renew_deadline, le.lease_duration
            ));
        }
        if le.retry_period >= le.renew_deadline {
            return invalid(format!(
                "retry period {:?} must be shorter than renew deadline {:?}",
                le.retry_period, le.renew_deadline
            ));
        }
        let margin = le.lease_duration - le.renew_deadline;
        if self.shutdown_grace >= margin {
            return invalid(format!(
                "shutdown grace {:?} must be shorter than lease duration minus renew deadline ({margin:?})",
                self.shutdown_grace
            ));
        }
        Ok(())
    }
}
