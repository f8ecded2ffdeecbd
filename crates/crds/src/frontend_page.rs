//! FrontendPage CRD
//!
//! Declares a static frontend served by an owned Deployment and Service.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Image used when `spec.image` is empty
pub const DEFAULT_IMAGE: &str = "nginx:1.20";

/// Replica count used when `spec.replicas` is omitted or not positive
pub const DEFAULT_REPLICAS: i32 = 1;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "k8scli.dev",
    version = "v1",
    kind = "FrontendPage",
    plural = "frontendpages",
    shortname = "fp",
    namespaced,
    status = "FrontendPageStatus",
    printcolumn = r#"{"name":"Title","type":"string","jsonPath":".spec.title"}"#,
    printcolumn = r#"{"name":"Path","type":"string","jsonPath":".spec.path"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FrontendPageSpec {
    /// Page title, exported to the container as `FRONTEND_TITLE`
    pub title: String,

    /// Page description, exported as `FRONTEND_DESCRIPTION`
    pub description: String,

    /// URL path the page is served under, exported as `FRONTEND_PATH`
    pub path: String,

    /// Optional template name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    /// Extra environment entries for the frontend container
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,

    /// Desired replica count
    #[serde(default = "default_replicas")]
    #[schemars(range(min = 0))]
    pub replicas: i32,

    /// Container image
    #[serde(default = "default_image")]
    pub image: String,
}

fn default_replicas() -> i32 {
    DEFAULT_REPLICAS
}

fn default_image() -> String {
    DEFAULT_IMAGE.to_string()
}

impl FrontendPageSpec {
    /// Replica count after defaulting (`0` and negatives become `1`)
    #[must_use]
    pub fn effective_replicas(&self) -> i32 {
        if self.replicas > 0 { self.replicas } else { DEFAULT_REPLICAS }
    }

    /// Image after defaulting (blank becomes [`DEFAULT_IMAGE`])
    #[must_use]
    pub fn effective_image(&self) -> &str {
        let image = self.image.trim();
        if image.is_empty() { DEFAULT_IMAGE } else { image }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FrontendPageStatus {
    /// Lifecycle phase; absent until the controller first observes the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<FrontendPagePhase>,

    /// Whether every desired replica is ready
    #[serde(default)]
    pub ready: bool,

    /// In-cluster URL of the page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Name of the owned Deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_name: Option<String>,

    /// Name of the owned Service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    /// Time of the last status write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<chrono::DateTime<chrono::Utc>>,

    /// `metadata.generation` the status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Human readable detail for the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FrontendPageStatus {
    /// Compares two statuses ignoring `lastUpdated`.
    ///
    /// The timestamp changes on every write, so including it would turn
    /// every reconcile into a status write.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.last_updated = None;
        b.last_updated = None;
        a == b
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
/// FrontendPage lifecycle phase
///
/// Serializes as PascalCase ("Pending", "Running", "Failed") and also
/// accepts lowercase on read.
#[serde(rename_all = "PascalCase")]
pub enum FrontendPagePhase {
    /// Children requested, not all replicas ready
    #[serde(alias = "pending")]
    Pending,

    /// All replicas ready
    #[serde(alias = "running")]
    Running,

    /// A child write failed; retried after the requeue delay
    #[serde(alias = "failed")]
    Failed,
}

impl FrontendPagePhase {
    /// Wire representation of the phase
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for FrontendPagePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of the Deployment owned by the FrontendPage `owner`
#[must_use]
pub fn deployment_name(owner: &str) -> String {
    format!("{owner}-deployment")
}

/// Name of the Service owned by the FrontendPage `owner`
#[must_use]
pub fn service_name(owner: &str) -> String {
    format!("{owner}-service")
}

/// Stable in-cluster URL for a page served by `service` in `namespace`
#[must_use]
pub fn service_url(service: &str, namespace: &str, path: &str) -> String {
    let path = path.trim();
    if path.is_empty() || path.starts_with('/') {
        format!("http://{service}.{namespace}.svc.cluster.local{path}")
    } else {
        format!("http://{service}.{namespace}.svc.cluster.local/{path}")
    }
}
