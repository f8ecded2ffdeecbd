//! Cluster API Client
//!
//! A small capability interface over the Kubernetes API used by the
//! FrontendPage controller: `get`, `create`, `replace`, `delete`,
//! and `patch_status` for one namespaced resource type.
//!
//! # Example
//!
//! ```no_run
//! use cluster_client::{KubeResourceClient, ResourceClient, ResourceReader};
//! use k8s_openapi::api::apps::v1::Deployment;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let deployments = KubeResourceClient::<Deployment>::new(client, Duration::from_secs(30));
//!
//! if let Some(deployment) = deployments.get("default", "demo-deployment").await? {
//!     println!("found {:?}", deployment.metadata.name);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Reconcilers depend on the traits only, so tests can substitute the
//! in-memory [`MockResourceClient`] (feature `test-util`).

pub mod client;
pub mod error;
pub mod key;
#[path = "trait.rs"]
pub mod client_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::KubeResourceClient;
pub use client_trait::{ResourceClient, ResourceReader};
pub use error::ClusterError;
pub use key::ObjectKey;
#[cfg(any(test, feature = "test-util"))]
pub use mock::{FaultKind, MockResourceClient, WriteCall};
