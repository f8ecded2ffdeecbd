//! Test utilities for unit testing reconcilers
//!
//! This module provides helpers for creating test data and setting up test scenarios.

use crds::{FrontendPage, FrontendPageSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use std::collections::BTreeMap;

/// Namespace used by fixtures
pub const NAMESPACE: &str = "default";

/// Helper to create a FrontendPage in [`NAMESPACE`] without uid or status
pub fn frontend_page(name: &str, replicas: i32, image: &str) -> FrontendPage {
    let mut page = FrontendPage::new(
        name,
        FrontendPageSpec {
            title: format!("{name} title"),
            description: format!("{name} description"),
            path: format!("/{name}"),
            template: None,
            config: BTreeMap::new(),
            replicas,
            image: image.to_string(),
        },
    );
    page.metadata.namespace = Some(NAMESPACE.to_string());
    page
}

/// Helper to create a controller owner reference for `page`, which must carry a uid
pub fn owner_ref(page: &FrontendPage) -> OwnerReference {
    page.controller_owner_ref(&()).expect("fixture page has name and uid")
}
