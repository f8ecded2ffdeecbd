//! Desired child objects for a FrontendPage.

use crds::{FrontendPage, deployment_name, service_name};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;

/// Name of the serving container
pub const CONTAINER_NAME: &str = "frontend";

/// Port the container listens on and the Service exposes
pub const HTTP_PORT: i32 = 80;

/// Label carrying the owning FrontendPage name; child watches select on it
pub const OWNER_LABEL: &str = "frontendpage";

/// Labels shared by the selector, the pod template and both children
#[must_use]
pub fn selector_labels(page: &FrontendPage) -> BTreeMap<String, String> {
    let name = page.name_any();
    BTreeMap::from([("app".to_string(), name.clone()), (OWNER_LABEL.to_string(), name)])
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar { name: name.to_string(), value: Some(value.to_string()), ..Default::default() }
}

/// Container environment: fixed `FRONTEND_*` entries followed by `spec.config` in key order
#[must_use]
pub fn container_env(page: &FrontendPage) -> Vec<EnvVar> {
    let spec = &page.spec;
    let mut env = vec![
        env_var("FRONTEND_TITLE", &spec.title),
        env_var("FRONTEND_DESCRIPTION", &spec.description),
        env_var("FRONTEND_PATH", &spec.path),
    ];
    if let Some(template) = &spec.template {
        env.push(env_var("FRONTEND_TEMPLATE", template));
    }
    env.extend(spec.config.iter().map(|(k, v)| env_var(k, v)));
    env
}

fn child_meta(page: &FrontendPage, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: page.namespace(),
        labels: Some(selector_labels(page)),
        ..Default::default()
    }
}

/// Desired `<name>-deployment`, without owner reference
#[must_use]
pub fn build_deployment(page: &FrontendPage) -> Deployment {
    let labels = selector_labels(page);
    Deployment {
        metadata: child_meta(page, deployment_name(&page.name_any())),
        spec: Some(DeploymentSpec {
            replicas: Some(page.spec.effective_replicas()),
            selector: LabelSelector { match_labels: Some(labels.clone()), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: CONTAINER_NAME.to_string(),
                        image: Some(page.spec.effective_image().to_string()),
                        ports: Some(vec![ContainerPort {
                            container_port: HTTP_PORT,
                            name: Some("http".to_string()),
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        env: Some(container_env(page)),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Desired `<name>-service`, without owner reference
#[must_use]
pub fn build_service(page: &FrontendPage) -> Service {
    Service {
        metadata: child_meta(page, service_name(&page.name_any())),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector_labels(page)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: HTTP_PORT,
                target_port: Some(IntOrString::Int(HTTP_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::frontend_page;

    #[test]
    fn test_deployment_shape() {
        let mut page = frontend_page("demo", 2, "nginx:1.21");
        page.spec.config.insert("THEME".to_string(), "dark".to_string());
        let deployment = build_deployment(&page);

        assert_eq!(deployment.metadata.name.as_deref(), Some("demo-deployment"));
        assert_eq!(deployment.metadata.namespace.as_deref(), Some("default"));
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(spec.selector.match_labels, Some(selector_labels(&page)));

        let container = &spec.template.spec.unwrap().containers[0];
        assert_eq!(container.name, "frontend");
        assert_eq!(container.image.as_deref(), Some("nginx:1.21"));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 80);
        let env: Vec<_> = container.env.as_ref().unwrap().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(env, ["FRONTEND_TITLE", "FRONTEND_DESCRIPTION", "FRONTEND_PATH", "THEME"]);
    }

    #[test]
    fn test_deployment_applies_defaults() {
        let mut page = frontend_page("demo", 0, "");
        page.spec.template = Some("landing".to_string());
        let deployment = build_deployment(&page);
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        let container = &spec.template.spec.unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("nginx:1.20"));
        assert!(container.env.as_ref().unwrap().iter().any(|e| e.name == "FRONTEND_TEMPLATE"));
    }

    #[test]
    fn test_service_shape() {
        let page = frontend_page("demo", 1, "nginx:1.20");
        let service = build_service(&page);
        assert_eq!(service.metadata.name.as_deref(), Some("demo-service"));
        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(spec.selector, Some(selector_labels(&page)));
        let port = &spec.ports.unwrap()[0];
        assert_eq!(port.port, 80);
        assert_eq!(port.target_port, Some(IntOrString::Int(80)));
    }
}
