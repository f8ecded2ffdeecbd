//! Object identity keys

use kube::Resource;
use std::fmt;
use std::str::FromStr;

/// `namespace/name` identity of a namespaced object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Builds a key from its parts
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Key of `obj`, or `None` when it has no name or namespace
    pub fn from_resource<K: Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        Some(Self::new(meta.namespace.clone()?, meta.name.clone()?))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Error returned when parsing a malformed `namespace/name` key
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid object key {0:?}, expected namespace/name")]
pub struct InvalidKey(pub String);

impl FromStr for ObjectKey {
    type Err = InvalidKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(InvalidKey(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;
    use kube::api::ObjectMeta;

    #[test]
    fn test_parse_and_display() {
        let key: ObjectKey = "web/demo".parse().unwrap();
        assert_eq!(key, ObjectKey::new("web", "demo"));
        assert_eq!(key.to_string(), "web/demo");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("demo".parse::<ObjectKey>().is_err());
        assert!("/demo".parse::<ObjectKey>().is_err());
        assert!("a/b/c".parse::<ObjectKey>().is_err());
    }

    #[test]
    fn test_from_resource_requires_namespace() {
        let mut svc = Service {
            metadata: ObjectMeta { name: Some("demo-service".into()), ..Default::default() },
            ..Default::default()
        };
        assert!(ObjectKey::from_resource(&svc).is_none());

        svc.metadata.namespace = Some("web".into());
        assert_eq!(ObjectKey::from_resource(&svc), Some(ObjectKey::new("web", "demo-service")));
    }
}
