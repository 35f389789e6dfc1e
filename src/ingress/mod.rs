//! # Ingress registry
//!
//! Every room's realtime stream is reachable through one shared ingress
//! document. Rooms only ever add their route; the document is never rebuilt
//! from scratch, so anything else in it (other hosts, annotations, TLS) must
//! survive a round trip.
//!
//! Writes go through an [`IngressStore`] that hands out a version with every
//! read and refuses a write whose expected version is stale. The
//! [`IngressRegistry`] serializes in-process callers and retries on a
//! conflicting external write.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use thiserror::Error;

use crate::manifest::{Descriptor, DescriptorKind, IngressRoute};

mod registry;
mod store;

pub use registry::{IngressRegistry, RouteChange, DEFAULT_CAS_ATTEMPTS};
pub use store::{FileIngressStore, IngressStore, IngressVersion, MemoryIngressStore};

/// Host whose rule carries the room routes
pub const DEFAULT_INGRESS_HOST: &str = "data.or-ecosystem.eu";

/// Path match type written for new routes
pub const ROUTE_PATH_TYPE: &str = "Prefix";

/// Object name used when the document carries no `metadata.name`
pub const FALLBACK_INGRESS_NAME: &str = "ingress";

#[derive(Error, Debug)]
pub enum IngressError {
    #[error("Ingress document has no rule for host '{host}'")]
    MissingHostRule { host: String },

    #[error("Ingress document is malformed: {0}")]
    Malformed(String),

    #[error("Ingress document changed underneath us (expected version {expected}, found {found})")]
    VersionMismatch { expected: String, found: String },

    #[error("Ingress document kept changing; gave up after {attempts} attempts")]
    Contended { attempts: u32 },

    #[error("Ingress I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ingress YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

// ============================================================================
// Document model
// ============================================================================
//
// Only the fields the registry reads or writes are typed. Everything else
// lands in the flattened `extra` maps and is written back unchanged.

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngressDocument {
    #[serde(rename = "apiVersion", default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub spec: IngressSpec,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngressSpec {
    #[serde(rename = "ingressClassName", default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<Value>,
    #[serde(default)]
    pub rules: Vec<IngressRule>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngressRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpRule>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpRule {
    #[serde(default)]
    pub paths: Vec<HttpPath>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpPath {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(rename = "pathType", default, skip_serializing_if = "Option::is_none")]
    pub path_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl HttpPath {
    /// The entry written for a room route
    pub fn for_route(route: &IngressRoute) -> Self {
        let backend = serde_yaml::to_value(ServiceBackend {
            service: BackendService {
                name: route.service.clone(),
                port: BackendPort {
                    number: route.port,
                },
            },
        })
        .unwrap_or(Value::Null);

        Self {
            path: Some(route.path.clone()),
            path_type: Some(ROUTE_PATH_TYPE.to_string()),
            backend: Some(backend),
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Serialize)]
struct ServiceBackend {
    service: BackendService,
}

#[derive(Serialize)]
struct BackendService {
    name: String,
    port: BackendPort,
}

#[derive(Serialize)]
struct BackendPort {
    number: u16,
}

impl IngressDocument {
    pub fn from_yaml(content: &str) -> Result<Self, IngressError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn to_yaml(&self) -> Result<String, IngressError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// A minimal document with one empty rule for `host`
    pub fn with_host(name: &str, host: &str) -> Self {
        let metadata = serde_yaml::to_value(BTreeMap::from([("name", name)]))
            .unwrap_or(Value::Null);
        Self {
            api_version: Some("networking.k8s.io/v1".to_string()),
            kind: Some("Ingress".to_string()),
            metadata: Some(metadata),
            spec: IngressSpec {
                rules: vec![IngressRule {
                    host: Some(host.to_string()),
                    http: Some(HttpRule::default()),
                    extra: BTreeMap::new(),
                }],
                ..Default::default()
            },
            extra: BTreeMap::new(),
        }
    }

    /// `metadata.name`, the cluster object this document is applied as
    pub fn name(&self) -> &str {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .unwrap_or(FALLBACK_INGRESS_NAME)
    }

    /// The whole document as an applyable descriptor
    pub fn to_descriptor(&self) -> Result<Descriptor, IngressError> {
        Ok(Descriptor {
            name: self.name().to_string(),
            kind: DescriptorKind::Ingress,
            content: self.to_yaml()?,
        })
    }

    fn rule_for(&self, host: &str) -> Option<&IngressRule> {
        self.spec
            .rules
            .iter()
            .find(|r| r.host.as_deref() == Some(host))
    }

    /// Paths currently routed under `host`
    pub fn paths_for(&self, host: &str) -> Vec<String> {
        self.rule_for(host)
            .and_then(|r| r.http.as_ref())
            .map(|http| http.paths.iter().filter_map(|p| p.path.clone()).collect())
            .unwrap_or_default()
    }

    /// Append `route` under `host` unless an entry with the exact path exists.
    ///
    /// Returns whether the document changed. Pure; persisting is the caller's job.
    pub fn add_route(&mut self, host: &str, route: &IngressRoute) -> Result<bool, IngressError> {
        let rule = self
            .spec
            .rules
            .iter_mut()
            .find(|r| r.host.as_deref() == Some(host))
            .ok_or_else(|| IngressError::MissingHostRule {
                host: host.to_string(),
            })?;

        let http = rule.http.get_or_insert_with(HttpRule::default);
        if http
            .paths
            .iter()
            .any(|p| p.path.as_deref() == Some(route.path.as_str()))
        {
            return Ok(false);
        }

        http.paths.push(HttpPath::for_route(route));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"
apiVersion: networking.k8s.io/v1
kind: Ingress
metadata:
  name: or-ecosystem
  annotations:
    nginx.ingress.kubernetes.io/proxy-read-timeout: "3600"
spec:
  ingressClassName: nginx
  rules:
    - host: app.or-ecosystem.eu
      http:
        paths:
          - path: /
            pathType: Prefix
            backend:
              service:
                name: frontend
                port:
                  number: 80
    - host: data.or-ecosystem.eu
      http:
        paths: []
"#;

    fn route() -> IngressRoute {
        IngressRoute {
            path: "/ws/medical-device/abc".to_string(),
            service: "room-abc-svc".to_string(),
            port: 8007,
        }
    }

    #[test]
    fn test_add_route_appends_once() {
        let mut doc = IngressDocument::from_yaml(DOCUMENT).unwrap();

        assert!(doc.add_route(DEFAULT_INGRESS_HOST, &route()).unwrap());
        assert!(!doc.add_route(DEFAULT_INGRESS_HOST, &route()).unwrap());

        assert_eq!(
            doc.paths_for(DEFAULT_INGRESS_HOST),
            vec!["/ws/medical-device/abc"]
        );
    }

    #[test]
    fn test_missing_host_rule() {
        let mut doc = IngressDocument::from_yaml(DOCUMENT).unwrap();
        let result = doc.add_route("other.example", &route());
        assert!(matches!(result, Err(IngressError::MissingHostRule { .. })));
    }

    #[test]
    fn test_round_trip_preserves_unknown_fields() {
        let mut doc = IngressDocument::from_yaml(DOCUMENT).unwrap();
        doc.add_route(DEFAULT_INGRESS_HOST, &route()).unwrap();

        let yaml = doc.to_yaml().unwrap();
        assert!(yaml.contains("proxy-read-timeout"));
        assert!(yaml.contains("ingressClassName: nginx"));
        assert!(yaml.contains("name: frontend"));
        assert!(yaml.contains("name: room-abc-svc"));
        assert!(yaml.contains("number: 8007"));
        assert!(yaml.contains("pathType: Prefix"));

        let reparsed = IngressDocument::from_yaml(&yaml).unwrap();
        assert_eq!(reparsed, doc);
    }

    #[test]
    fn test_with_host_accepts_routes() {
        let mut doc = IngressDocument::with_host("or-ecosystem", DEFAULT_INGRESS_HOST);
        assert!(doc.add_route(DEFAULT_INGRESS_HOST, &route()).unwrap());
        assert_eq!(doc.paths_for("app.or-ecosystem.eu"), Vec::<String>::new());
    }

    #[test]
    fn test_to_descriptor_carries_whole_document() {
        let mut doc = IngressDocument::from_yaml(DOCUMENT).unwrap();
        doc.add_route(DEFAULT_INGRESS_HOST, &route()).unwrap();

        let descriptor = doc.to_descriptor().unwrap();
        assert_eq!(descriptor.name, "or-ecosystem");
        assert_eq!(descriptor.kind, DescriptorKind::Ingress);
        assert!(!descriptor.is_scalable());
        assert_eq!(descriptor.file_name(), "or-ecosystem.yaml");
        assert!(descriptor.content.contains("/ws/medical-device/abc"));
        assert!(descriptor.content.contains("name: frontend"));
    }

    #[test]
    fn test_unnamed_document_falls_back() {
        let doc = IngressDocument::default();
        assert_eq!(doc.name(), FALLBACK_INGRESS_NAME);
    }
}
