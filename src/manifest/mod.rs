//! Workload descriptor rendering
//!
//! A room's topology is a consumer deployment (aggregates every device stream
//! and serves the realtime socket), the consumer's service, and one provider
//! deployment per device type. Rendering is pure: the same room uuid, port and
//! device assignment always produce byte-identical descriptors, so committing
//! an unchanged room is a no-op for the cluster.
//!
//! Everything is rendered into memory first. A failure on any descriptor
//! aborts the whole set; [`WorkloadSet::persist`] then writes the files
//! all-or-nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use handlebars::Handlebars;
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CONSUMER_DEPLOYMENT_TEMPLATE: &str = "consumer-deployment.yaml";
pub const CONSUMER_SERVICE_TEMPLATE: &str = "consumer-service.yaml";
pub const PROVIDER_DEPLOYMENT_TEMPLATE: &str = "provider-deployment.yaml";

const TEMPLATE_NAMES: [&str; 3] = [
    CONSUMER_DEPLOYMENT_TEMPLATE,
    CONSUMER_SERVICE_TEMPLATE,
    PROVIDER_DEPLOYMENT_TEMPLATE,
];

const BUILTIN_CONSUMER_DEPLOYMENT: &str = include_str!("../../templates/consumer-deployment.yaml");
const BUILTIN_CONSUMER_SERVICE: &str = include_str!("../../templates/consumer-service.yaml");
const BUILTIN_PROVIDER_DEPLOYMENT: &str = include_str!("../../templates/provider-deployment.yaml");

/// Path prefix under which every room's realtime stream is routed
pub const WEBSOCKET_PATH_PREFIX: &str = "/ws/medical-device";

/// Errors raised while loading templates or rendering descriptors
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Template '{name}' could not be read from {path}: {reason}")]
    MissingTemplate {
        name: String,
        path: PathBuf,
        reason: String,
    },

    #[error("Template '{name}' is malformed: {reason}")]
    InvalidTemplate { name: String, reason: String },

    #[error("Rendering '{name}' failed: {reason}")]
    Render { name: String, reason: String },

    #[error("Device type '{0}' cannot be used in a workload name")]
    InvalidDeviceType(String),

    #[error("Device type '{0}' appears more than once")]
    DuplicateProviderType(String),

    #[error("Failed to persist descriptors: {0}")]
    Persist(#[from] std::io::Error),

    #[error("Persisted {} of {total} descriptors before failing: {cause}", .written.len())]
    PartialPersist {
        written: Vec<PathBuf>,
        total: usize,
        cause: std::io::Error,
    },
}

impl ManifestError {
    /// True for the template/render failures (as opposed to persistence I/O)
    pub fn is_render_error(&self) -> bool {
        !matches!(
            self,
            ManifestError::Persist(_) | ManifestError::PartialPersist { .. }
        )
    }
}

/// What a descriptor describes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DescriptorKind {
    ConsumerDeployment,
    ConsumerService,
    ProviderDeployment {
        #[serde(rename = "deviceType")]
        device_type: String,
    },
    /// The shared routing document, applied after a route is registered
    Ingress,
}

/// One rendered workload document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Descriptor {
    /// Cluster object name; for deployments also the scale target
    pub name: String,
    #[serde(flatten)]
    pub kind: DescriptorKind,
    pub content: String,
}

impl Descriptor {
    /// Deployments are written as `{name}-deployment.yaml`, everything else as `{name}.yaml`
    pub fn file_name(&self) -> String {
        if self.is_scalable() {
            format!("{}-deployment.yaml", self.name)
        } else {
            format!("{}.yaml", self.name)
        }
    }

    pub fn is_scalable(&self) -> bool {
        matches!(
            self.kind,
            DescriptorKind::ConsumerDeployment | DescriptorKind::ProviderDeployment { .. }
        )
    }
}

/// A device that backs a provider workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRef {
    pub device_type: String,
    pub device_uuid: Uuid,
}

impl ProviderRef {
    /// The type is lowercased; it becomes part of cluster object names
    pub fn new(device_type: impl AsRef<str>, device_uuid: Uuid) -> Self {
        Self {
            device_type: device_type.as_ref().to_lowercase(),
            device_uuid,
        }
    }
}

/// One provider per device type, in type order.
///
/// Types are compared after lowercasing. A second device of the same type is
/// a [`ManifestError::DuplicateProviderType`].
pub fn provider_refs<'a, I>(devices: I) -> Result<Vec<ProviderRef>, ManifestError>
where
    I: IntoIterator<Item = (&'a str, Uuid)>,
{
    let mut by_type: BTreeMap<String, ProviderRef> = BTreeMap::new();
    for (device_type, device_uuid) in devices {
        let provider = ProviderRef::new(device_type, device_uuid);
        if by_type.contains_key(&provider.device_type) {
            return Err(ManifestError::DuplicateProviderType(provider.device_type));
        }
        by_type.insert(provider.device_type.clone(), provider);
    }
    Ok(by_type.into_values().collect())
}

/// Every descriptor of one room, rendered at zero replicas
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSet {
    pub room_uuid: Uuid,
    pub port: u16,
    pub consumer: Descriptor,
    pub service: Descriptor,
    /// Ordered by device type
    pub providers: Vec<Descriptor>,
}

impl WorkloadSet {
    /// Descriptors in apply order
    pub fn descriptors(&self) -> impl Iterator<Item = &Descriptor> {
        [&self.consumer, &self.service]
            .into_iter()
            .chain(self.providers.iter())
    }

    /// Deployment names in scale-up order: consumer first, then providers
    pub fn scale_targets(&self) -> Vec<String> {
        self.descriptors()
            .filter(|d| d.is_scalable())
            .map(|d| d.name.clone())
            .collect()
    }

    /// Concatenated multi-document YAML, used by the dry-run output
    pub fn to_multi_document(&self) -> String {
        let mut out = String::new();
        for descriptor in self.descriptors() {
            out.push_str("---\n");
            out.push_str(&format!("# {}\n", descriptor.file_name()));
            out.push_str(descriptor.content.trim_end());
            out.push('\n');
        }
        out
    }

    /// Write every descriptor under `dir`.
    ///
    /// Each file is staged next to its destination first; only when every
    /// stage succeeded are the files renamed into place. If a rename fails,
    /// the remaining staged files are removed and the files already moved are
    /// reported in [`ManifestError::PartialPersist`].
    pub async fn persist(&self, dir: &Path) -> Result<Vec<PathBuf>, ManifestError> {
        tokio::fs::create_dir_all(dir).await?;

        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::new();
        for descriptor in self.descriptors() {
            let target = dir.join(descriptor.file_name());
            let stage = dir.join(format!(".{}.staged", descriptor.file_name()));
            if let Err(e) = tokio::fs::write(&stage, descriptor.content.as_bytes()).await {
                discard_staged(&staged).await;
                let _ = tokio::fs::remove_file(&stage).await;
                return Err(e.into());
            }
            staged.push((stage, target));
        }

        let total = staged.len();
        let mut written = Vec::with_capacity(total);
        for (i, (stage, target)) in staged.iter().enumerate() {
            if let Err(cause) = tokio::fs::rename(stage, target).await {
                discard_staged(&staged[i..]).await;
                warn!(
                    room_uuid = %self.room_uuid,
                    "Only {} of {} descriptors persisted: {}",
                    written.len(),
                    total,
                    cause
                );
                return Err(ManifestError::PartialPersist {
                    written,
                    total,
                    cause,
                });
            }
            written.push(target.clone());
        }

        debug!(
            room_uuid = %self.room_uuid,
            files = written.len(),
            "Persisted workload descriptors"
        );
        Ok(written)
    }
}

async fn discard_staged(staged: &[(PathBuf, PathBuf)]) {
    for (stage, _) in staged {
        if let Err(e) = tokio::fs::remove_file(stage).await {
            warn!("Failed to remove staged descriptor {}: {}", stage.display(), e);
        }
    }
}

/// A route entry for the shared ingress document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngressRoute {
    pub path: String,
    pub service: String,
    pub port: u16,
}

// ============================================================================
// SBIO: Pure naming and rendering (no I/O)
// ============================================================================

pub fn consumer_deployment_name(room_uuid: &Uuid) -> String {
    format!("{}-consumer", room_uuid)
}

pub fn provider_deployment_name(room_uuid: &Uuid, device_type: &str) -> String {
    format!("{}-provider-{}", room_uuid, device_type.to_lowercase())
}

pub fn service_name(room_uuid: &Uuid) -> String {
    format!("room-{}-svc", room_uuid)
}

pub fn websocket_path(room_uuid: &Uuid) -> String {
    format!("{}/{}", WEBSOCKET_PATH_PREFIX, room_uuid)
}

/// Port a room's consumer listens on
pub fn room_port(base_port: u16, room_id: i64) -> Option<u16> {
    u16::try_from(room_id)
        .ok()
        .and_then(|id| base_port.checked_add(id))
}

/// The route entry a room needs; computing it touches no shared state
pub fn render_ingress_patch(room_uuid: &Uuid, port: u16) -> IngressRoute {
    IngressRoute {
        path: websocket_path(room_uuid),
        service: service_name(room_uuid),
        port,
    }
}

fn device_type_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_.-]*$").ok())
        .as_ref()
}

/// Device types end up in workload names, so only name-safe characters pass.
///
/// The type is checked as it will appear in names, i.e. lowercased.
pub fn validate_device_type(device_type: &str) -> Result<(), ManifestError> {
    match device_type_pattern() {
        Some(pattern) if pattern.is_match(&device_type.to_lowercase()) => Ok(()),
        _ => Err(ManifestError::InvalidDeviceType(device_type.to_string())),
    }
}

/// Where template sources come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    /// Templates compiled into the binary
    Builtin,
    /// A directory holding the three template files, read on every load
    Directory(PathBuf),
}

impl TemplateSource {
    /// Read and compile the templates
    pub async fn load(&self) -> Result<ManifestGenerator, ManifestError> {
        match self {
            TemplateSource::Builtin => ManifestGenerator::builtin(),
            TemplateSource::Directory(dir) => {
                let mut sources = Vec::with_capacity(TEMPLATE_NAMES.len());
                for name in TEMPLATE_NAMES {
                    let path = dir.join(name);
                    let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
                        ManifestError::MissingTemplate {
                            name: name.to_string(),
                            path: path.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                    sources.push((name, content));
                }
                ManifestGenerator::from_sources(sources)
            }
        }
    }
}

/// Compiled descriptor templates
#[derive(Debug)]
pub struct ManifestGenerator {
    registry: Handlebars<'static>,
}

impl ManifestGenerator {
    /// Generator backed by the built-in templates
    pub fn builtin() -> Result<Self, ManifestError> {
        Self::from_sources([
            (CONSUMER_DEPLOYMENT_TEMPLATE, BUILTIN_CONSUMER_DEPLOYMENT.to_string()),
            (CONSUMER_SERVICE_TEMPLATE, BUILTIN_CONSUMER_SERVICE.to_string()),
            (PROVIDER_DEPLOYMENT_TEMPLATE, BUILTIN_PROVIDER_DEPLOYMENT.to_string()),
        ])
    }

    /// Compile templates from `(name, source)` pairs; all three names are required
    pub fn from_sources<I, S>(sources: I) -> Result<Self, ManifestError>
    where
        I: IntoIterator<Item = (S, String)>,
        S: AsRef<str>,
    {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);

        for (name, source) in sources {
            let name = name.as_ref();
            registry
                .register_template_string(name, source)
                .map_err(|e| ManifestError::InvalidTemplate {
                    name: name.to_string(),
                    reason: e.to_string(),
                })?;
        }

        for name in TEMPLATE_NAMES {
            if !registry.has_template(name) {
                return Err(ManifestError::MissingTemplate {
                    name: name.to_string(),
                    path: PathBuf::from(name),
                    reason: "not provided".to_string(),
                });
            }
        }

        Ok(Self { registry })
    }

    /// Render a room's consumer, service and provider descriptors.
    ///
    /// Device uuids are treated as a set and provider entries are ordered by
    /// type, so callers may pass them in any order.
    pub fn render_workload_set(
        &self,
        room_uuid: &Uuid,
        port: u16,
        device_uuids: &[Uuid],
        providers: &[ProviderRef],
    ) -> Result<WorkloadSet, ManifestError> {
        let device_set: BTreeSet<String> = device_uuids.iter().map(Uuid::to_string).collect();
        let device_list: Vec<&String> = device_set.iter().collect();
        let device_json = serde_json::to_string(&device_list).map_err(|e| ManifestError::Render {
            name: CONSUMER_DEPLOYMENT_TEMPLATE.to_string(),
            reason: e.to_string(),
        })?;

        let mut ordered: Vec<ProviderRef> = providers
            .iter()
            .map(|p| ProviderRef::new(&p.device_type, p.device_uuid))
            .collect();
        ordered.sort_by(|a, b| a.device_type.cmp(&b.device_type));
        for pair in ordered.windows(2) {
            if pair[0].device_type == pair[1].device_type {
                return Err(ManifestError::DuplicateProviderType(
                    pair[0].device_type.clone(),
                ));
            }
        }

        let consumer = Descriptor {
            name: consumer_deployment_name(room_uuid),
            kind: DescriptorKind::ConsumerDeployment,
            content: self.render(
                CONSUMER_DEPLOYMENT_TEMPLATE,
                &json!({
                    "room_uuid": room_uuid.to_string(),
                    "port": port,
                    "device_uuids": device_json,
                    "websocket_path": websocket_path(room_uuid),
                }),
            )?,
        };

        let service = Descriptor {
            name: service_name(room_uuid),
            kind: DescriptorKind::ConsumerService,
            content: self.render(
                CONSUMER_SERVICE_TEMPLATE,
                &json!({
                    "room_uuid": room_uuid.to_string(),
                    "port": port,
                }),
            )?,
        };

        let mut rendered = Vec::with_capacity(ordered.len());
        for provider in ordered {
            validate_device_type(&provider.device_type)?;
            rendered.push(Descriptor {
                name: provider_deployment_name(room_uuid, &provider.device_type),
                kind: DescriptorKind::ProviderDeployment {
                    device_type: provider.device_type.clone(),
                },
                content: self.render(
                    PROVIDER_DEPLOYMENT_TEMPLATE,
                    &json!({
                        "room_uuid": room_uuid.to_string(),
                        "provider_type": provider.device_type,
                        "provider_uuid": provider.device_uuid.to_string(),
                        "replicas": 0,
                    }),
                )?,
            });
        }

        Ok(WorkloadSet {
            room_uuid: *room_uuid,
            port,
            consumer,
            service,
            providers: rendered,
        })
    }

    fn render(&self, name: &str, data: &serde_json::Value) -> Result<String, ManifestError> {
        self.registry
            .render(name, data)
            .map_err(|e| ManifestError::Render {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }
}
