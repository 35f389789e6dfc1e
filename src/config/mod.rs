//! Server settings
//!
//! Settings come from three layers, later ones winning:
//! built-in defaults, a YAML file (`~/.orfleet/config.yaml` unless `--config`
//! says otherwise) and `ORFLEET_*` environment variables. Paths may start
//! with `~`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::{ClusterBackend, KubectlConfig, DEFAULT_CALL_TIMEOUT_SECS, DEFAULT_NAMESPACE};
use crate::ingress::{DEFAULT_CAS_ATTEMPTS, DEFAULT_INGRESS_HOST};
use crate::manifest::TemplateSource;
use crate::room::{ControllerConfig, RetryPolicy};

/// Default HTTP port of the orchestrator API
pub const DEFAULT_SERVER_PORT: u16 = 3000;

/// Default base port; room `n` gets `DEFAULT_BASE_PORT + n`
pub const DEFAULT_BASE_PORT: u16 = crate::room::DEFAULT_BASE_PORT;

/// Dashboards served next to the orchestrator
pub const DEFAULT_CORS_ORIGINS: [&str; 5] = [
    "http://localhost:3001",
    "http://localhost:3002",
    "http://or-ecosystem.eu",
    "http://data.or-ecosystem.eu",
    "http://admin.or-ecosystem.eu",
];

/// Where the shared ingress document is mounted
pub const DEFAULT_INGRESS_FILE: &str = "/mnt/ingress/ingress.yaml";

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "ORFLEET_";

/// Default settings file location: ~/.orfleet/config.yaml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".orfleet")
        .join("config.yaml")
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub cluster: ClusterSettings,
    pub rooms: RoomSettings,
    pub ingress: IngressSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_addr: String,
    pub port: u16,
    /// Browser origins allowed to call the API; empty disables CORS
    pub cors_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: DEFAULT_SERVER_PORT,
            cors_origins: DEFAULT_CORS_ORIGINS.iter().map(|o| o.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    pub backend: ClusterBackend,
    pub namespace: String,
    /// `kubectl` binary name or path
    pub kubectl: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Bound for each apply/scale call
    pub call_timeout_secs: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            backend: ClusterBackend::default(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            kubectl: "kubectl".to_string(),
            kubeconfig: None,
            context: None,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomSettings {
    pub base_port: u16,
    /// Directory with the three descriptor templates; built-ins when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_dir: Option<PathBuf>,
    /// Where rendered descriptors are written; not written when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    /// Rooms and devices to seed the in-memory store with
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inventory: Option<PathBuf>,
    pub scale_down_attempts: u32,
    pub scale_down_backoff_ms: u64,
}

impl Default for RoomSettings {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            base_port: DEFAULT_BASE_PORT,
            template_dir: None,
            output_dir: None,
            inventory: None,
            scale_down_attempts: retry.attempts,
            scale_down_backoff_ms: retry.backoff.as_millis() as u64,
        }
    }
}

/// Backing store of the ingress document
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IngressStoreKind {
    #[default]
    File,
    /// Process-local document seeded with an empty rule for the host
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressSettings {
    pub store: IngressStoreKind,
    pub file: PathBuf,
    pub host: String,
    pub cas_attempts: u32,
}

impl Default for IngressSettings {
    fn default() -> Self {
        Self {
            store: IngressStoreKind::default(),
            file: PathBuf::from(DEFAULT_INGRESS_FILE),
            host: DEFAULT_INGRESS_HOST.to_string(),
            cas_attempts: DEFAULT_CAS_ATTEMPTS,
        }
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Parse settings from YAML; missing keys take their defaults
pub fn parse_settings(content: &str) -> Result<Settings, ConfigError> {
    if content.trim().is_empty() {
        return Ok(Settings::default());
    }
    serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
}

pub fn serialize_settings(settings: &Settings) -> Result<String, ConfigError> {
    serde_yaml::to_string(settings).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Expand a leading `~` in a configured path
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(raw.as_ref()).into_owned())
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Apply `ORFLEET_*` overrides read through `lookup`
pub fn apply_env_overrides<F>(settings: &mut Settings, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

    if let Some(v) = get("BIND_ADDR") {
        settings.server.bind_addr = v;
    }
    if let Some(v) = get("PORT") {
        settings.server.port = parse_value("ORFLEET_PORT", &v)?;
    }
    if let Some(v) = get("CORS_ORIGINS") {
        settings.server.cors_origins = v
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(v) = get("CLUSTER_BACKEND") {
        settings.cluster.backend = match v.trim() {
            "kubectl" => ClusterBackend::Kubectl,
            "dry-run" | "dry_run" => ClusterBackend::DryRun,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "ORFLEET_CLUSTER_BACKEND".to_string(),
                    value: other.to_string(),
                    reason: "expected 'kubectl' or 'dry-run'".to_string(),
                })
            }
        };
    }
    if let Some(v) = get("NAMESPACE") {
        settings.cluster.namespace = v;
    }
    if let Some(v) = get("KUBECTL") {
        settings.cluster.kubectl = v;
    }
    if let Some(v) = get("KUBECONFIG") {
        settings.cluster.kubeconfig = Some(PathBuf::from(v));
    }
    if let Some(v) = get("CALL_TIMEOUT_SECS") {
        settings.cluster.call_timeout_secs = parse_value("ORFLEET_CALL_TIMEOUT_SECS", &v)?;
    }
    if let Some(v) = get("BASE_PORT") {
        settings.rooms.base_port = parse_value("ORFLEET_BASE_PORT", &v)?;
    }
    if let Some(v) = get("TEMPLATE_DIR") {
        settings.rooms.template_dir = Some(PathBuf::from(v));
    }
    if let Some(v) = get("OUTPUT_DIR") {
        settings.rooms.output_dir = Some(PathBuf::from(v));
    }
    if let Some(v) = get("INVENTORY") {
        settings.rooms.inventory = Some(PathBuf::from(v));
    }
    if let Some(v) = get("SCALE_DOWN_ATTEMPTS") {
        settings.rooms.scale_down_attempts = parse_value("ORFLEET_SCALE_DOWN_ATTEMPTS", &v)?;
    }
    if let Some(v) = get("INGRESS_FILE") {
        settings.ingress.file = PathBuf::from(v);
    }
    if let Some(v) = get("INGRESS_HOST") {
        settings.ingress.host = v;
    }
    if let Some(v) = get("INGRESS_CAS_ATTEMPTS") {
        settings.ingress.cas_attempts = parse_value("ORFLEET_INGRESS_CAS_ATTEMPTS", &v)?;
    }
    Ok(())
}

impl Settings {
    /// Reject combinations the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.namespace.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "cluster.namespace".to_string(),
                value: self.cluster.namespace.clone(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.cluster.call_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "cluster.call_timeout_secs".to_string(),
                value: "0".to_string(),
                reason: "calls must be bounded".to_string(),
            });
        }
        if self.ingress.host.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "ingress.host".to_string(),
                value: self.ingress.host.clone(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Expand `~` in every configured path
    pub fn expand_paths(&mut self) {
        for path in [
            &mut self.cluster.kubeconfig,
            &mut self.rooms.template_dir,
            &mut self.rooms.output_dir,
            &mut self.rooms.inventory,
        ]
        .into_iter()
        .flatten()
        {
            *path = expand_path(path);
        }
        self.ingress.file = expand_path(&self.ingress.file);
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind_addr, self.server.port)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster.call_timeout_secs)
    }

    pub fn kubectl_config(&self) -> KubectlConfig {
        KubectlConfig {
            program: self.cluster.kubectl.clone(),
            kubeconfig: self.cluster.kubeconfig.clone(),
            context: self.cluster.context.clone(),
            timeout: self.call_timeout(),
        }
    }

    pub fn template_source(&self) -> TemplateSource {
        match &self.rooms.template_dir {
            Some(dir) => TemplateSource::Directory(dir.clone()),
            None => TemplateSource::Builtin,
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            namespace: self.cluster.namespace.clone(),
            base_port: self.rooms.base_port,
            templates: self.template_source(),
            output_dir: self.rooms.output_dir.clone(),
            scale_down: RetryPolicy {
                attempts: self.rooms.scale_down_attempts.max(1),
                backoff: Duration::from_millis(self.rooms.scale_down_backoff_ms),
            },
        }
    }
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Load settings from `path` (or the default location), then apply the
/// process environment and expand paths.
///
/// An explicitly given file must exist; the default one may be absent.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let mut settings = match path {
        Some(path) => {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            parse_settings(&std::fs::read_to_string(path)?)?
        }
        None => {
            let default = default_config_path();
            if default.exists() {
                parse_settings(&std::fs::read_to_string(&default)?)?
            } else {
                Settings::default()
            }
        }
    };

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok())?;
    settings.expand_paths();
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 3000);
        assert_eq!(settings.cluster.namespace, "or-ecosys");
        assert_eq!(settings.rooms.base_port, 8000);
        assert_eq!(settings.rooms.scale_down_attempts, 3);
        assert_eq!(settings.ingress.host, "data.or-ecosystem.eu");
        assert_eq!(settings.ingress.cas_attempts, 5);
        assert_eq!(settings.template_source(), TemplateSource::Builtin);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_file() {
        let yaml = r#"
cluster:
  backend: dry-run
  call_timeout_secs: 5
rooms:
  template_dir: /etc/orfleet/templates
ingress:
  store: memory
"#;
        let settings = parse_settings(yaml).unwrap();
        assert_eq!(settings.cluster.backend, ClusterBackend::DryRun);
        assert_eq!(settings.cluster.namespace, "or-ecosys");
        assert_eq!(settings.call_timeout(), Duration::from_secs(5));
        assert_eq!(settings.ingress.store, IngressStoreKind::Memory);
        assert_eq!(
            settings.template_source(),
            TemplateSource::Directory(PathBuf::from("/etc/orfleet/templates"))
        );
    }

    #[test]
    fn test_parse_empty_is_default() {
        assert_eq!(parse_settings("").unwrap(), Settings::default());
    }

    #[test]
    fn test_parse_invalid() {
        assert!(matches!(
            parse_settings("server: [1, 2"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("ORFLEET_PORT", "9000"),
            ("ORFLEET_CLUSTER_BACKEND", "dry-run"),
            ("ORFLEET_INGRESS_HOST", "ws.example.org"),
            ("ORFLEET_SCALE_DOWN_ATTEMPTS", "5"),
            ("ORFLEET_CORS_ORIGINS", "http://a.example, http://b.example"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        apply_env_overrides(&mut settings, |k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.cluster.backend, ClusterBackend::DryRun);
        assert_eq!(settings.ingress.host, "ws.example.org");
        assert_eq!(settings.controller_config().scale_down.attempts, 5);
        assert_eq!(
            settings.server.cors_origins,
            vec!["http://a.example", "http://b.example"]
        );
    }

    #[test]
    fn test_env_override_bad_number() {
        let mut settings = Settings::default();
        let result = apply_env_overrides(&mut settings, |k| {
            (k == "ORFLEET_BASE_PORT").then(|| "eight thousand".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut settings = Settings::default();
        settings.cluster.call_timeout_secs = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_expand_paths() {
        let mut settings = Settings::default();
        settings.rooms.template_dir = Some(PathBuf::from("~/templates"));
        settings.expand_paths();

        let dir = settings.rooms.template_dir.unwrap();
        assert!(!dir.to_string_lossy().starts_with('~'));
        assert!(dir.ends_with("templates"));
    }

    #[test]
    fn test_load_missing_explicit_file() {
        let result = load_settings(Some(Path::new("/nonexistent/orfleet.yaml")));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_serialize_round_trip() {
        let settings = Settings::default();
        let yaml = serialize_settings(&settings).unwrap();
        assert_eq!(parse_settings(&yaml).unwrap(), settings);
    }
}
