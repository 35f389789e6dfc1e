//! Versioned storage for the shared ingress document

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

use super::{IngressDocument, IngressError};

/// Opaque version handed out by a read and checked by the following write
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IngressVersion(String);

impl IngressVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IngressVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compare-and-swap access to the ingress document
#[async_trait]
pub trait IngressStore: Send + Sync {
    /// Current document and its version
    async fn load(&self) -> Result<(IngressDocument, IngressVersion), IngressError>;

    /// Replace the document if it is still at `expected`.
    ///
    /// Fails with [`IngressError::VersionMismatch`] when someone else wrote in
    /// between. Returns the new version.
    async fn store(
        &self,
        document: &IngressDocument,
        expected: &IngressVersion,
    ) -> Result<IngressVersion, IngressError>;
}

// ============================================================================
// File store
// ============================================================================

fn digest(bytes: &[u8]) -> IngressVersion {
    IngressVersion(format!("{:x}", Sha256::digest(bytes)))
}

/// YAML file on disk, versioned by the SHA-256 of its bytes
#[derive(Debug, Clone)]
pub struct FileIngressStore {
    path: PathBuf,
}

impl FileIngressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_current(&self) -> Result<(String, IngressVersion), IngressError> {
        let bytes = tokio::fs::read(&self.path).await?;
        let version = digest(&bytes);
        let content = String::from_utf8(bytes).map_err(|e| {
            IngressError::Malformed(format!("{} is not UTF-8: {}", self.path.display(), e))
        })?;
        Ok((content, version))
    }
}

#[async_trait]
impl IngressStore for FileIngressStore {
    async fn load(&self) -> Result<(IngressDocument, IngressVersion), IngressError> {
        let (content, version) = self.read_current().await?;
        if content.trim().is_empty() {
            return Err(IngressError::Malformed(format!(
                "{} is empty",
                self.path.display()
            )));
        }
        Ok((IngressDocument::from_yaml(&content)?, version))
    }

    async fn store(
        &self,
        document: &IngressDocument,
        expected: &IngressVersion,
    ) -> Result<IngressVersion, IngressError> {
        let (_, current) = self.read_current().await?;
        if &current != expected {
            return Err(IngressError::VersionMismatch {
                expected: expected.to_string(),
                found: current.to_string(),
            });
        }

        let yaml = document.to_yaml()?;
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "ingress.yaml".to_string());
        let staged = self.path.with_file_name(format!(".{}.staged", file_name));

        tokio::fs::write(&staged, yaml.as_bytes()).await?;
        if let Err(e) = tokio::fs::rename(&staged, &self.path).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(e.into());
        }

        let version = digest(yaml.as_bytes());
        debug!("Wrote {} (version {})", self.path.display(), version);
        Ok(version)
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Document held in memory, versioned by a write counter
#[derive(Debug, Default)]
pub struct MemoryIngressStore {
    inner: Mutex<(IngressDocument, u64)>,
}

impl MemoryIngressStore {
    pub fn new(document: IngressDocument) -> Self {
        Self {
            inner: Mutex::new((document, 0)),
        }
    }

    /// Current document, ignoring versions
    pub async fn snapshot(&self) -> IngressDocument {
        self.inner.lock().await.0.clone()
    }

    /// Overwrite unconditionally, as an external writer would
    pub async fn replace(&self, document: IngressDocument) {
        let mut inner = self.inner.lock().await;
        inner.0 = document;
        inner.1 += 1;
    }
}

#[async_trait]
impl IngressStore for MemoryIngressStore {
    async fn load(&self) -> Result<(IngressDocument, IngressVersion), IngressError> {
        let inner = self.inner.lock().await;
        Ok((inner.0.clone(), IngressVersion(inner.1.to_string())))
    }

    async fn store(
        &self,
        document: &IngressDocument,
        expected: &IngressVersion,
    ) -> Result<IngressVersion, IngressError> {
        let mut inner = self.inner.lock().await;
        let current = inner.1.to_string();
        if current != expected.0 {
            return Err(IngressError::VersionMismatch {
                expected: expected.to_string(),
                found: current,
            });
        }
        inner.0 = document.clone();
        inner.1 += 1;
        Ok(IngressVersion(inner.1.to_string()))
    }
}
