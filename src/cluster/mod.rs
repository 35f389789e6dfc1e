//! # Cluster control
//!
//! Typed boundary to the orchestration platform. The orchestrator only ever
//! needs two verbs:
//!
//! - **apply**: declaratively create or update one workload from a descriptor
//! - **scale**: set a deployment's replica count (0 or 1 here)
//!
//! Both are bounded by a per-call timeout and never retried implicitly;
//! callers decide. Timeouts are reported as [`ClusterError::Timeout`], distinct
//! from the platform rejecting the request.
//!
//! Two backends exist: [`KubectlClient`] drives a real cluster through the
//! `kubectl` binary, [`DryRunClusterClient`] only logs and records calls.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::manifest::Descriptor;

pub mod dry_run;
pub mod kubectl;

pub use dry_run::{ClusterCall, ClusterVerb, DryRunClusterClient};
pub use kubectl::{KubectlClient, KubectlConfig};

/// Namespace every room workload lives in unless configured otherwise
pub const DEFAULT_NAMESPACE: &str = "or-ecosys";

/// Default bound for a single platform call
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

/// Errors surfaced by a cluster backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusterError {
    #[error("Applying '{workload}' failed: {cause}")]
    Apply { workload: String, cause: String },

    #[error("Scaling '{workload}' to {replicas} replicas failed: {cause}")]
    Scale {
        workload: String,
        replicas: u32,
        cause: String,
    },

    #[error("{operation} timed out after {}s", after.as_secs())]
    Timeout { operation: String, after: Duration },

    #[error("Failed to launch {program}: {cause}")]
    Spawn { program: String, cause: String },
}

impl ClusterError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClusterError::Timeout { .. })
    }
}

/// Result of a successful platform call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterOutcome {
    pub workload: String,
    /// Whatever the platform reported back (e.g. `deployment.apps/x configured`)
    pub message: String,
}

/// Which cluster backend the server drives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterBackend {
    #[default]
    Kubectl,
    DryRun,
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create or update the workload described by `descriptor`
    async fn apply(
        &self,
        descriptor: &Descriptor,
        namespace: &str,
    ) -> Result<ClusterOutcome, ClusterError>;

    /// Set the replica count of deployment `workload`
    async fn scale(
        &self,
        workload: &str,
        replicas: u32,
        namespace: &str,
    ) -> Result<ClusterOutcome, ClusterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = ClusterError::Timeout {
            operation: "kubectl scale".to_string(),
            after: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "kubectl scale timed out after 30s");
        assert!(err.is_timeout());
    }

    #[test]
    fn test_backend_parse() {
        let backend: ClusterBackend = serde_yaml::from_str("dry-run").unwrap();
        assert_eq!(backend, ClusterBackend::DryRun);
        assert_eq!(ClusterBackend::default(), ClusterBackend::Kubectl);
    }
}
