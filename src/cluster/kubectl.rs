//! `kubectl`-backed cluster client
//!
//! Descriptors are piped to `kubectl apply -f -` straight from memory, so a
//! commit never depends on files written earlier. Child processes are killed
//! when their future is dropped, which is what happens on timeout or when the
//! owning operation is cancelled.

use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{ClusterClient, ClusterError, ClusterOutcome, DEFAULT_CALL_TIMEOUT_SECS};
use crate::manifest::Descriptor;

/// How to invoke `kubectl`
#[derive(Debug, Clone, PartialEq)]
pub struct KubectlConfig {
    /// Binary name or path
    pub program: String,
    /// Optional `--kubeconfig`
    pub kubeconfig: Option<PathBuf>,
    /// Optional `--context`
    pub context: Option<String>,
    /// Bound for each call
    pub timeout: Duration,
}

impl Default for KubectlConfig {
    fn default() -> Self {
        Self {
            program: "kubectl".to_string(),
            kubeconfig: None,
            context: None,
            timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
        }
    }
}

// ============================================================================
// SBIO: Pure argument builders (no I/O)
// ============================================================================

/// Flags that select the cluster, shared by every call
pub fn generate_global_args(config: &KubectlConfig) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(kubeconfig) = &config.kubeconfig {
        args.push("--kubeconfig".to_string());
        args.push(kubeconfig.to_string_lossy().into_owned());
    }
    if let Some(context) = &config.context {
        args.push("--context".to_string());
        args.push(context.clone());
    }
    args
}

/// `kubectl apply` reading the descriptor from stdin
pub fn generate_apply_args(namespace: &str) -> Vec<String> {
    vec![
        "apply".to_string(),
        "-f".to_string(),
        "-".to_string(),
        "-n".to_string(),
        namespace.to_string(),
    ]
}

pub fn generate_scale_args(workload: &str, replicas: u32, namespace: &str) -> Vec<String> {
    vec![
        "scale".to_string(),
        format!("deployment/{}", workload),
        "-n".to_string(),
        namespace.to_string(),
        format!("--replicas={}", replicas),
    ]
}

/// Cluster client shelling out to `kubectl`
#[derive(Debug, Clone, Default)]
pub struct KubectlClient {
    config: KubectlConfig,
}

impl KubectlClient {
    pub fn new(config: KubectlConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &KubectlConfig {
        &self.config
    }

    /// Run one kubectl invocation under the configured timeout.
    ///
    /// `on_failure` turns a platform-side failure (non-zero exit, broken pipe)
    /// into the verb-specific error.
    async fn run<F>(
        &self,
        verb_args: Vec<String>,
        stdin: Option<&str>,
        on_failure: F,
    ) -> Result<Output, ClusterError>
    where
        F: Fn(String) -> ClusterError,
    {
        let mut args = generate_global_args(&self.config);
        args.extend(verb_args);
        let label = format!("{} {}", self.config.program, args.join(" "));

        debug!("Running: {}", label);

        let mut child = Command::new(&self.config.program)
            .args(&args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ClusterError::Spawn {
                program: self.config.program.clone(),
                cause: e.to_string(),
            })?;

        let input = stdin.map(str::to_owned);
        let call = async move {
            if let (Some(input), Some(mut pipe)) = (input, child.stdin.take()) {
                pipe.write_all(input.as_bytes()).await?;
                pipe.shutdown().await?;
            }
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(self.config.timeout, call).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(on_failure(e.to_string())),
            Err(_) => {
                warn!("{} timed out after {:?}", label, self.config.timeout);
                return Err(ClusterError::Timeout {
                    operation: label,
                    after: self.config.timeout,
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let cause = if stderr.is_empty() {
                format!("exited with {}", output.status)
            } else {
                stderr
            };
            return Err(on_failure(cause));
        }

        Ok(output)
    }
}

#[async_trait]
impl ClusterClient for KubectlClient {
    async fn apply(
        &self,
        descriptor: &Descriptor,
        namespace: &str,
    ) -> Result<ClusterOutcome, ClusterError> {
        let workload = descriptor.name.clone();
        let output = self
            .run(
                generate_apply_args(namespace),
                Some(&descriptor.content),
                |cause| ClusterError::Apply {
                    workload: workload.clone(),
                    cause,
                },
            )
            .await?;

        let message = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("kubectl apply succeeded for {}: {}", descriptor.name, message);
        Ok(ClusterOutcome { workload, message })
    }

    async fn scale(
        &self,
        workload: &str,
        replicas: u32,
        namespace: &str,
    ) -> Result<ClusterOutcome, ClusterError> {
        let output = self
            .run(
                generate_scale_args(workload, replicas, namespace),
                None,
                |cause| ClusterError::Scale {
                    workload: workload.to_string(),
                    replicas,
                    cause,
                },
            )
            .await?;

        let message = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("Scaled {} to {} replicas", workload, replicas);
        Ok(ClusterOutcome {
            workload: workload.to_string(),
            message,
        })
    }
}
