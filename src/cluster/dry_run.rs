//! Cluster client that never touches a cluster
//!
//! Used by `orfleet serve` with the `dry-run` backend to exercise the whole
//! lifecycle against no platform, and by the test-suite to observe call order
//! and inject failures.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use super::{ClusterClient, ClusterError, ClusterOutcome, DEFAULT_CALL_TIMEOUT_SECS};
use crate::manifest::Descriptor;

/// The verb of a recorded call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verb", rename_all = "lowercase")]
pub enum ClusterVerb {
    Apply,
    Scale { replicas: u32 },
}

/// One call made against the dry-run client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterCall {
    pub workload: String,
    pub namespace: String,
    #[serde(flatten)]
    pub verb: ClusterVerb,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    /// Fail the next `n` matching calls
    Fail(usize),
    /// Never answer; the call runs into the timeout
    Hang,
}

#[derive(Debug, Default)]
struct Inner {
    calls: Vec<ClusterCall>,
    /// Keyed by (workload, replicas); `None` replicas means apply
    faults: HashMap<(String, Option<u32>), Fault>,
}

/// Logs and records calls instead of executing them
#[derive(Debug)]
pub struct DryRunClusterClient {
    inner: Mutex<Inner>,
    timeout: Duration,
}

impl Default for DryRunClusterClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DryRunClusterClient {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
        }
    }

    /// Bound used for calls configured to hang
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Make the next `times` applies of `workload` fail
    pub async fn fail_apply(&self, workload: &str, times: usize) {
        self.inner
            .lock()
            .await
            .faults
            .insert((workload.to_string(), None), Fault::Fail(times));
    }

    /// Make the next `times` scale calls of `workload` to `replicas` fail
    pub async fn fail_scale(&self, workload: &str, replicas: u32, times: usize) {
        self.inner
            .lock()
            .await
            .faults
            .insert((workload.to_string(), Some(replicas)), Fault::Fail(times));
    }

    /// Make scale calls of `workload` to `replicas` hang until they time out
    pub async fn hang_scale(&self, workload: &str, replicas: u32) {
        self.inner
            .lock()
            .await
            .faults
            .insert((workload.to_string(), Some(replicas)), Fault::Hang);
    }

    /// Every call made so far, in order
    pub async fn calls(&self) -> Vec<ClusterCall> {
        self.inner.lock().await.calls.clone()
    }

    /// Successful scale calls as `(workload, replicas)`, in order
    pub async fn scale_calls(&self) -> Vec<(String, u32)> {
        self.calls()
            .await
            .into_iter()
            .filter(|c| c.succeeded)
            .filter_map(|c| match c.verb {
                ClusterVerb::Scale { replicas } => Some((c.workload, replicas)),
                ClusterVerb::Apply => None,
            })
            .collect()
    }

    /// Names of successfully applied descriptors, in order
    pub async fn applied(&self) -> Vec<String> {
        self.calls()
            .await
            .into_iter()
            .filter(|c| c.succeeded && c.verb == ClusterVerb::Apply)
            .map(|c| c.workload)
            .collect()
    }

    pub async fn clear(&self) {
        self.inner.lock().await.calls.clear();
    }

    /// Consume one matching fault, if any
    async fn take_fault(&self, workload: &str, replicas: Option<u32>) -> Option<Fault> {
        let mut inner = self.inner.lock().await;
        let key = (workload.to_string(), replicas);
        match inner.faults.get(&key).copied() {
            Some(Fault::Fail(n)) if n > 1 => {
                inner.faults.insert(key, Fault::Fail(n - 1));
                Some(Fault::Fail(n))
            }
            Some(Fault::Fail(n)) => {
                inner.faults.remove(&key);
                (n > 0).then_some(Fault::Fail(n))
            }
            other => other,
        }
    }

    async fn record(&self, workload: &str, namespace: &str, verb: ClusterVerb, succeeded: bool) {
        self.inner.lock().await.calls.push(ClusterCall {
            workload: workload.to_string(),
            namespace: namespace.to_string(),
            verb,
            succeeded,
        });
    }
}

#[async_trait]
impl ClusterClient for DryRunClusterClient {
    async fn apply(
        &self,
        descriptor: &Descriptor,
        namespace: &str,
    ) -> Result<ClusterOutcome, ClusterError> {
        if self.take_fault(&descriptor.name, None).await.is_some() {
            self.record(&descriptor.name, namespace, ClusterVerb::Apply, false)
                .await;
            return Err(ClusterError::Apply {
                workload: descriptor.name.clone(),
                cause: "injected failure".to_string(),
            });
        }

        info!(
            "[dry-run] kubectl apply -n {} ({} bytes) {}",
            namespace,
            descriptor.content.len(),
            descriptor.name
        );
        self.record(&descriptor.name, namespace, ClusterVerb::Apply, true)
            .await;
        Ok(ClusterOutcome {
            workload: descriptor.name.clone(),
            message: format!("{} configured (dry run)", descriptor.name),
        })
    }

    async fn scale(
        &self,
        workload: &str,
        replicas: u32,
        namespace: &str,
    ) -> Result<ClusterOutcome, ClusterError> {
        match self.take_fault(workload, Some(replicas)).await {
            Some(Fault::Fail(_)) => {
                self.record(workload, namespace, ClusterVerb::Scale { replicas }, false)
                    .await;
                return Err(ClusterError::Scale {
                    workload: workload.to_string(),
                    replicas,
                    cause: "injected failure".to_string(),
                });
            }
            Some(Fault::Hang) => {
                let _ = tokio::time::timeout(self.timeout, futures::future::pending::<()>()).await;
                self.record(workload, namespace, ClusterVerb::Scale { replicas }, false)
                    .await;
                return Err(ClusterError::Timeout {
                    operation: format!("scale {} to {}", workload, replicas),
                    after: self.timeout,
                });
            }
            None => {}
        }

        info!(
            "[dry-run] kubectl scale deployment/{} -n {} --replicas={}",
            workload, namespace, replicas
        );
        self.record(workload, namespace, ClusterVerb::Scale { replicas }, true)
            .await;
        Ok(ClusterOutcome {
            workload: workload.to_string(),
            message: format!("deployment.apps/{} scaled (dry run)", workload),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::DescriptorKind;

    #[tokio::test]
    async fn test_records_calls_in_order() {
        let client = DryRunClusterClient::new();
        let descriptor = Descriptor {
            name: "a".to_string(),
            kind: DescriptorKind::ConsumerDeployment,
            content: String::new(),
        };

        client.apply(&descriptor, "ns").await.unwrap();
        client.scale("a", 1, "ns").await.unwrap();
        client.scale("b", 1, "ns").await.unwrap();

        assert_eq!(client.applied().await, vec!["a"]);
        assert_eq!(
            client.scale_calls().await,
            vec![("a".to_string(), 1), ("b".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn test_fail_scale_counts_down() {
        let client = DryRunClusterClient::new();
        client.fail_scale("a", 0, 2).await;

        assert!(client.scale("a", 0, "ns").await.is_err());
        assert!(client.scale("a", 0, "ns").await.is_err());
        assert!(client.scale("a", 0, "ns").await.is_ok());
        // other replica counts are unaffected
        assert!(client.scale("a", 1, "ns").await.is_ok());
        assert_eq!(client.calls().await.len(), 4);
    }

    #[tokio::test]
    async fn test_hang_times_out() {
        let client = DryRunClusterClient::new().with_timeout(Duration::from_millis(20));
        client.hang_scale("a", 1).await;

        let result = client.scale("a", 1, "ns").await;
        assert!(matches!(result, Err(ClusterError::Timeout { .. })));
    }
}
