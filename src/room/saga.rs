//! Scale-up saga and the scale-down retry policy
//!
//! Scaling a room up is a sequence of independent platform calls. Each
//! successful step is recorded; when a later step fails the recorded steps are
//! undone in reverse order, so a failed start never leaves part of a room
//! running unnoticed.

use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::LifecycleError;
use crate::cluster::{ClusterClient, ClusterError, ClusterOutcome};

/// Replicas a started workload runs with
pub const RUNNING_REPLICAS: u32 = 1;

/// Retry policy for scale-down calls.
///
/// Attempt `n` (1-based) is followed by a pause of `backoff * n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    /// Scale `workload` to zero, retrying per policy
    pub async fn scale_down(
        &self,
        cluster: &dyn ClusterClient,
        workload: &str,
        namespace: &str,
    ) -> Result<ClusterOutcome, ClusterError> {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match cluster.scale(workload, 0, namespace).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if attempt < attempts => {
                    warn!(
                        "Scale-down of {} failed (attempt {}/{}): {}",
                        workload, attempt, attempts, e
                    );
                    tokio::time::sleep(self.backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
    Succeeded,
    Failed,
    /// Scaled up, then scaled back down after a later step failed
    Compensated,
    /// Scaled up, and scaling back down failed too
    CompensationFailed,
}

/// One scale call in a start or stop sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub workload: String,
    pub replicas: u32,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The failing call ran out of time rather than being refused
    #[serde(skip)]
    pub timed_out: bool,
}

/// Ordered record of the steps of one start or stop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StepReport {
    pub steps: Vec<StepOutcome>,
}

impl StepReport {
    fn push_ok(&mut self, workload: &str, replicas: u32) {
        self.steps.push(StepOutcome {
            workload: workload.to_string(),
            replicas,
            status: StepStatus::Succeeded,
            error: None,
            timed_out: false,
        });
    }

    fn push_failed(&mut self, workload: &str, replicas: u32, error: String, timed_out: bool) {
        self.steps.push(StepOutcome {
            workload: workload.to_string(),
            replicas,
            status: StepStatus::Failed,
            error: Some(error),
            timed_out,
        });
    }

    fn with_status(&self, status: StepStatus) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.workload.as_str())
            .collect()
    }

    pub fn succeeded(&self) -> Vec<&str> {
        self.with_status(StepStatus::Succeeded)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.with_status(StepStatus::Failed)
    }

    pub fn compensated(&self) -> Vec<&str> {
        self.with_status(StepStatus::Compensated)
    }

    pub fn has_failures(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s.status, StepStatus::Failed | StepStatus::CompensationFailed))
    }

    /// True when a failed step failed by running out of time
    pub fn timed_out(&self) -> bool {
        self.steps.iter().any(|s| {
            s.timed_out
                && matches!(s.status, StepStatus::Failed | StepStatus::CompensationFailed)
        })
    }
}

/// Scale each target down to zero, continuing past failures
pub async fn scale_down_all(
    cluster: &dyn ClusterClient,
    namespace: &str,
    targets: &[String],
    retry: RetryPolicy,
) -> StepReport {
    let mut report = StepReport::default();
    for workload in targets {
        match retry.scale_down(cluster, workload, namespace).await {
            Ok(_) => report.push_ok(workload, 0),
            Err(e) => report.push_failed(workload, 0, e.to_string(), e.is_timeout()),
        }
    }
    report
}

/// Forward scale-up with reverse compensation
pub struct ScaleSaga<'a> {
    cluster: &'a dyn ClusterClient,
    namespace: &'a str,
    retry: RetryPolicy,
    completed: Vec<String>,
    report: StepReport,
}

impl<'a> ScaleSaga<'a> {
    pub fn new(cluster: &'a dyn ClusterClient, namespace: &'a str, retry: RetryPolicy) -> Self {
        Self {
            cluster,
            namespace,
            retry,
            completed: Vec::new(),
            report: StepReport::default(),
        }
    }

    /// Scale `targets` up in order, stopping at the first failure.
    ///
    /// No new call is issued once `cancel` fires; an in-flight call is
    /// abandoned (which kills a `kubectl` child).
    pub async fn run(
        &mut self,
        targets: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), LifecycleError> {
        for workload in targets {
            if cancel.is_cancelled() {
                return Err(LifecycleError::Cancelled);
            }

            let call = self
                .cluster
                .scale(workload, RUNNING_REPLICAS, self.namespace);
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(LifecycleError::Cancelled),
                r = call => r.map_err(LifecycleError::from),
            };

            match result {
                Ok(_) => {
                    self.report.push_ok(workload, RUNNING_REPLICAS);
                    self.completed.push(workload.clone());
                }
                Err(e) => {
                    self.report
                        .push_failed(workload, RUNNING_REPLICAS, e.to_string(), e.is_timeout());
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Workloads scaled up so far and not compensated
    pub fn completed(&self) -> &[String] {
        &self.completed
    }

    /// Undo every completed step, newest first. Ignores cancellation.
    ///
    /// Returns the workloads that could not be scaled back down.
    pub async fn compensate(&mut self) -> Vec<String> {
        let mut stuck = Vec::new();
        while let Some(workload) = self.completed.pop() {
            let result = self
                .retry
                .scale_down(self.cluster, &workload, self.namespace)
                .await;

            let step = self
                .report
                .steps
                .iter_mut()
                .rev()
                .find(|s| s.workload == workload && s.status == StepStatus::Succeeded);

            match result {
                Ok(_) => {
                    info!("Compensated scale-up of {}", workload);
                    if let Some(step) = step {
                        step.status = StepStatus::Compensated;
                    }
                }
                Err(e) => {
                    warn!("Could not compensate scale-up of {}: {}", workload, e);
                    if let Some(step) = step {
                        step.status = StepStatus::CompensationFailed;
                        step.error = Some(e.to_string());
                        step.timed_out = e.is_timeout();
                    }
                    stuck.push(workload);
                }
            }
        }
        stuck.reverse();
        stuck
    }

    pub fn report(&self) -> &StepReport {
        &self.report
    }

    pub fn into_report(self) -> StepReport {
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::DryRunClusterClient;

    fn targets() -> Vec<String> {
        vec!["consumer".into(), "p-ecg".into(), "p-spo2".into()]
    }

    fn quick() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_saga_success() {
        let cluster = DryRunClusterClient::new();
        let mut saga = ScaleSaga::new(&cluster, "ns", quick());

        saga.run(&targets(), &CancellationToken::new()).await.unwrap();

        assert_eq!(saga.completed(), targets().as_slice());
        assert_eq!(saga.report().succeeded(), vec!["consumer", "p-ecg", "p-spo2"]);
    }

    #[tokio::test]
    async fn test_saga_failure_compensates_in_reverse() {
        let cluster = DryRunClusterClient::new();
        cluster.fail_scale("p-spo2", 1, 1).await;
        let mut saga = ScaleSaga::new(&cluster, "ns", quick());

        let result = saga.run(&targets(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(LifecycleError::Cluster(_))));

        let stuck = saga.compensate().await;
        assert!(stuck.is_empty());

        let report = saga.into_report();
        assert_eq!(report.compensated(), vec!["consumer", "p-ecg"]);
        assert_eq!(report.failed(), vec!["p-spo2"]);

        let downs: Vec<(String, u32)> = cluster
            .scale_calls()
            .await
            .into_iter()
            .filter(|(_, r)| *r == 0)
            .collect();
        assert_eq!(
            downs,
            vec![("p-ecg".to_string(), 0), ("consumer".to_string(), 0)]
        );
    }

    #[tokio::test]
    async fn test_saga_cancelled_before_start() {
        let cluster = DryRunClusterClient::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut saga = ScaleSaga::new(&cluster, "ns", quick());

        let result = saga.run(&targets(), &cancel).await;
        assert!(matches!(result, Err(LifecycleError::Cancelled)));
        assert!(cluster.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_compensation_failure_is_reported() {
        let cluster = DryRunClusterClient::new();
        cluster.fail_scale("p-ecg", 1, 1).await;
        cluster.fail_scale("consumer", 0, 10).await;
        let mut saga = ScaleSaga::new(&cluster, "ns", quick());

        assert!(saga.run(&targets(), &CancellationToken::new()).await.is_err());
        let stuck = saga.compensate().await;

        assert_eq!(stuck, vec!["consumer".to_string()]);
        assert!(saga.report().has_failures());
        assert_eq!(
            saga.report().steps[0].status,
            StepStatus::CompensationFailed
        );
    }

    #[tokio::test]
    async fn test_scale_down_retries() {
        let cluster = DryRunClusterClient::new();
        cluster.fail_scale("consumer", 0, 2).await;

        let report = scale_down_all(&cluster, "ns", &["consumer".to_string()], quick()).await;

        assert!(!report.has_failures());
        assert_eq!(cluster.calls().await.len(), 3);
    }

    #[tokio::test]
    async fn test_scale_down_continues_past_failures() {
        let cluster = DryRunClusterClient::new();
        cluster.fail_scale("consumer", 0, 5).await;

        let report = scale_down_all(&cluster, "ns", &targets(), quick()).await;

        assert_eq!(report.failed(), vec!["consumer"]);
        assert_eq!(report.succeeded(), vec!["p-ecg", "p-spo2"]);
    }

    #[test]
    fn test_report_serializes_as_list() {
        let mut report = StepReport::default();
        report.push_ok("consumer", 1);
        report.push_failed("p-ecg", 1, "boom".into(), true);
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.is_array());
        assert_eq!(json[1]["status"], "failed");
        assert_eq!(json[1]["error"], "boom");
        assert!(json[0].get("error").is_none());
        assert!(json[1].get("timed_out").is_none());
    }

    #[tokio::test]
    async fn test_scale_down_timeout_is_flagged() {
        let cluster = DryRunClusterClient::new().with_timeout(Duration::from_millis(10));
        cluster.hang_scale("consumer", 0).await;
        cluster.fail_scale("p-ecg", 0, 5).await;

        let report = scale_down_all(&cluster, "ns", &targets(), RetryPolicy::no_retry()).await;

        assert_eq!(report.failed(), vec!["consumer", "p-ecg"]);
        assert!(report.steps[0].timed_out);
        assert!(!report.steps[1].timed_out);
        assert!(report.timed_out());
    }

    #[tokio::test]
    async fn test_refused_scale_down_is_not_a_timeout() {
        let cluster = DryRunClusterClient::new();
        cluster.fail_scale("consumer", 0, 5).await;

        let report = scale_down_all(&cluster, "ns", &targets(), RetryPolicy::no_retry()).await;

        assert!(report.has_failures());
        assert!(!report.timed_out());
    }
}
