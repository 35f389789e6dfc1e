//! Commit, start and stop orchestration

use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::saga::{scale_down_all, RetryPolicy, ScaleSaga, StepReport};
use super::state::{RoomRuntime, RoomSlot, RoomState, RoomStatus};
use super::LifecycleError;
use crate::cluster::{ClusterClient, DEFAULT_NAMESPACE};
use crate::ingress::{IngressRegistry, RouteChange};
use crate::manifest::{
    consumer_deployment_name, provider_deployment_name, provider_refs, room_port, ManifestError,
    ProviderRef, TemplateSource, WorkloadSet,
};
use crate::store::{Device, OperationStore, Room, RoomStore};

/// Port of room 0; room `n` listens on `DEFAULT_BASE_PORT + n`
pub const DEFAULT_BASE_PORT: u16 = 8000;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub namespace: String,
    pub base_port: u16,
    /// Re-read on every commit, so template edits apply without a restart
    pub templates: TemplateSource,
    /// Where rendered descriptors are written; `None` keeps them in memory only
    pub output_dir: Option<PathBuf>,
    pub scale_down: RetryPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            base_port: DEFAULT_BASE_PORT,
            templates: TemplateSource::Builtin,
            output_dir: None,
            scale_down: RetryPolicy::default(),
        }
    }
}

/// Result of a successful commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitReport {
    pub room_id: i64,
    pub room_uuid: Uuid,
    pub port: u16,
    /// Applied descriptor names, in apply order
    pub descriptors: Vec<String>,
    pub route: RouteChange,
}

/// Result of a successful start
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartHandle {
    pub room_id: i64,
    pub room_uuid: Uuid,
    pub operation_id: i64,
    /// Deployments scaled to one replica, in scale-up order
    pub workloads: Vec<String>,
}

/// Owns the per-room state machines
pub struct RoomController {
    rooms: Arc<dyn RoomStore>,
    operations: Arc<dyn OperationStore>,
    cluster: Arc<dyn ClusterClient>,
    ingress: Arc<IngressRegistry>,
    config: ControllerConfig,
    slots: DashMap<i64, Arc<RoomSlot>>,
}

/// Run `fut` unless `cancel` fires first
async fn guarded<T, E, F>(cancel: &CancellationToken, fut: F) -> Result<T, LifecycleError>
where
    F: Future<Output = Result<T, E>>,
    LifecycleError: From<E>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LifecycleError::Cancelled),
        r = fut => r.map_err(LifecycleError::from),
    }
}

/// Providers in type order; a second device of the same type is rejected
fn providers_for(room_id: i64, devices: &[Device]) -> Result<Vec<ProviderRef>, LifecycleError> {
    provider_refs(devices.iter().map(|d| (d.device_type.as_str(), d.uuid))).map_err(|e| match e {
        ManifestError::DuplicateProviderType(device_type) => LifecycleError::DuplicateDeviceType {
            room_id,
            device_type,
        },
        other => LifecycleError::Manifest(other),
    })
}

impl RoomController {
    pub fn new(
        rooms: Arc<dyn RoomStore>,
        operations: Arc<dyn OperationStore>,
        cluster: Arc<dyn ClusterClient>,
        ingress: Arc<IngressRegistry>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            rooms,
            operations,
            cluster,
            ingress,
            config,
            slots: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    fn slot(&self, room_id: i64) -> Arc<RoomSlot> {
        self.slots
            .entry(room_id)
            .or_insert_with(|| Arc::new(RoomSlot::new()))
            .clone()
    }

    /// Current state of a room without waiting for a running operation
    pub async fn status(&self, room_id: i64) -> Result<RoomStatus, LifecycleError> {
        let room = self.rooms.get_room_by_id(room_id).await?;
        let state = self
            .slots
            .get(&room_id)
            .map(|s| s.state())
            .unwrap_or_default();
        Ok(RoomStatus {
            room_id,
            room_uuid: room.uuid,
            state,
            active: state.is_active(),
            unsaved_changes: room.unsaved_changes,
        })
    }

    /// Follow a room's state transitions
    pub async fn watch(&self, room_id: i64) -> Result<watch::Receiver<RoomState>, LifecycleError> {
        self.rooms.get_room_by_id(room_id).await?;
        Ok(self.slot(room_id).subscribe())
    }

    /// Render, persist and apply the room's descriptors and register its route.
    ///
    /// Refused while the room is running. On failure the room is left dirty.
    pub async fn commit(
        &self,
        room_id: i64,
        cancel: &CancellationToken,
    ) -> Result<CommitReport, LifecycleError> {
        let room = self.rooms.get_room_by_id(room_id).await?;
        let slot = self.slot(room_id);
        let _runtime = slot.runtime.lock().await;

        let previous = slot.state();
        if previous == RoomState::Running {
            return Err(LifecycleError::Conflict {
                room_id,
                state: previous,
                action: "commit",
            });
        }

        slot.set_state(RoomState::Committing);
        match self.commit_locked(&room, cancel).await {
            Ok((report, _)) => {
                slot.set_state(RoomState::Idle);
                info!(
                    room_id,
                    room_uuid = %room.uuid,
                    descriptors = report.descriptors.len(),
                    "Room committed"
                );
                Ok(report)
            }
            Err(e) => {
                slot.set_state(previous);
                self.mark_dirty_after_failure(room_id, &e).await;
                Err(e)
            }
        }
    }

    async fn commit_locked(
        &self,
        room: &Room,
        cancel: &CancellationToken,
    ) -> Result<(CommitReport, WorkloadSet), LifecycleError> {
        // Read before the devices so a reassignment from here on keeps the room dirty
        let seen_version = self.rooms.get_room_by_id(room.id).await?.assignment_version;
        let devices = self.rooms.list_devices_for_room(room.id).await?;
        let providers = providers_for(room.id, &devices)?;
        let device_uuids: Vec<Uuid> = devices.iter().map(|d| d.uuid).collect();

        let port = room_port(self.config.base_port, room.id).ok_or_else(|| {
            LifecycleError::InvalidRoom {
                room_id: room.id,
                reason: format!(
                    "base port {} + room id {} is not a valid port",
                    self.config.base_port, room.id
                ),
            }
        })?;

        let generator = self.config.templates.load().await?;
        let set = generator.render_workload_set(&room.uuid, port, &device_uuids, &providers)?;

        if let Some(dir) = &self.config.output_dir {
            set.persist(dir).await?;
        }

        let mut applied = Vec::new();
        for descriptor in set.descriptors() {
            guarded(
                cancel,
                self.cluster.apply(descriptor, &self.config.namespace),
            )
            .await?;
            debug!("Applied {}", descriptor.name);
            applied.push(descriptor.name.clone());
        }

        let route = guarded(cancel, self.ingress.register_route(&room.uuid, port)).await?;

        let ingress = guarded(cancel, self.ingress.descriptor()).await?;
        guarded(cancel, self.cluster.apply(&ingress, &self.config.namespace)).await?;
        debug!("Applied ingress {}", ingress.name);
        applied.push(ingress.name);

        if !self.rooms.clear_dirty_if(room.id, seen_version).await? {
            warn!(
                room_id = room.id,
                "Device assignment changed during commit; room stays dirty"
            );
        }

        let report = CommitReport {
            room_id: room.id,
            room_uuid: room.uuid,
            port,
            descriptors: applied,
            route,
        };
        Ok((report, set))
    }

    async fn mark_dirty_after_failure(&self, room_id: i64, cause: &LifecycleError) {
        warn!(room_id, "Commit failed: {}", cause);
        if let Err(e) = self.rooms.mark_dirty(room_id).await {
            error!(room_id, "Could not mark room dirty after failed commit: {}", e);
        }
    }

    /// Commit, then bring every workload of the room to one replica.
    ///
    /// Scale-up runs as a saga: if any step fails, times out or is cancelled,
    /// the steps already taken are scaled back down in reverse order. On
    /// success exactly one operation record is opened.
    pub async fn start(
        &self,
        room_id: i64,
        cancel: &CancellationToken,
    ) -> Result<StartHandle, LifecycleError> {
        let room = self.rooms.get_room_by_id(room_id).await?;
        let slot = self.slot(room_id);
        let mut runtime = slot.runtime.lock().await;

        let previous = slot.state();
        if previous == RoomState::Running {
            return Err(LifecycleError::Conflict {
                room_id,
                state: previous,
                action: "start",
            });
        }

        slot.set_state(RoomState::Committing);
        let set = match self.commit_locked(&room, cancel).await {
            Ok((_, set)) => set,
            Err(e) => {
                slot.set_state(previous);
                self.mark_dirty_after_failure(room_id, &e).await;
                return Err(e);
            }
        };

        let targets = set.scale_targets();
        let mut saga = ScaleSaga::new(
            self.cluster.as_ref(),
            &self.config.namespace,
            self.config.scale_down,
        );

        let failure = match saga.run(&targets, cancel).await {
            Ok(()) => match self.operations.create_operation(room_id, Utc::now()).await {
                Ok(operation) => {
                    runtime.started = Some(targets.clone());
                    slot.set_state(RoomState::Running);
                    info!(
                        room_id,
                        room_uuid = %room.uuid,
                        operation_id = operation.id,
                        "Room started"
                    );
                    return Ok(StartHandle {
                        room_id,
                        room_uuid: room.uuid,
                        operation_id: operation.id,
                        workloads: targets,
                    });
                }
                Err(e) => LifecycleError::from(e),
            },
            Err(e) => e,
        };

        warn!(room_id, "Start failed, compensating: {}", failure);
        let stuck = saga.compensate().await;
        self.settle_failed_start(room_id, &slot, &mut runtime, &targets, &stuck);

        Err(LifecycleError::PartialFailure {
            room_id,
            action: "start",
            cause: failure.to_string(),
            timed_out: failure.is_timeout(),
            report: saga.into_report(),
        })
    }

    /// After compensation a room is idle, unless something could not be
    /// scaled down; then it stays running so that stop can be retried.
    fn settle_failed_start(
        &self,
        room_id: i64,
        slot: &RoomSlot,
        runtime: &mut RoomRuntime,
        targets: &[String],
        stuck: &[String],
    ) {
        if stuck.is_empty() {
            slot.set_state(RoomState::Idle);
        } else {
            error!(
                room_id,
                stuck = ?stuck,
                "Workloads still running after failed start; stop the room to retry"
            );
            runtime.started = Some(targets.to_vec());
            slot.set_state(RoomState::Running);
        }
    }

    /// Scale every workload of the room back to zero.
    ///
    /// Scale-downs are retried and always run to the end, regardless of
    /// cancellation; the room ends up idle even if some of them failed, and
    /// the failures are returned.
    pub async fn stop(&self, room_id: i64) -> Result<StepReport, LifecycleError> {
        let room = self.rooms.get_room_by_id(room_id).await?;
        let slot = self.slot(room_id);
        let mut runtime = slot.runtime.lock().await;

        let targets = match runtime.started.take() {
            Some(targets) => targets,
            None => self.derive_targets(&room).await?,
        };

        slot.set_state(RoomState::Stopping);
        let report = scale_down_all(
            self.cluster.as_ref(),
            &self.config.namespace,
            &targets,
            self.config.scale_down,
        )
        .await;
        slot.set_state(RoomState::Idle);

        if report.has_failures() {
            let failed = report.failed().join(", ");
            error!(room_id, failed = %failed, "Stop left workloads running");
            return Err(LifecycleError::PartialFailure {
                room_id,
                action: "stop",
                cause: format!("could not scale down {}", failed),
                timed_out: report.timed_out(),
                report,
            });
        }

        info!(room_id, room_uuid = %room.uuid, "Room stopped");
        Ok(report)
    }

    /// Consumer plus one provider per current device type
    async fn derive_targets(&self, room: &Room) -> Result<Vec<String>, LifecycleError> {
        let devices = self.rooms.list_devices_for_room(room.id).await?;
        let mut targets = vec![consumer_deployment_name(&room.uuid)];
        let types: BTreeSet<String> = devices
            .iter()
            .map(|d| d.device_type.to_lowercase())
            .collect();
        targets.extend(
            types
                .into_iter()
                .map(|t| provider_deployment_name(&room.uuid, &t)),
        );
        Ok(targets)
    }
}
