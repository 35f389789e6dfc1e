//! # Room lifecycle
//!
//! Drives a room through commit, start and stop. Every operation on a room
//! holds that room's lock for its whole duration, so a room never sees two
//! operations interleave; different rooms proceed in parallel.
//!
//! ```text
//! Uninitialized --commit--> Committing --ok--> Idle --start--> Committing --ok--> Running
//!                                                ^                                   |
//!                                                +------------- Stopping <---stop----+
//! ```

use thiserror::Error;

use crate::cluster::ClusterError;
use crate::ingress::IngressError;
use crate::manifest::ManifestError;
use crate::store::StoreError;

mod controller;
mod saga;
mod state;

pub use controller::{CommitReport, ControllerConfig, RoomController, StartHandle, DEFAULT_BASE_PORT};
pub use saga::{RetryPolicy, ScaleSaga, StepOutcome, StepReport, StepStatus};
pub use state::{RoomState, RoomStatus};

/// Errors surfaced by lifecycle operations
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Room {0} not found")]
    NotFound(i64),

    #[error("Room {room_id} is {state}; cannot {action}")]
    Conflict {
        room_id: i64,
        state: RoomState,
        action: &'static str,
    },

    #[error("Room {room_id} has more than one device of type '{device_type}'")]
    DuplicateDeviceType { room_id: i64, device_type: String },

    #[error("Room {room_id} cannot be given a port: {reason}")]
    InvalidRoom { room_id: i64, reason: String },

    #[error("{action} of room {room_id} did not complete: {cause}")]
    PartialFailure {
        room_id: i64,
        action: &'static str,
        cause: String,
        timed_out: bool,
        report: StepReport,
    },

    #[error("Operation was cancelled")]
    Cancelled,

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Ingress(#[from] IngressError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LifecycleError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::RoomNotFound(id) => LifecycleError::NotFound(id),
            other => LifecycleError::Store(other),
        }
    }
}

impl LifecycleError {
    /// True when the failure came from a bounded external call running out of time
    pub fn is_timeout(&self) -> bool {
        match self {
            LifecycleError::Cluster(e) => e.is_timeout(),
            LifecycleError::PartialFailure { timed_out, .. } => *timed_out,
            _ => false,
        }
    }

    /// Per-step detail, when the failure happened mid-sequence
    pub fn report(&self) -> Option<&StepReport> {
        match self {
            LifecycleError::PartialFailure { report, .. } => Some(report),
            _ => None,
        }
    }
}
