//! Per-room state and the slot that guards it

use std::fmt;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

/// Where a room is in its lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomState {
    /// Never committed by this process
    #[default]
    Uninitialized,
    /// Descriptors applied, every workload at zero replicas
    Idle,
    /// Rendering, applying and (during start) scaling up
    Committing,
    /// Every workload of the last start is at one replica
    Running,
    Stopping,
}

impl RoomState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomState::Uninitialized => "uninitialized",
            RoomState::Idle => "idle",
            RoomState::Committing => "committing",
            RoomState::Running => "running",
            RoomState::Stopping => "stopping",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, RoomState::Running)
    }
}

impl fmt::Display for RoomState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot returned by `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomStatus {
    #[serde(rename = "roomId")]
    pub room_id: i64,
    #[serde(rename = "wsUuid")]
    pub room_uuid: Uuid,
    pub state: RoomState,
    pub active: bool,
    #[serde(rename = "unsavedChanges")]
    pub unsaved_changes: bool,
}

/// Data only touched while the room lock is held
#[derive(Debug, Default)]
pub(crate) struct RoomRuntime {
    /// Deployments scaled up by the last start, in scale-up order
    pub started: Option<Vec<String>>,
}

/// Lock plus observable state for one room
#[derive(Debug)]
pub(crate) struct RoomSlot {
    pub runtime: Mutex<RoomRuntime>,
    state: watch::Sender<RoomState>,
}

impl RoomSlot {
    pub fn new() -> Self {
        let (state, _) = watch::channel(RoomState::default());
        Self {
            runtime: Mutex::new(RoomRuntime::default()),
            state,
        }
    }

    /// Current state without waiting for the room lock
    pub fn state(&self) -> RoomState {
        *self.state.borrow()
    }

    pub fn set_state(&self, state: RoomState) {
        self.state.send_replace(state);
    }

    pub fn subscribe(&self) -> watch::Receiver<RoomState> {
        self.state.subscribe()
    }
}
