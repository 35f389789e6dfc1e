//! Collaborator seams for room, device and operation persistence
//!
//! The relational store lives outside this crate. The orchestrator only needs
//! the handful of calls below, so they are expressed as traits and the server
//! binary wires in [`InMemoryStore`] seeded from an inventory file.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod memory;

pub use memory::{load_inventory_file, parse_inventory, InMemoryStore, Inventory, InventoryRoom};

/// Errors returned by the persistence collaborators
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Room {0} not found")]
    RoomNotFound(i64),

    #[error("Device {0} not found")]
    DeviceNotFound(i64),

    #[error("Inventory error: {0}")]
    Inventory(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// An operating room as seen by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Dirty flag: the persisted device assignment differs from the last commit
    #[serde(rename = "unsavedChanges", default)]
    pub unsaved_changes: bool,
    /// Bumped whenever the room's device assignment changes
    #[serde(rename = "assignmentVersion", default)]
    pub assignment_version: u64,
}

/// A medical device simulator that may be assigned to a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub uuid: Uuid,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(rename = "roomId", default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<i64>,
}

/// A surgical operation opened when a room's devices are started
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: i64,
    #[serde(rename = "roomId")]
    pub room_id: i64,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "endedAt", default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Room and device lookups plus the dirty-flag toggles
#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn get_room_by_id(&self, id: i64) -> Result<Room, StoreError>;

    async fn list_devices_for_room(&self, room_id: i64) -> Result<Vec<Device>, StoreError>;

    async fn mark_dirty(&self, room_id: i64) -> Result<(), StoreError>;

    async fn clear_dirty(&self, room_id: i64) -> Result<(), StoreError>;

    /// Clear the dirty flag only if the assignment is still at `seen_version`.
    ///
    /// Returns `false` and leaves the room dirty when the assignment moved on.
    async fn clear_dirty_if(&self, room_id: i64, seen_version: u64) -> Result<bool, StoreError>;
}

/// Operation records
#[async_trait]
pub trait OperationStore: Send + Sync {
    async fn create_operation(
        &self,
        room_id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<Operation, StoreError>;
}
