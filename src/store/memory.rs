//! In-process implementation of the persistence collaborators

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{Device, Operation, OperationStore, Room, RoomStore, StoreError};

/// Seed data for [`InMemoryStore`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub rooms: Vec<InventoryRoom>,
    #[serde(default)]
    pub devices: Vec<Device>,
}

/// A room entry in an inventory file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryRoom {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    /// Rooms loaded from an inventory have never been committed by this process
    #[serde(rename = "unsavedChanges", default = "default_unsaved")]
    pub unsaved_changes: bool,
}

fn default_unsaved() -> bool {
    true
}

impl From<InventoryRoom> for Room {
    fn from(r: InventoryRoom) -> Self {
        Room {
            id: r.id,
            uuid: r.uuid,
            name: r.name,
            location: r.location,
            unsaved_changes: r.unsaved_changes,
            assignment_version: 0,
        }
    }
}

/// Parse an inventory from YAML (JSON is valid YAML too)
pub fn parse_inventory(content: &str) -> Result<Inventory, StoreError> {
    let inventory: Inventory =
        serde_yaml::from_str(content).map_err(|e| StoreError::Inventory(e.to_string()))?;

    for device in &inventory.devices {
        if let Some(room_id) = device.room_id {
            if !inventory.rooms.iter().any(|r| r.id == room_id) {
                return Err(StoreError::Inventory(format!(
                    "device {} references unknown room {}",
                    device.id, room_id
                )));
            }
        }
    }

    Ok(inventory)
}

/// Load an inventory file from disk
pub fn load_inventory_file(path: &Path) -> Result<Inventory, StoreError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| StoreError::Inventory(format!("{}: {}", path.display(), e)))?;
    parse_inventory(&content)
}

/// Room, device and operation records held in memory
#[derive(Debug, Default)]
pub struct InMemoryStore {
    rooms: DashMap<i64, Room>,
    devices: DashMap<i64, Device>,
    operations: DashMap<i64, Operation>,
    next_operation_id: AtomicI64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            next_operation_id: AtomicI64::new(1),
            ..Default::default()
        }
    }

    pub fn from_inventory(inventory: Inventory) -> Self {
        let store = Self::new();
        for room in inventory.rooms {
            store.insert_room(room.into());
        }
        for device in inventory.devices {
            store.insert_device(device);
        }
        store
    }

    pub fn insert_room(&self, room: Room) {
        self.rooms.insert(room.id, room);
    }

    pub fn insert_device(&self, device: Device) {
        self.devices.insert(device.id, device);
    }

    /// Snapshot of a room record
    pub fn room(&self, id: i64) -> Option<Room> {
        self.rooms.get(&id).map(|r| r.clone())
    }

    /// Move a device into `room_id` (or unassign it with `None`).
    ///
    /// Both the previous and the new room become dirty, mirroring what the
    /// admin layer does when it edits an assignment.
    pub fn assign_device(&self, device_id: i64, room_id: Option<i64>) -> Result<(), StoreError> {
        if let Some(id) = room_id {
            if !self.rooms.contains_key(&id) {
                return Err(StoreError::RoomNotFound(id));
            }
        }

        let previous = {
            let mut device = self
                .devices
                .get_mut(&device_id)
                .ok_or(StoreError::DeviceNotFound(device_id))?;
            std::mem::replace(&mut device.room_id, room_id)
        };

        if previous == room_id {
            return Ok(());
        }

        for id in [previous, room_id].into_iter().flatten() {
            if let Some(mut room) = self.rooms.get_mut(&id) {
                room.unsaved_changes = true;
                room.assignment_version += 1;
            }
        }

        debug!(device_id, ?previous, ?room_id, "Device assignment changed");
        Ok(())
    }

    /// All operations recorded for a room, oldest first
    pub fn operations_for_room(&self, room_id: i64) -> Vec<Operation> {
        let mut ops: Vec<Operation> = self
            .operations
            .iter()
            .filter(|o| o.room_id == room_id)
            .map(|o| o.clone())
            .collect();
        ops.sort_by_key(|o| o.id);
        ops
    }

    fn set_dirty(&self, room_id: i64, dirty: bool) -> Result<(), StoreError> {
        let mut room = self
            .rooms
            .get_mut(&room_id)
            .ok_or(StoreError::RoomNotFound(room_id))?;
        room.unsaved_changes = dirty;
        if dirty {
            room.assignment_version += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl RoomStore for InMemoryStore {
    async fn get_room_by_id(&self, id: i64) -> Result<Room, StoreError> {
        self.room(id).ok_or(StoreError::RoomNotFound(id))
    }

    async fn list_devices_for_room(&self, room_id: i64) -> Result<Vec<Device>, StoreError> {
        if !self.rooms.contains_key(&room_id) {
            return Err(StoreError::RoomNotFound(room_id));
        }
        let mut devices: Vec<Device> = self
            .devices
            .iter()
            .filter(|d| d.room_id == Some(room_id))
            .map(|d| d.clone())
            .collect();
        devices.sort_by_key(|d| d.id);
        Ok(devices)
    }

    async fn mark_dirty(&self, room_id: i64) -> Result<(), StoreError> {
        self.set_dirty(room_id, true)
    }

    async fn clear_dirty(&self, room_id: i64) -> Result<(), StoreError> {
        self.set_dirty(room_id, false)
    }

    async fn clear_dirty_if(&self, room_id: i64, seen_version: u64) -> Result<bool, StoreError> {
        let mut room = self
            .rooms
            .get_mut(&room_id)
            .ok_or(StoreError::RoomNotFound(room_id))?;
        if room.assignment_version != seen_version {
            return Ok(false);
        }
        room.unsaved_changes = false;
        Ok(true)
    }
}

#[async_trait]
impl OperationStore for InMemoryStore {
    async fn create_operation(
        &self,
        room_id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<Operation, StoreError> {
        if !self.rooms.contains_key(&room_id) {
            return Err(StoreError::RoomNotFound(room_id));
        }
        let id = self.next_operation_id.fetch_add(1, Ordering::SeqCst);
        let operation = Operation {
            id,
            room_id,
            started_at,
            ended_at: None,
        };
        self.operations.insert(id, operation.clone());
        Ok(operation)
    }
}
