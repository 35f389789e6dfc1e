//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return Results, I/O is handled by caller

use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::manifest::{provider_refs, room_port, ManifestError, ManifestGenerator, WorkloadSet};
use crate::server::{StartResponse, StopResponse};
use crate::store::{Inventory, StoreError};

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Inventory error: {0}")]
    Store(#[from] StoreError),

    #[error("Render error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Room {room_id}: {reason}")]
    InvalidRoom { room_id: i64, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Server error ({status}): {message}")]
    Server {
        status: u16,
        message: String,
        steps: Vec<StepView>,
    },
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

// ============================================================================
// Render Commands (Pure business logic)
// ============================================================================

/// Render a room from an inventory, exactly as a commit would
pub fn render_room(
    inventory: &Inventory,
    room_id: i64,
    base_port: u16,
    generator: &ManifestGenerator,
) -> CommandResult<WorkloadSet> {
    let room = inventory
        .rooms
        .iter()
        .find(|r| r.id == room_id)
        .ok_or(StoreError::RoomNotFound(room_id))?;

    let devices: Vec<_> = inventory
        .devices
        .iter()
        .filter(|d| d.room_id == Some(room_id))
        .collect();

    let providers = provider_refs(devices.iter().map(|d| (d.device_type.as_str(), d.uuid)))
        .map_err(|e| match e {
            ManifestError::DuplicateProviderType(device_type) => CommandError::InvalidRoom {
                room_id,
                reason: format!("more than one device of type '{}'", device_type),
            },
            other => CommandError::Manifest(other),
        })?;
    let device_uuids: Vec<Uuid> = devices.iter().map(|d| d.uuid).collect();

    let port = room_port(base_port, room_id).ok_or_else(|| CommandError::InvalidRoom {
        room_id,
        reason: format!("no valid port from base port {}", base_port),
    })?;

    Ok(generator.render_workload_set(&room.uuid, port, &device_uuids, &providers)?)
}

// ============================================================================
// HTTP Client for the orchestrator
// ============================================================================

/// A step as reported in an error body
#[derive(Debug, Clone, Deserialize)]
pub struct StepView {
    pub workload: String,
    pub replicas: u32,
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// Room status as returned by the server
#[derive(Debug, Clone, Deserialize)]
pub struct RoomStatusView {
    #[serde(rename = "roomId")]
    pub room_id: i64,
    #[serde(rename = "wsUuid")]
    pub ws_uuid: Uuid,
    pub state: String,
    pub active: bool,
    #[serde(rename = "unsavedChanges")]
    pub unsaved_changes: bool,
}

#[derive(Debug, Deserialize)]
struct ErrorView {
    error: String,
    #[serde(default)]
    steps: Vec<StepView>,
}

/// Client for a running orchestrator
pub struct RoomClient {
    client: reqwest::Client,
    base_url: String,
}

impl RoomClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Turn a non-success response into [`CommandError::Server`]
    async fn check(resp: reqwest::Response) -> CommandResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let text = resp.text().await.unwrap_or_default();
        let (message, steps) = match serde_json::from_str::<ErrorView>(&text) {
            Ok(body) => (body.error, body.steps),
            Err(_) if text.is_empty() => (status.to_string(), Vec::new()),
            Err(_) => (text, Vec::new()),
        };
        Err(CommandError::Server {
            status: status.as_u16(),
            message,
            steps,
        })
    }

    pub async fn commit(&self, room_id: i64) -> CommandResult<()> {
        let resp = self
            .client
            .post(self.url("/rooms/commitChanges"))
            .json(&serde_json::json!({ "id": room_id }))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    pub async fn start(&self, room_id: i64) -> CommandResult<StartResponse> {
        let resp = self
            .client
            .post(self.url(&format!("/rooms/{}/startDevices", room_id)))
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    pub async fn stop(&self, room_id: i64) -> CommandResult<StopResponse> {
        let resp = self
            .client
            .post(self.url(&format!("/rooms/{}/stopDevices", room_id)))
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    pub async fn status(&self, room_id: i64) -> CommandResult<RoomStatusView> {
        let resp = self
            .client
            .get(self.url(&format!("/rooms/{}/status", room_id)))
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }
}
