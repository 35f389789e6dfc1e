use std::future::Future;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::room::{LifecycleError, RoomStatus};
use crate::server::error::ApiError;
use crate::server::state::AppState;

/// Body of `POST /rooms/commitChanges`
#[derive(Debug, Deserialize)]
pub struct CommitRequest {
    pub id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartResponse {
    pub status: String,
    #[serde(rename = "wsUuid")]
    pub ws_uuid: Uuid,
    #[serde(rename = "operationID")]
    pub operation_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StopResponse {
    pub message: String,
}

/// Run a lifecycle operation on its own task.
///
/// The operation gets a token that is cancelled when this future is dropped,
/// i.e. when the client goes away, so it can compensate and release the room
/// instead of being torn down halfway.
async fn run_cancellable<T, F, Fut>(op: F) -> Result<T, ApiError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, LifecycleError>> + Send + 'static,
    T: Send + 'static,
{
    let token = CancellationToken::new();
    let _cancel_on_drop = token.clone().drop_guard();
    let task = tokio::spawn(op(token));
    let result = task
        .await
        .map_err(|e| ApiError::Internal(format!("operation task failed: {}", e)))?;
    Ok(result?)
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

/// Render and apply a room's descriptors, leaving every workload at zero replicas
pub async fn commit_changes(
    State(state): State<AppState>,
    Json(request): Json<CommitRequest>,
) -> Result<StatusCode, ApiError> {
    let controller = state.controller.clone();
    run_cancellable(move |cancel| async move { controller.commit(request.id, &cancel).await })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn start_devices(
    State(state): State<AppState>,
    Path(room_id): Path<i64>,
) -> Result<Json<StartResponse>, ApiError> {
    let controller = state.controller.clone();
    let handle =
        run_cancellable(move |cancel| async move { controller.start(room_id, &cancel).await })
            .await?;

    Ok(Json(StartResponse {
        status: "available".to_string(),
        ws_uuid: handle.room_uuid,
        operation_id: handle.operation_id,
    }))
}

/// Scale a room down. Runs to completion even if the client disconnects.
pub async fn stop_devices(
    State(state): State<AppState>,
    Path(room_id): Path<i64>,
) -> Result<Json<StopResponse>, ApiError> {
    let controller = state.controller.clone();
    tokio::spawn(async move { controller.stop(room_id).await })
        .await
        .map_err(|e| ApiError::Internal(format!("stop task failed: {}", e)))??;

    Ok(Json(StopResponse {
        message: "Disconnected (pods down)".to_string(),
    }))
}

pub async fn room_status(
    State(state): State<AppState>,
    Path(room_id): Path<i64>,
) -> Result<Json<RoomStatus>, ApiError> {
    Ok(Json(state.controller.status(room_id).await?))
}

/// Create the Axum router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/rooms/commitChanges", post(commit_changes))
        .route("/rooms/{id}/startDevices", post(start_devices))
        .route("/rooms/{id}/stopDevices", post(stop_devices))
        .route("/rooms/{id}/status", get(room_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::DryRunClusterClient;
    use crate::ingress::{IngressDocument, IngressRegistry, MemoryIngressStore, DEFAULT_INGRESS_HOST};
    use crate::room::{ControllerConfig, RoomController};
    use crate::store::{Device, InMemoryStore, Room};
    use axum::{body::Body, http::Request};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn create_test_app() -> Router {
        let store = Arc::new(InMemoryStore::new());
        store.insert_room(Room {
            id: 3,
            uuid: Uuid::parse_str("0d3b6c2a-1f4e-4a7b-8c9d-2e5f6a7b8c90").unwrap(),
            name: "OR 3".into(),
            location: None,
            unsaved_changes: true,
            assignment_version: 0,
        });
        store.insert_device(Device {
            id: 1,
            uuid: Uuid::new_v4(),
            device_type: "spo2".into(),
            room_id: Some(3),
        });

        let ingress = IngressRegistry::new(Arc::new(MemoryIngressStore::new(
            IngressDocument::with_host("or-ecosystem", DEFAULT_INGRESS_HOST),
        )));
        let controller = RoomController::new(
            store.clone(),
            store.clone(),
            Arc::new(DryRunClusterClient::new()),
            Arc::new(ingress),
            ControllerConfig::default(),
        );
        create_router(AppState::new(Arc::new(controller)).with_store(store))
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = create_test_app();

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_commit_returns_no_content() {
        let app = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/rooms/commitChanges")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"id": 3}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_status_unknown_room() {
        let app = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/rooms/42/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_start_devices_endpoint() {
        let app = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/rooms/3/startDevices")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
