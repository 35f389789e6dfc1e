//! HTTP surface driven through `tower::ServiceExt::oneshot`

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use orfleet::cluster::DryRunClusterClient;
use orfleet::config::ServerSettings;
use orfleet::ingress::{IngressDocument, IngressRegistry, MemoryIngressStore, DEFAULT_INGRESS_HOST};
use orfleet::manifest::provider_deployment_name;
use orfleet::room::{ControllerConfig, RetryPolicy, RoomController};
use orfleet::server::{build_app_router, AppState};
use orfleet::store::{Device, InMemoryStore, Room};

const ROOM_UUID: &str = "6f1c2a4e-8d7b-4c1a-9e2f-3b5d7a9c1e20";

struct TestApp {
    router: Router,
    store: Arc<InMemoryStore>,
    cluster: Arc<DryRunClusterClient>,
}

fn room_uuid() -> Uuid {
    Uuid::parse_str(ROOM_UUID).unwrap()
}

fn test_app() -> TestApp {
    let store = Arc::new(InMemoryStore::new());
    store.insert_room(Room {
        id: 7,
        uuid: room_uuid(),
        name: "OR 7".into(),
        location: None,
        unsaved_changes: true,
        assignment_version: 0,
    });
    for (id, device_type) in [(1, "ecg_module"), (2, "spo2")] {
        store.insert_device(Device {
            id,
            uuid: Uuid::new_v4(),
            device_type: device_type.into(),
            room_id: Some(7),
        });
    }

    let cluster = Arc::new(DryRunClusterClient::new());
    let ingress = IngressRegistry::new(Arc::new(MemoryIngressStore::new(
        IngressDocument::with_host("or-ecosystem", DEFAULT_INGRESS_HOST),
    )));
    let config = ControllerConfig {
        scale_down: RetryPolicy::no_retry(),
        ..Default::default()
    };
    let controller = RoomController::new(
        store.clone(),
        store.clone(),
        cluster.clone(),
        Arc::new(ingress),
        config,
    );

    let state = AppState::new(Arc::new(controller)).with_store(store.clone());
    TestApp {
        router: build_app_router(state, &ServerSettings::default()),
        store,
        cluster,
    }
}

fn post(uri: &str, body: Option<&str>) -> Request<Body> {
    let builder = Request::builder().method("POST").uri(uri);
    match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_commit_changes_clears_dirty_flag() {
    let app = test_app();

    let response = app
        .router
        .oneshot(post("/rooms/commitChanges", Some(r#"{"id": 7}"#)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(!app.store.room(7).unwrap().unsaved_changes);
}

#[tokio::test]
async fn test_start_devices_returns_stream_handle() {
    let app = test_app();

    let response = app
        .router
        .oneshot(post("/rooms/7/startDevices", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "available");
    assert_eq!(body["wsUuid"], ROOM_UUID);
    assert_eq!(body["operationID"], 1);
}

#[tokio::test]
async fn test_stop_devices_message() {
    let app = test_app();
    app.router
        .clone()
        .oneshot(post("/rooms/7/startDevices", None))
        .await
        .unwrap();

    let response = app
        .router
        .oneshot(post("/rooms/7/stopDevices", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["message"], "Disconnected (pods down)");
}

#[tokio::test]
async fn test_status_after_start() {
    let app = test_app();
    app.router
        .clone()
        .oneshot(post("/rooms/7/startDevices", None))
        .await
        .unwrap();

    let response = app
        .router
        .oneshot(
            Request::builder()
                .uri("/rooms/7/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["state"], "running");
    assert_eq!(body["active"], true);
    assert_eq!(body["unsavedChanges"], false);
}

#[tokio::test]
async fn test_second_start_conflicts() {
    let app = test_app();
    app.router
        .clone()
        .oneshot(post("/rooms/7/startDevices", None))
        .await
        .unwrap();

    let response = app
        .router
        .oneshot(post("/rooms/7/startDevices", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(app.store.operations_for_room(7).len(), 1);
}

#[tokio::test]
async fn test_duplicate_device_type_conflicts() {
    let app = test_app();
    app.store.insert_device(Device {
        id: 3,
        uuid: Uuid::new_v4(),
        device_type: "spo2".into(),
        room_id: Some(7),
    });

    let response = app
        .router
        .oneshot(post("/rooms/commitChanges", Some(r#"{"id": 7}"#)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("spo2"));
}

#[tokio::test]
async fn test_failed_start_reports_steps() {
    let app = test_app();
    app.cluster
        .fail_scale(&provider_deployment_name(&room_uuid(), "spo2"), 1, 1)
        .await;

    let response = app
        .router
        .oneshot(post("/rooms/7/startDevices", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = json_body(response).await;
    let steps = body["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 3);
    assert_eq!(steps[0]["status"], "compensated");
    assert_eq!(steps[2]["status"], "failed");
}

#[tokio::test]
async fn test_unknown_room_is_404() {
    let app = test_app();

    let response = app
        .router
        .oneshot(post("/rooms/99/startDevices", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("99"));
}

#[tokio::test]
async fn test_cors_preflight_allows_dashboard_origin() {
    let app = test_app();

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/rooms/7/startDevices")
                .header(header::ORIGIN, "http://localhost:3001")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "http://localhost:3001"
    );
}
