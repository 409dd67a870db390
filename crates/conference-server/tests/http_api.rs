//! HTTP API tests against the full router.
//!
//! Requests go through `build_routes` with `tower::ServiceExt::oneshot`, so
//! identity middleware, error mapping and handlers are exercised together.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use conference_server::actors::{ActorMetrics, Participant, RegistryConfig, RoomRegistryHandle};
use conference_server::engine::EngineHub;
use conference_server::middleware::{PARTICIPANT_ID_HEADER, PARTICIPANT_NAME_HEADER};
use conference_server::routes::{build_routes, AppState};
use conference_test_utils::{connect_socket, participant, test_config};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

// ============================================================================
// Helpers
// ============================================================================

struct TestApp {
    router: Router,
    registry: RoomRegistryHandle,
}

fn app() -> TestApp {
    let config = test_config();
    let engines = Arc::new(EngineHub::new(config.engine_token.clone()));
    let registry = RoomRegistryHandle::new(
        RegistryConfig::from(&config),
        engines.clone(),
        ActorMetrics::new(),
    );
    let state = Arc::new(AppState {
        registry: registry.clone(),
        engines,
        config,
    });
    TestApp {
        router: build_routes(state),
        registry,
    }
}

fn request(method: Method, uri: &str, who: Option<&Participant>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(who) = who {
        builder = builder
            .header(PARTICIPANT_ID_HEADER, who.id.to_string())
            .header(PARTICIPANT_NAME_HEADER, who.name.as_str());
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn create(app: &TestApp, who: &Participant, body: Value) -> (StatusCode, Value) {
    send(app, request(Method::POST, "/rooms", Some(who), Some(body))).await
}

// ============================================================================
// Identity
// ============================================================================

#[tokio::test]
async fn test_missing_identity_is_bad_request() {
    let app = app();
    let (status, body) = send(&app, request(Method::GET, "/rooms", None, None)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_reserved_name_is_bad_request() {
    let app = app();
    let mut engine = participant("alice");
    engine.name = "@sfu".to_string();

    let (status, _) = send(&app, request(Method::GET, "/rooms", Some(&engine), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ============================================================================
// Rooms
// ============================================================================

#[tokio::test]
async fn test_create_then_list() {
    let app = app();
    let alice = participant("alice");

    let (status, room) = create(&app, &alice, json!({ "name": "standup" })).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(room["name"], "standup");
    assert_eq!(room["public"], true);
    assert_eq!(room["architecture"], "mesh");
    assert_eq!(room["creator"]["name"], "alice");

    create(&app, &alice, json!({ "name": "board", "password": "pw" })).await;

    let (status, listed) = send(&app, request(Method::GET, "/rooms", Some(&alice), None)).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = listed
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["standup"]);
}

#[tokio::test]
async fn test_create_rejects_bad_bodies() {
    let app = app();
    let alice = participant("alice");

    let (status, _) = send(
        &app,
        Request::builder()
            .method(Method::POST)
            .uri("/rooms")
            .header(PARTICIPANT_ID_HEADER, alice.id.to_string())
            .header(PARTICIPANT_NAME_HEADER, "alice")
            .body(Body::from("{not json"))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = create(&app, &alice, json!({ "name": "   " })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = create(&app, &alice, json!({ "name": "x", "max_members": 0 })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = create(
        &app,
        &alice,
        json!({ "name": "x", "max_empty_minutes": u64::MAX }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_duplicate_name_conflicts() {
    let app = app();
    let alice = participant("alice");

    create(&app, &alice, json!({ "name": "standup" })).await;
    let (status, body) = create(&app, &participant("bob"), json!({ "name": "standup" })).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "NAME_IN_USE");
}

#[tokio::test]
async fn test_private_room_info_needs_password() {
    let app = app();
    let alice = participant("alice");
    let (_, room) = create(&app, &alice, json!({ "name": "board", "password": "pw" })).await;
    let id = room["id"].as_str().unwrap();

    let (status, _) = send(&app, request(Method::GET, &format!("/rooms/{id}"), Some(&alice), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, info) = send(
        &app,
        request(Method::GET, &format!("/rooms/{id}?password=pw"), Some(&alice), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["public"], false);
}

#[tokio::test]
async fn test_unknown_room_is_not_found() {
    let app = app();
    let alice = participant("alice");
    let uri = format!("/rooms/{}", uuid::Uuid::new_v4());

    let (status, body) = send(&app, request(Method::GET, &uri, Some(&alice), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_join_requires_socket_then_succeeds() {
    let app = app();
    let alice = participant("alice");
    let (_, room) = create(&app, &alice, json!({ "name": "standup" })).await;
    let uri = format!("/rooms/{}/members", room["id"].as_str().unwrap());

    let (status, body) = send(&app, request(Method::POST, &uri, Some(&alice), None)).await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(body["error"]["code"], "NO_TRANSPORT");

    let _socket = connect_socket(&app.registry, &alice).await;
    let (status, info) = send(&app, request(Method::POST, &uri, Some(&alice), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["members"], json!(["alice"]));

    let (status, _) = send(&app, request(Method::DELETE, &uri, Some(&alice), None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, request(Method::DELETE, &uri, Some(&alice), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_only_creator_closes() {
    let app = app();
    let alice = participant("alice");
    let bob = participant("bob");
    let (_, room) = create(&app, &alice, json!({ "name": "standup" })).await;
    let uri = format!("/rooms/{}", room["id"].as_str().unwrap());

    let (status, _) = send(&app, request(Method::DELETE, &uri, Some(&bob), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, request(Method::DELETE, &uri, Some(&alice), None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, request(Method::GET, &uri, Some(&alice), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
