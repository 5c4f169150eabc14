//! API integration tests.
//!
//! These tests drive the router over the in-memory backend.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
    response::Response,
};
use serde_json::Value;
use tally_api::{AppState, router as api_router};
use tally_common::RoomId;
use tally_core::{
    Choice, InMemoryBroadcaster, InMemoryVoteBackend, LockStore, MemoryLockStore, RoomVoteStore,
};
use tower::ServiceExt;

struct TestApp {
    backend: InMemoryVoteBackend,
    locks: MemoryLockStore,
    state: AppState,
}

impl TestApp {
    fn new() -> Self {
        let backend = InMemoryVoteBackend::new();
        let locks = MemoryLockStore::new();
        let store = Arc::new(RoomVoteStore::new(
            room(),
            Arc::new(backend.clone()),
            Arc::new(InMemoryBroadcaster::new()),
            Arc::new(locks.clone()),
        ));
        Self {
            backend,
            locks,
            state: AppState::new(store),
        }
    }

    fn router(&self) -> Router {
        api_router().with_state(self.state.clone())
    }

    async fn send(&self, method: &str, uri: &str, body: Option<&str>) -> Response {
        let mut request = Request::builder().uri(uri).method(method);
        if body.is_some() {
            request = request.header("Content-Type", "application/json");
        }
        let body = body.map_or_else(Body::empty, |b| Body::from(b.to_string()));
        self.router()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap()
    }
}

fn room() -> RoomId {
    RoomId::parse("apiroom").unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_room_endpoint_reports_state() {
    let app = TestApp::new();
    app.backend
        .seed(&room(), [Choice::Yes, Choice::Yes, Choice::No])
        .await;
    app.state.store.fetch_counts().await.unwrap();

    let response = app.send("GET", "/room", None).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["room"], "apiroom");
    assert_eq!(body["counts"]["yes"], 2);
    assert_eq!(body["counts"]["no"], 1);
    assert_eq!(body["total"], 3);
    assert_eq!(body["percentages"]["yes"], 67);
    assert_eq!(body["percentages"]["no"], 33);
    assert_eq!(body["loading"], false);
    assert_eq!(body["resetSignal"], 0);
    assert!(body["voted"].is_null());
}

#[tokio::test]
async fn test_vote_records_and_locks() {
    let app = TestApp::new();

    let response = app.send("POST", "/vote", Some(r#"{"choice":false}"#)).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["counts"]["no"], 1);
    assert_eq!(body["voted"], "no");
    assert_eq!(
        app.locks.get(&room().lock_key()).await.unwrap().as_deref(),
        Some("no")
    );
}

#[tokio::test]
async fn test_second_vote_is_conflict() {
    let app = TestApp::new();
    app.send("POST", "/vote", Some(r#"{"choice":true}"#)).await;

    let response = app.send("POST", "/vote", Some(r#"{"choice":true}"#)).await;

    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "ALREADY_VOTED");
    assert_eq!(app.backend.record_count(&room()).await, 1);
}

#[tokio::test]
async fn test_failed_vote_reports_write_error() {
    let app = TestApp::new();
    app.backend.set_fail_inserts(true);

    let response = app.send("POST", "/vote", Some(r#"{"choice":true}"#)).await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "WRITE_ERROR");
    assert!(app.locks.get(&room().lock_key()).await.unwrap().is_none());
    assert_eq!(app.state.room_response().total, 0);
}

#[tokio::test]
async fn test_vote_with_invalid_body_is_rejected() {
    let app = TestApp::new();

    let response = app.send("POST", "/vote", Some(r#"{"choice":"maybe"}"#)).await;

    assert!(response.status().is_client_error());
    assert_eq!(app.backend.record_count(&room()).await, 0);
}

#[tokio::test]
async fn test_reset_clears_room() {
    let app = TestApp::new();
    app.send("POST", "/vote", Some(r#"{"choice":true}"#)).await;

    let response = app.send("POST", "/reset", None).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["total"], 0);
    assert_eq!(body["resetSignal"], 1);
    assert!(body["voted"].is_null());
    assert_eq!(app.backend.record_count(&room()).await, 0);
}

#[tokio::test]
async fn test_failed_reset_reports_delete_error() {
    let app = TestApp::new();
    app.send("POST", "/vote", Some(r#"{"choice":true}"#)).await;
    app.backend.set_fail_deletes(true);

    let response = app.send("POST", "/reset", None).await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "DELETE_ERROR");
    assert_eq!(app.backend.record_count(&room()).await, 1);
}

#[tokio::test]
async fn test_room_endpoint_sees_lock_cleared_elsewhere() {
    let app = TestApp::new();
    app.send("POST", "/vote", Some(r#"{"choice":true}"#)).await;

    // Another process on this device cleared its storage.
    app.locks.remove(&room().lock_key()).await.unwrap();

    let body = json_body(app.send("GET", "/room", None).await).await;
    assert!(body["voted"].is_null());
}

#[tokio::test]
async fn test_stream_returns_event_stream() {
    let app = TestApp::new();

    let response = app.send("GET", "/stream", None).await;

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .map(|v| v.to_str().unwrap_or(""));
    assert!(content_type.is_some());
    assert!(content_type.unwrap().contains("text/event-stream"));
}

#[tokio::test]
async fn test_unknown_endpoint_returns_404() {
    let app = TestApp::new();

    let response = app.send("GET", "/nonexistent", None).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
