//! End-to-end tests of the HTTP surface against an in-memory store.

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use futures::StreamExt;
use runcoord_coordinator::{Coordinator, CoordinatorConfig, storage::MemoryStore};
use serde_json::{Value, json};
use tower::ServiceExt;

fn app() -> Router {
    let config = CoordinatorConfig::builder()
        .host_id("test-host")
        .build()
        .unwrap();
    runcoord_transport::router(Arc::new(Coordinator::new(MemoryStore::new(), config)))
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn register(app: &Router, runner_id: &str) {
    let (status, _) = call(
        app,
        Method::POST,
        "/runner/register",
        Some(json!({ "runner_id": runner_id, "host": "box-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn claim_and_complete_scenario() {
    let app = app();
    register(&app, "A").await;
    register(&app, "B").await;

    let (status, created) = call(
        &app,
        Method::POST,
        "/runs",
        Some(json!({ "session_id": "S", "agent": "claude", "prompt": "compute", "mode": "async_poll" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["run"]["status"], "pending");
    assert_eq!(created["session"]["host"], "test-host");
    let run_id = created["run"]["id"].as_str().unwrap().to_string();

    let (status, polled) = call(&app, Method::GET, "/runner/runs?runner_id=A", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(polled["run"]["id"], run_id.as_str());
    assert_eq!(polled["run"]["status"], "claimed");

    let (status, started) = call(
        &app,
        Method::POST,
        &format!("/runner/runs/{run_id}/started"),
        Some(json!({ "runner_id": "A", "executor_session_id": "exec-9" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(started["status"], "running");

    let (status, polled) = call(&app, Method::GET, "/runner/runs?runner_id=B", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(polled["run"].is_null());

    let (status, done) = call(
        &app,
        Method::POST,
        &format!("/runner/runs/{run_id}/completed"),
        Some(json!({ "runner_id": "A", "result": "42" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(done["status"], "completed");
    assert_eq!(done["result"], "42");
    assert!(done["error"].is_null());

    let (_, session) = call(&app, Method::GET, "/sessions/S", None).await;
    assert_eq!(session["status"], "completed");
    assert_eq!(session["executor_session_id"], "exec-9");

    let (_, events) = call(&app, Method::GET, "/sessions/S/events", None).await;
    let transitions: Vec<&str> = events
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["payload"]["to"].as_str().unwrap())
        .collect();
    assert_eq!(transitions, ["pending", "claimed", "running", "completed"]);
}

#[tokio::test]
async fn illegal_report_is_conflict() {
    let app = app();
    let (_, created) = call(
        &app,
        Method::POST,
        "/runs",
        Some(json!({ "session_id": "S", "agent": "claude", "prompt": "x" })),
    )
    .await;
    let run_id = created["run"]["id"].as_str().unwrap();

    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/runner/runs/{run_id}/completed"),
        Some(json!({ "runner_id": "A" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");

    let (_, run) = call(&app, Method::GET, &format!("/runs/{run_id}"), None).await;
    assert_eq!(run["status"], "pending");
}

#[tokio::test]
async fn error_statuses() {
    let app = app();

    let (status, body) = call(
        &app,
        Method::POST,
        "/runs",
        Some(json!({ "agent": "claude", "prompt": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "validation_error");

    let missing = uuid::Uuid::now_v7();
    let (status, body) = call(&app, Method::GET, &format!("/runs/{missing}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, _) = call(
        &app,
        Method::POST,
        "/runner/heartbeat",
        Some(json!({ "runner_id": "ghost" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(&app, Method::DELETE, "/runners/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_requests_use_the_json_error_shape() {
    let app = app();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/runs")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"], "validation_error");
    assert!(body["message"].is_string());

    let (status, body) = call(&app, Method::POST, "/runs", Some(json!({ "prompt": 5 }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "validation_error");

    let (status, body) = call(&app, Method::GET, "/runs/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "validation_error");

    let (status, body) = call(&app, Method::GET, "/runner/runs", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn stop_is_idempotent_and_delivered_on_poll() {
    let app = app();
    let (_, created) = call(
        &app,
        Method::POST,
        "/runs",
        Some(json!({ "session_id": "S", "agent": "claude", "prompt": "long" })),
    )
    .await;
    let run_id = created["run"]["id"].as_str().unwrap().to_string();
    call(&app, Method::GET, "/runner/runs?runner_id=A", None).await;

    let (status, first) = call(&app, Method::POST, &format!("/runs/{run_id}/stop"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["run"]["status"], "stopping");
    assert_eq!(first["directive_enqueued"], true);

    let (_, second) = call(&app, Method::POST, &format!("/runs/{run_id}/stop"), None).await;
    assert_eq!(second["already_stopping"], true);

    let (_, polled) = call(&app, Method::GET, "/runner/runs?runner_id=A", None).await;
    assert_eq!(
        polled["directives"],
        json!([{ "type": "stop", "run_id": run_id }])
    );

    let (_, stopped) = call(
        &app,
        Method::POST,
        &format!("/runner/runs/{run_id}/stopped"),
        Some(json!({ "runner_id": "A" })),
    )
    .await;
    assert_eq!(stopped["status"], "stopped");
}

#[tokio::test]
async fn runner_lifecycle() {
    let app = app();
    register(&app, "A").await;

    let (status, beat) = call(
        &app,
        Method::POST,
        "/runner/heartbeat",
        Some(json!({ "runner_id": "A" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(beat["was_stale"], false);

    let (_, runners) = call(&app, Method::GET, "/runners", None).await;
    assert_eq!(runners[0]["runner_id"], "A");
    assert_eq!(runners[0]["liveness"], "alive");
    assert_eq!(runners[0]["active_runs"], json!([]));

    let (status, dereg) = call(&app, Method::DELETE, "/runners/A", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dereg["initiated_by"], "external");
    assert_eq!(dereg["removed"], false);

    let (_, polled) = call(&app, Method::GET, "/runner/runs?runner_id=A", None).await;
    assert_eq!(polled["directives"], json!([{ "type": "shutdown" }]));

    let (status, dereg) = call(
        &app,
        Method::POST,
        "/runner/deregister",
        Some(json!({ "runner_id": "A" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dereg["initiated_by"], "self");
    assert_eq!(dereg["removed"], true);

    let (_, runners) = call(&app, Method::GET, "/runners", None).await;
    assert_eq!(runners, json!([]));
}

#[tokio::test]
async fn session_listing_and_delete() {
    let app = app();
    let (_, created) = call(
        &app,
        Method::POST,
        "/runs",
        Some(json!({ "session_id": "S", "agent": "claude", "prompt": "x" })),
    )
    .await;
    let run_id = created["run"]["id"].as_str().unwrap().to_string();

    let (_, sessions) = call(&app, Method::GET, "/sessions?status=pending", None).await;
    assert_eq!(sessions.as_array().unwrap().len(), 1);

    let (status, _) = call(&app, Method::DELETE, "/sessions/S", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Stopping a pending run cancels it.
    let (_, stopped) = call(&app, Method::POST, &format!("/runs/{run_id}/stop"), None).await;
    assert_eq!(stopped["run"]["status"], "stopped");

    let (_, runs) = call(&app, Method::GET, "/sessions/S/runs", None).await;
    assert_eq!(runs.as_array().unwrap().len(), 1);

    let (status, _) = call(&app, Method::DELETE, "/sessions/S", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, Method::GET, "/sessions/S", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn global_stream_delivers_live_events() {
    let app = app();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/events/stream")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    call(
        &app,
        Method::POST,
        "/runs",
        Some(json!({ "session_id": "S", "agent": "claude", "prompt": "watch me" })),
    )
    .await;

    let mut body = response.into_body().into_data_stream();
    let frame = tokio::time::timeout(Duration::from_secs(5), body.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = String::from_utf8(frame.to_vec()).unwrap();
    assert!(text.contains("event: run_status"), "got {text}");
    assert!(text.contains("\"session_id\":\"S\""));
}

#[tokio::test]
async fn unknown_session_stream_is_not_found() {
    let app = app();
    let (status, _) = call(&app, Method::GET, "/sessions/nope/stream", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health() {
    let app = app();
    let (status, body) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["runners"], 0);
}
