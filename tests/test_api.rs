//! Tests for REST API endpoints, driven through the router without a socket.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use flowwatch::api::{AppState, router};
use flowwatch::engine::types::*;
use flowwatch::engine::{MonitorConfig, WorkflowMonitor};
use flowwatch::lock::memory::MemoryLockService;
use flowwatch::storage::StepStore;
use flowwatch::storage::memory_store::MemoryStepStore;

fn step(prev: &StepRecord, basic: BasicStatus, next: NextActivity) -> StepRecord {
    let mut r = prev.successor();
    r.activity_id = r.step as i32;
    r.basic_status = basic;
    r.next_activity = next;
    r
}

/// Instance 1 is waiting, 2 is complete, 3 is running.
async fn seeded_app() -> (Router, Arc<MemoryStepStore>) {
    let store = Arc::new(MemoryStepStore::new());

    let waiting = StepRecord::first(1, "main", 10, "Start");
    store.insert_step(&waiting).await.unwrap();
    store
        .insert_step(&step(&waiting, BasicStatus::Waiting, NextActivity::Activity(2)))
        .await
        .unwrap();

    let done = StepRecord::first(2, "main", 20, "Start");
    store.insert_step(&done).await.unwrap();
    store
        .insert_step(&step(&done, BasicStatus::Success, NextActivity::Done))
        .await
        .unwrap();

    let running = StepRecord::first(3, "main", 10, "Start");
    store.insert_step(&running).await.unwrap();

    let monitor = Arc::new(WorkflowMonitor::new(
        store.clone(),
        Arc::new(MemoryLockService::new()),
        MonitorConfig::default(),
    ));
    (router(Arc::new(AppState::new(monitor))), store)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    send(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await
}

// --- Health ---

#[tokio::test]
async fn health_reports_ok() {
    let (app, _) = seeded_app().await;
    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

// --- Queries ---

#[tokio::test]
async fn state_and_status_of_instance() {
    let (app, _) = seeded_app().await;

    let (status, body) = get(&app, "/instances/1/state").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "workflow_id": 1, "state": "waiting" }));

    let (_, body) = get(&app, "/instances/2/status").await;
    assert_eq!(body["status"], "success");

    let (_, body) = get(&app, "/instances/404/state").await;
    assert_eq!(body["state"], "unknown");

    let (_, body) = get(&app, "/instances/404/status").await;
    assert_eq!(body["status"], "unknown");
}

#[tokio::test]
async fn malformed_id_is_bad_request() {
    let (app, _) = seeded_app().await;
    let (status, body) = get(&app, "/instances/abc/state").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn list_instances_by_state() {
    let (app, _) = seeded_app().await;

    let (status, body) = get(&app, "/instances?states=waiting,complete").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ids"], json!([1, 2]));
    assert_eq!(body["total"], 2);

    let (_, body) = get(&app, "/instances?definitions=10&cap=1").await;
    assert_eq!(body["ids"], json!([1]));

    let (_, body) = get(&app, "/instances?definitions=10&all=true").await;
    assert_eq!(body["ids"], json!([1, 3]));
}

#[tokio::test]
async fn list_rejects_bad_filters() {
    let (app, _) = seeded_app().await;

    let (status, _) = get(&app, "/instances?states=sleeping").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get(&app, "/instances?statuses=warning").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get(&app, "/instances?from=yesterday").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn plan_shows_rendered_sql() {
    let (app, _) = seeded_app().await;
    let (status, body) = get(&app, "/plan?states=waiting&cap=5").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["dialect"], "sqlite");
    let sql = body["sql"].as_str().unwrap();
    assert!(sql.contains("x.state IN (2)"));
    assert!(body["plan"].is_object());
}

#[tokio::test]
async fn batch_statuses_skip_unknown_ids() {
    let (app, _) = seeded_app().await;
    let (status, body) = post_json(&app, "/statuses", json!({ "ids": [1, 2, 99] })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["statuses"][0]["workflow_id"], 1);
}

#[tokio::test]
async fn branch_history_lists_records() {
    let (app, _) = seeded_app().await;
    let (status, body) = get(&app, "/instances/1/branches/main/history").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["branch_id"], "main");
    assert_eq!(body["records"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn usage_groups_by_state() {
    let (app, _) = seeded_app().await;
    let (status, body) = get(&app, "/usage").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["counts"]["waiting"], 1);
    assert_eq!(body["counts"]["active"], 1);
    assert_eq!(body["counts"]["halted"], 0);
    assert_eq!(body["instances"]["waiting"], json!([1]));
}

#[tokio::test]
async fn movable_lists_finished_instances() {
    let (app, _) = seeded_app().await;
    let (status, body) = get(&app, "/movable").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ids"], json!([2]));

    let (status, _) = get(&app, "/movable?selection=archived").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn shutdown_list_is_empty_without_candidates() {
    let (app, _) = seeded_app().await;
    let (status, body) = get(&app, "/shutdown").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 0);
}

// --- Transitions ---

#[tokio::test]
async fn terminate_waiting_instance() {
    let (app, store) = seeded_app().await;

    let request = Request::post("/instances/1/terminate")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "workflow_id": 1, "success": true }));

    let latest = store.latest_step(1, "main").await.unwrap().unwrap();
    assert_eq!(latest.basic_status, BasicStatus::Terminated);

    let (_, body) = post_json(&app, "/instances/1/terminate", json!({ "user": "ops" })).await;
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn terminate_rejects_invalid_body() {
    let (app, _) = seeded_app().await;
    let request = Request::post("/instances/1/terminate")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn interrupt_running_instance() {
    let (app, _) = seeded_app().await;
    let (status, body) = post_json(&app, "/instances/3/interrupt", json!({ "kind": "manual" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (_, body) = get(&app, "/instances/3/state").await;
    assert_eq!(body["state"], "interrupted_man");
}

#[tokio::test]
async fn force_terminate_reports_branches() {
    let (app, _) = seeded_app().await;
    let request = Request::post("/instances/2/force-terminate")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["branches"][0]["branch_id"], "main");
    assert_eq!(body["branches"][0]["success"], true);
}

#[tokio::test]
async fn stop_turns_running_instance_halting() {
    let (app, _) = seeded_app().await;
    let request = Request::post("/instances/3/stop").body(Body::empty()).unwrap();
    let (_, body) = send(&app, request).await;
    assert_eq!(body["success"], true);

    let (_, body) = get(&app, "/instances/3/state").await;
    assert_eq!(body["state"], "halting");
}
