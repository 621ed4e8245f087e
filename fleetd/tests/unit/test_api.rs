//! Control surface tests, driven in-process through the router

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use fleetd::reconcile::Outcome;
use fleetd::server::serve::router;
use fleetd::providers::ScriptedRunner;
use serde_json::{json, Value};
use tower::ServiceExt;

use crate::common::{docker_rules, test_app, TestApp};

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(body) => {
            request = request.header("content-type", "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn setup() -> (TestApp, Router) {
    let t = test_app(docker_rules(ScriptedRunner::new()));
    let app = router(t.server.clone());
    (t, app)
}

async fn create_bot(app: &Router, manifest: Value) -> String {
    let (status, body) = call(
        app,
        Method::POST,
        "/api/instances",
        Some(json!({"name": "bot", "manifest": manifest, "actor": "ops"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "PENDING");
    body["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health_and_version() {
    let (_t, app) = setup();

    let (status, body) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "fleetd");
    assert_eq!(body["status"], "healthy");

    let (status, body) = call(&app, Method::GET, "/version", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_create_reconcile_and_requeue() {
    let (t, app) = setup();
    let id = create_bot(&app, json!({"runtime": {"image": "fleet/bot:1"}})).await;

    let outcomes = t.app.engine.reconcile_pending().await.unwrap();
    assert_eq!(outcomes, vec![(id.clone(), Outcome::Running)]);

    let (status, body) = call(&app, Method::GET, &format!("/api/instances/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "RUNNING");
    assert_eq!(body["containerId"], "abc123");

    let (status, body) = call(&app, Method::POST, &format!("/api/instances/{}/reconcile", id), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["disposition"], "queued");

    let (_, body) = call(&app, Method::GET, &format!("/api/instances/{}", id), None).await;
    assert_eq!(body["status"], "PENDING");
    assert_eq!(t.audit.with_action("instance.create")[0].actor, "ops");
}

#[tokio::test]
async fn test_errors_are_structured() {
    let (_t, app) = setup();

    let (status, body) = call(&app, Method::POST, "/api/instances/missing/pause", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["type"], "NOT_FOUND");

    // PENDING cannot be paused
    let id = create_bot(&app, json!({})).await;
    let (status, body) = call(&app, Method::POST, &format!("/api/instances/{}/pause?actor=ops", id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["type"], "INVALID_STATE");
    assert!(body["message"].as_str().unwrap().contains("cannot pause"));

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/instances",
        Some(json!({"name": "bot", "manifest": {}, "deploymentType": "MAINFRAME"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "VALIDATION");
}

#[tokio::test]
async fn test_reconcile_all_reports_queued() {
    let (_t, app) = setup();
    let first = create_bot(&app, json!({})).await;
    let second = create_bot(&app, json!({})).await;

    let (status, body) = call(&app, Method::POST, "/api/instances/reconcile", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let queued: Vec<&str> = body["queued"].as_array().unwrap().iter().filter_map(Value::as_str).collect();
    assert!(queued.contains(&first.as_str()));
    assert!(queued.contains(&second.as_str()));
    assert!(body["skipped"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_secret_round_trip_feeds_reconcile() {
    let (t, app) = setup();
    let id = create_bot(&app, json!({"secrets": ["API_KEY"]})).await;
    let uri = format!("/api/instances/{}/secrets/API_KEY", id);

    let (status, body) = call(&app, Method::PUT, &uri, Some(json!({"value": "s3cret"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["backend"], "local");
    assert!(body.get("value").is_none());

    let (status, body) = call(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], "s3cret");

    assert_eq!(t.app.engine.reconcile_instance(&id).await.unwrap(), Outcome::Running);

    let (status, _) = call(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_change_set_lifecycle() {
    let (_t, app) = setup();
    let id = create_bot(&app, json!({"runtime": {"image": "fleet/bot:1"}})).await;

    let (status, created) = call(
        &app,
        Method::POST,
        "/api/change-sets",
        Some(json!({"instanceId": id, "toManifest": {"runtime": {"image": "fleet/bot:2"}}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "PENDING");
    assert_eq!(created["totalInstances"], 1);
    let cs = created["id"].as_str().unwrap().to_string();

    // Rollback is refused before completion
    let (status, _) = call(
        &app,
        Method::POST,
        &format!("/api/change-sets/{}/rollback", cs),
        Some(json!({"reason": "too early"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = call(&app, Method::POST, &format!("/api/change-sets/{}/start", cs), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "IN_PROGRESS");

    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/api/change-sets/{}/progress", cs),
        Some(json!({"updated": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "COMPLETED");
    assert_eq!(body["canRollback"], true);

    let (status, rollback) = call(
        &app,
        Method::POST,
        &format!("/api/change-sets/{}/rollback", cs),
        Some(json!({"reason": "bad release", "actor": "ops"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(rollback["rollbackOf"], cs.as_str());
    assert_eq!(rollback["toManifest"], json!({"runtime": {"image": "fleet/bot:1"}}));

    let (_, original) = call(&app, Method::GET, &format!("/api/change-sets/{}", cs), None).await;
    assert_eq!(original["canRollback"], false);
    assert_eq!(original["rolledBackBy"], "ops");
}

#[tokio::test]
async fn test_promote_rejects_skipping_environments() {
    let (_t, app) = setup();
    let id = create_bot(&app, json!({"environment": "dev"})).await;

    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/api/instances/{}/promote", id),
        Some(json!({"targetEnvironment": "prod"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["type"], "INVALID_STATE");

    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/api/instances/{}/promote", id),
        Some(json!({"targetEnvironment": "staging"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["toEnvironment"], "staging");
    assert_eq!(body["promoted"], 1);
}

#[tokio::test]
async fn test_workload_logs() {
    let t = test_app(docker_rules(ScriptedRunner::new().on(
        "logs --timestamps",
        fleetd::providers::CommandOutput::ok("2026-03-01T10:00:00Z booting\n2026-03-01T10:00:01Z ready\n"),
    )));
    let app = router(t.server.clone());
    let id = create_bot(&app, json!({})).await;

    let (status, body) = call(&app, Method::GET, &format!("/api/instances/{}/logs", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    t.app.engine.reconcile_pending().await.unwrap();
    let (status, body) = call(&app, Method::GET, &format!("/api/instances/{}/logs?tail=5", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[1]["message"], "ready");
    assert!(t.runner.calls_matching("logs --timestamps --tail 5 abc123").len() == 1);

    let (status, _) = call(&app, Method::GET, "/api/instances/missing/logs", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_provisioning_status() {
    let (_t, app) = setup();
    let (status, body) = call(&app, Method::GET, "/api/provisioning/nobody/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "unknown");
    assert_eq!(body["instanceId"], "nobody");
}
