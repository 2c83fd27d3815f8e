//! REST API tests.
//!
//! Tests use `tower::ServiceExt::oneshot()` to drive the axum router in-process
//! against the in-memory store and a scripted proxy probe.

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    response::Response,
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use crate::testing::{test_plane, TestPlane};

// ---------------------------------------------------------------------------
// Test harness
// ---------------------------------------------------------------------------

fn make_app(t: &TestPlane) -> Router {
    crate::api::create_router(t.plane.clone())
}

/// Send one request through the router and return the status + body bytes.
async fn send(app: Router, req: Request<Body>) -> (StatusCode, bytes::Bytes) {
    let resp: Response = app.oneshot(req).await.expect("router returned error");
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    (status, body)
}

/// Parse body bytes as JSON.
fn json_body(body: &bytes::Bytes) -> Value {
    serde_json::from_slice(body).expect("response is not valid JSON")
}

/// Build a JSON request as `alice`.
fn json_req(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-switchyard-actor", "alice")
        .header("x-forwarded-for", "10.0.0.7, 172.16.0.1")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

/// Build a request with no body.
fn empty_req(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-switchyard-actor", "alice")
        .body(Body::empty())
        .unwrap()
}

async fn create_service(app: &Router, name: &str) {
    let (status, body) = send(
        app.clone(),
        json_req(
            Method::POST,
            "/services",
            json!({
                "name": name,
                "type": "http",
                "backend_targets": [{ "url": format!("http://{name}:8080"), "weight": 1 }]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", String::from_utf8_lossy(&body));
}

async fn create_route(app: &Router, name: &str, rule: &str, priority: i32) -> (StatusCode, Value) {
    let (status, body) = send(
        app.clone(),
        json_req(
            Method::POST,
            "/routes",
            json!({ "name": name, "rule": rule, "service_ref": "api", "priority": priority }),
        ),
    )
    .await;
    (status, json_body(&body))
}

// ---------------------------------------------------------------------------
// Health and metrics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_store_status() {
    let t = test_plane();
    let (status, body) = send(make_app(&t), empty_req(Method::GET, "/health")).await;
    assert_eq!(status, StatusCode::OK);
    let json = json_body(&body);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["store"], "ok");
}

#[tokio::test]
async fn metrics_are_exposed_in_text_format() {
    let t = test_plane();
    let app = make_app(&t);
    create_service(&app, "api").await;

    let resp = app
        .oneshot(empty_req(Method::GET, "/metrics"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/plain"));
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert!(String::from_utf8_lossy(&body).contains("switchyard_snapshots_captured"));
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn route_lifecycle() {
    let t = test_plane();
    let app = make_app(&t);
    create_service(&app, "api").await;

    let (status, created) = create_route(&app, "web", "Host(`shop.example.com`)", 10).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["data"]["name"], "web");
    assert_eq!(created["publish"]["phase"], "healthy");
    let id = created["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(app.clone(), empty_req(Method::GET, "/routes/web")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["id"], id.as_str());

    let (status, body) = send(
        app.clone(),
        json_req(Method::PUT, &format!("/routes/{id}"), json!({ "priority": 20 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["data"]["priority"], 20);

    let (status, body) = send(app.clone(), empty_req(Method::GET, "/routes?name=WE")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body).as_array().unwrap().len(), 1);

    let (status, _) = send(app.clone(), empty_req(Method::DELETE, "/routes/web")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(app, empty_req(Method::GET, "/routes/web")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json_body(&body)["type"], "urn:switchyard:error:not-found");
}

#[tokio::test]
async fn conflicting_route_is_rejected_with_report() {
    let t = test_plane();
    let app = make_app(&t);
    create_service(&app, "api").await;

    let (status, _) =
        create_route(&app, "api-v1", "Host(`api.example.com`) && PathPrefix(`/v1`)", 10).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, problem) = create_route(&app, "api-all", "PathPrefix(`/`)", 10).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(problem["type"], "urn:switchyard:error:route-conflict");
    assert_eq!(problem["errors"][0]["code"], "duplicate_priority");
    assert_eq!(problem["report"]["valid"], false);

    let (status, created) = create_route(&app, "api-all", "PathPrefix(`/`)", 5).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(!created["warnings"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn force_overrides_conflicts() {
    let t = test_plane();
    let app = make_app(&t);
    create_service(&app, "api").await;
    create_route(&app, "a", "Host(`a.example.com`)", 1).await;

    let (status, body) = send(
        app,
        json_req(
            Method::POST,
            "/routes?force=true",
            json!({ "name": "b", "rule": "Host(`a.example.com`)", "service_ref": "api", "priority": 1 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json_body(&body)["warnings"][0]["severity"], "error");
}

#[tokio::test]
async fn invalid_rule_is_a_bad_request() {
    let t = test_plane();
    let app = make_app(&t);
    create_service(&app, "api").await;
    let (status, problem) = create_route(&app, "bad", "Host(`unterminated", 0).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["type"], "urn:switchyard:error:bad-request");
}

#[tokio::test]
async fn validate_is_a_dry_run() {
    let t = test_plane();
    let app = make_app(&t);
    create_service(&app, "api").await;
    create_route(&app, "web", "Host(`shop.example.com`)", 10).await;

    let (status, body) = send(
        app.clone(),
        json_req(
            Method::POST,
            "/validate",
            json!({ "rule": "Host(`shop.example.com`)", "priority": 10 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let report = json_body(&body);
    assert_eq!(report["valid"], false);
    assert_eq!(report["errors"].as_array().unwrap().len(), 1);

    let (_, body) = send(app, empty_req(Method::GET, "/routes")).await;
    assert_eq!(json_body(&body).as_array().unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Services and middlewares
// ---------------------------------------------------------------------------

#[tokio::test]
async fn service_in_use_needs_force_to_delete() {
    let t = test_plane();
    let app = make_app(&t);
    create_service(&app, "api").await;
    create_route(&app, "web", "Host(`shop.example.com`)", 0).await;

    let (status, body) = send(app.clone(), empty_req(Method::DELETE, "/services/api")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let problem = json_body(&body);
    assert_eq!(problem["type"], "urn:switchyard:error:referential-conflict");
    assert_eq!(problem["errors"][0]["location"], "web");

    let (status, _) = send(app.clone(), empty_req(Method::DELETE, "/services/api?force=true")).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(app, empty_req(Method::GET, "/routes")).await;
    assert!(json_body(&body).as_array().unwrap().is_empty());
}

#[tokio::test]
async fn middleware_usage_is_reported() {
    let t = test_plane();
    let app = make_app(&t);
    create_service(&app, "api").await;

    let (status, _) = send(
        app.clone(),
        json_req(
            Method::POST,
            "/middlewares",
            json!({ "name": "limit", "type": "rate_limit", "config": { "average": 100 } }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = send(
        app.clone(),
        json_req(
            Method::POST,
            "/routes",
            json!({
                "name": "web",
                "rule": "Host(`shop.example.com`)",
                "service_ref": "api",
                "middleware_refs": ["limit"]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, body) = send(app.clone(), empty_req(Method::GET, "/middlewares/limit")).await;
    assert_eq!(json_body(&body)["usage_count"], 1);

    let (status, _) = send(app, empty_req(Method::DELETE, "/middlewares/limit")).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn middleware_config_is_validated() {
    let t = test_plane();
    let (status, body) = send(
        make_app(&t),
        json_req(
            Method::POST,
            "/middlewares",
            json!({ "name": "retry", "type": "retry", "config": {} }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json_body(&body)["detail"]
        .as_str()
        .unwrap()
        .contains("attempts"));
}

// ---------------------------------------------------------------------------
// Publishing and snapshots
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unhealthy_proxy_rolls_back_with_502() {
    let t = test_plane();
    let app = make_app(&t);
    create_service(&app, "api").await;

    t.probe.set_healthy(false);
    let (status, problem) = create_route(&app, "web", "Host(`shop.example.com`)", 0).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(problem["type"], "urn:switchyard:error:publish-rolled-back");

    t.probe.set_healthy(true);
    let (_, body) = send(app.clone(), empty_req(Method::GET, "/routes")).await;
    assert!(json_body(&body).as_array().unwrap().is_empty());

    let (status, body) = send(app, empty_req(Method::GET, "/publish")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["last_publish"]["phase"], "rolled_back");
}

#[tokio::test]
async fn manual_publish_reports_phases() {
    let t = test_plane();
    let app = make_app(&t);
    create_service(&app, "api").await;

    let (status, body) = send(app.clone(), empty_req(Method::POST, "/publish")).await;
    assert_eq!(status, StatusCode::OK);
    let report = json_body(&body);
    assert_eq!(report["phase"], "healthy");
    assert_eq!(
        report["transitions"],
        json!(["pending", "published", "health_checking", "healthy"])
    );

    let (_, body) = send(app, empty_req(Method::GET, "/publish")).await;
    let status = json_body(&body);
    assert_eq!(status["live_checksum"], report["checksum"]);
    assert_eq!(status["published_snapshot"], report["snapshot_id"]);
}

#[tokio::test]
async fn snapshot_capture_export_import_restore() {
    let t = test_plane();
    let app = make_app(&t);
    create_service(&app, "api").await;

    let (status, body) = send(
        app.clone(),
        json_req(Method::POST, "/snapshots", json!({ "label": "before launch" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let captured = json_body(&body);
    assert_eq!(captured["is_automatic"], false);
    let id = captured["id"].as_str().unwrap().to_string();

    let resp = app
        .clone()
        .oneshot(empty_req(Method::GET, &format!("/snapshots/{id}/export")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers()["content-disposition"]
        .to_str()
        .unwrap()
        .contains(&id));
    let bundle: Value =
        serde_json::from_slice(&resp.into_body().collect().await.unwrap().to_bytes()).unwrap();

    let (status, body) =
        send(app.clone(), json_req(Method::POST, "/snapshots/import", bundle)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_ne!(json_body(&body)["id"], id.as_str());

    create_route(&app, "web", "Host(`shop.example.com`)", 0).await;

    let (status, body) = send(
        app.clone(),
        empty_req(Method::POST, &format!("/snapshots/{id}/restore")),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));

    let (_, body) = send(app.clone(), empty_req(Method::GET, "/routes")).await;
    assert!(json_body(&body).as_array().unwrap().is_empty());

    let (status, body) = send(app, empty_req(Method::GET, "/snapshots")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json_body(&body).as_array().unwrap().len() >= 2);
}

#[tokio::test]
async fn blank_snapshot_label_is_rejected() {
    let t = test_plane();
    let (status, _) = send(
        make_app(&t),
        json_req(Method::POST, "/snapshots", json!({ "label": "  " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_snapshot_is_not_found() {
    let t = test_plane();
    let (status, _) = send(
        make_app(&t),
        empty_req(
            Method::GET,
            "/snapshots/0192d3a4-0000-7000-8000-000000000000",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[tokio::test]
async fn audit_records_actor_and_source_ip() {
    let t = test_plane();
    let app = make_app(&t);
    create_service(&app, "api").await;

    let (status, body) = send(app, empty_req(Method::GET, "/audit?limit=1")).await;
    assert_eq!(status, StatusCode::OK);
    let entries = json_body(&body);
    let entries = entries.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["actor"], "alice");
    assert_eq!(entries[0]["source_ip"], "10.0.0.7");
}

#[tokio::test]
async fn conflicts_view_lists_current_findings() {
    let t = test_plane();
    let app = make_app(&t);
    create_service(&app, "api").await;
    create_route(&app, "narrow", "PathPrefix(`/v1`)", 10).await;
    create_route(&app, "wide", "PathPrefix(`/`)", 1).await;

    let (status, body) = send(app, empty_req(Method::GET, "/conflicts")).await;
    assert_eq!(status, StatusCode::OK);
    let view = json_body(&body);
    assert_eq!(view["current"][0]["kind"], "path_overlap");
    assert!(!view["history"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn certificates_start_empty() {
    let t = test_plane();
    let (status, body) = send(make_app(&t), empty_req(Method::GET, "/certificates")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body), json!([]));
}
