//! Admin API through the router, backed by the in-memory engine.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use tower::ServiceExt;

use tenant_provisioner::{
    config::Config,
    db::memory::{MemoryControlStore, MemoryTenantDatabases},
    routes,
    services::{
        definitions::DefinitionSet,
        engine::{Engine, EngineSettings},
        events::TracingEventSink,
        lock::InProcessLock,
    },
    AppState,
};

const ADMIN_KEY: &str = "admin-secret";
const ELEVATED_KEY: &str = "elevated-secret";

fn config() -> Config {
    Config {
        database_url: "postgres://localhost/unused".into(),
        tenant_database_url_template: "postgres://localhost/{tenant}".into(),
        tenant_pool_max_connections: 1,
        host: "127.0.0.1".into(),
        port: 0,
        admin_key: ADMIN_KEY.into(),
        elevated_admin_key: ELEVATED_KEY.into(),
        redis_url: None,
        lock_ttl_secs: 60,
        definitions_dir: concat!(env!("CARGO_MANIFEST_DIR"), "/definitions").into(),
        unit_timeout_secs: 30,
        excluded_tables: vec![],
        destructive_keywords: vec![],
        event_webhook_url: None,
        job_retention_secs: 3600,
    }
}

async fn app() -> Router {
    let config = config();
    let defs = DefinitionSet::load_dir(&config.definitions_dir).await.unwrap();
    let engine = Engine::new(
        defs,
        Arc::new(MemoryControlStore::new()),
        Arc::new(MemoryTenantDatabases::new()),
        Arc::new(InProcessLock::new()),
        Arc::new(TracingEventSink),
        EngineSettings::default(),
    );
    let db = PgPoolOptions::new()
        .connect_lazy(&config.database_url)
        .unwrap();
    routes::router(AppState {
        db,
        config: Arc::new(config),
        engine: Arc::new(engine),
    })
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>, elevated: bool) -> (StatusCode, Value) {
    let mut req = Request::builder()
        .method(method)
        .uri(uri)
        .header("X-Admin-Key", ADMIN_KEY)
        .header("X-Actor", "alice");
    if elevated {
        req = req.header("X-Elevated-Key", ELEVATED_KEY);
    }
    let req = match body {
        Some(b) => req
            .header("content-type", "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => req.body(Body::empty()).unwrap(),
    };
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn wait_for_job(app: &Router, job: &str) -> Value {
    for _ in 0..200 {
        let (status, body) = call(app, "GET", &format!("/jobs/{job}"), None, false).await;
        assert_eq!(status, StatusCode::OK);
        if body["status"] != "running" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {job} still running");
}

#[tokio::test]
async fn admin_key_is_required() {
    let app = app().await;
    let res = app
        .clone()
        .oneshot(Request::builder().uri("/tenants").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = app
        .oneshot(
            Request::builder()
                .uri("/tenants")
                .header("X-Admin-Key", "wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn tenant_is_provisioned_through_the_api() {
    let app = app().await;

    let (status, body) = call(&app, "POST", "/tenants", Some(json!({ "tenant": "party-1" })), false).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["layer"], "basic");

    let (status, body) = call(&app, "POST", "/tenants", Some(json!({ "tenant": "bad id!" })), false).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_tenant_id");

    let (status, body) = call(
        &app,
        "POST",
        "/tenants/party-1/template",
        Some(json!({ "template": "political_party_nepal@1.0.0", "modules": ["election_campaign"] })),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "missing_dependency");
    assert_eq!(body["missing"], "membership_management");

    let (status, body) = call(
        &app,
        "POST",
        "/tenants/party-1/template",
        Some(json!({ "template": "political_party_nepal", "modules": ["membership_management"] })),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{body}");
    let job = wait_for_job(&app, body["job_id"].as_str().unwrap()).await;
    assert_eq!(job["status"], "succeeded", "{job}");

    let (_, tenant) = call(&app, "GET", "/tenants/party-1", None, false).await;
    assert_eq!(tenant["status"], "active");
    assert_eq!(tenant["template"]["slug"], "political_party_nepal");
    assert!(tenant["running_job"].is_null());

    let (status, history) = call(&app, "GET", "/tenants/party-1/history?layer=template", None, false).await;
    assert_eq!(status, StatusCode::OK);
    assert!(history.as_array().unwrap().iter().all(|e| e["layer"] == "template"));

    let (status, drift) = call(&app, "GET", "/tenants/party-1/drift", None, false).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(drift["severity"], "none");

    let (status, body) = call(&app, "GET", "/tenants/ghost", None, false).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "unknown_tenant");
}

#[tokio::test]
async fn custom_migration_workflow_over_http() {
    let app = app().await;
    call(&app, "POST", "/tenants", Some(json!({ "tenant": "t1" })), false).await;
    let (_, body) = call(
        &app,
        "POST",
        "/tenants/t1/template",
        Some(json!({ "template": "political_party_nepal" })),
        false,
    )
    .await;
    wait_for_job(&app, body["job_id"].as_str().unwrap()).await;

    let (status, request) = call(
        &app,
        "POST",
        "/tenants/t1/custom-migrations",
        Some(json!({
            "forward": { "kind": "sql", "sql": "DROP TABLE office_bearers" },
            "description": "retire office bearers"
        })),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{request}");
    let id = request["id"].as_str().unwrap().to_string();

    let (status, body) = call(&app, "POST", &format!("/custom-migrations/{id}/approve"), None, false).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "elevated_approval_required");

    let (status, body) = call(&app, "POST", &format!("/custom-migrations/{id}/approve"), None, true).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "approved");
    assert_eq!(body["approver"], "alice");

    let (status, body) = call(&app, "POST", &format!("/custom-migrations/{id}/apply"), None, false).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job = wait_for_job(&app, body["job_id"].as_str().unwrap()).await;
    assert_eq!(job["status"], "succeeded", "{job}");

    let (_, list) = call(&app, "GET", "/tenants/t1/custom-migrations?status=applied", None, false).await;
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, body) = call(&app, "POST", &format!("/custom-migrations/{id}/rollback"), None, false).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");
}
