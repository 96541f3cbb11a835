pub mod catalog;
pub mod custom;
pub mod drift;
pub mod health;
pub mod jobs;
pub mod metrics;
pub mod provisioning;
pub mod tenants;

use axum::{
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::tenant::TenantId;
use crate::AppState;

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult<T> = Result<T, ApiError>;

pub(crate) fn tenant_id(raw: &str) -> Result<TenantId, EngineError> {
    TenantId::parse(raw).map_err(EngineError::InvalidTenantId)
}

pub(crate) fn to_json<T: Serialize>(value: T) -> ApiResult<Json<Value>> {
    serde_json::to_value(value)
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))))
}

/// `202 Accepted` for work handed to the job runner.
pub(crate) fn accepted(job: Uuid) -> (StatusCode, Json<Value>) {
    (StatusCode::ACCEPTED, Json(json!({ "job_id": job, "status": "running" })))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics::metrics_handler))
        // Tenants
        .route("/tenants", get(tenants::list_tenants).post(tenants::create_tenant))
        .route("/tenants/{id}", get(tenants::get_tenant))
        .route("/tenants/{id}/retry", post(tenants::retry_tenant))
        .route("/tenants/{id}/suspend", post(tenants::suspend_tenant))
        .route("/tenants/{id}/resume", post(tenants::resume_tenant))
        .route("/tenants/{id}/archive", post(tenants::archive_tenant))
        .route("/tenants/{id}/cancel", post(tenants::cancel_tenant_job))
        .route("/tenants/{id}/history", get(tenants::tenant_history))
        .route("/tenants/{id}/snapshot", post(tenants::capture_snapshot))
        // Provisioning
        .route("/tenants/{id}/template", post(provisioning::apply_template))
        .route("/tenants/{id}/modules", post(provisioning::apply_modules))
        // Drift
        .route("/tenants/{id}/drift", get(drift::detect_drift))
        .route("/tenants/{id}/drift/repair", post(drift::repair_drift))
        // Custom migrations
        .route(
            "/tenants/{id}/custom-migrations",
            get(custom::list_requests).post(custom::create_request),
        )
        .route("/custom-migrations/{id}", get(custom::get_request))
        .route("/custom-migrations/{id}/approve", post(custom::approve_request))
        .route("/custom-migrations/{id}/reject", post(custom::reject_request))
        .route("/custom-migrations/{id}/apply", post(custom::apply_request))
        .route("/custom-migrations/{id}/rollback", post(custom::rollback_request))
        // Catalog & jobs
        .route("/catalog/templates", get(catalog::list_templates))
        .route("/catalog/modules", get(catalog::list_modules))
        .route("/catalog/reload", post(catalog::reload_catalog))
        .route("/jobs/{id}", get(jobs::get_job))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
