use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::{
    error::EngineError,
    middleware::admin::AdminActor,
    models::migration::Layer,
    routes::{tenant_id, to_json, ApiResult},
    AppState,
};

// ─── Registry ────────────────────────────────────────────────────────────────

pub async fn list_tenants(
    State(state): State<AppState>,
    _admin: AdminActor,
) -> ApiResult<Json<Value>> {
    let tenants = state.engine.orchestrator.tenants().await?;
    to_json(tenants)
}

pub async fn get_tenant(
    State(state): State<AppState>,
    _admin: AdminActor,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_id(&id)?;
    let tenant_state = state.engine.orchestrator.tenant(&tenant).await?;
    let job = state.engine.jobs.running_job(&tenant);
    let mut body = to_json(tenant_state)?.0;
    if let Some(obj) = body.as_object_mut() {
        obj.insert("running_job".into(), json!(job));
    }
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct CreateTenantRequest {
    pub tenant: String,
}

/// POST /tenants: registers the tenant and applies the Basic layer.
pub async fn create_tenant(
    State(state): State<AppState>,
    admin: AdminActor,
    Json(body): Json<CreateTenantRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let tenant = tenant_id(&body.tenant)?;
    let result = state
        .engine
        .orchestrator
        .establish_tenant(&tenant, &admin.actor, &CancellationToken::new())
        .await?;
    Ok((StatusCode::CREATED, to_json(result)?))
}

// ─── Lifecycle ───────────────────────────────────────────────────────────────

pub async fn retry_tenant(
    State(state): State<AppState>,
    _admin: AdminActor,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_id(&id)?;
    to_json(state.engine.orchestrator.retry(&tenant).await?)
}

pub async fn suspend_tenant(
    State(state): State<AppState>,
    _admin: AdminActor,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_id(&id)?;
    to_json(state.engine.orchestrator.suspend(&tenant).await?)
}

pub async fn resume_tenant(
    State(state): State<AppState>,
    _admin: AdminActor,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_id(&id)?;
    to_json(state.engine.orchestrator.resume(&tenant).await?)
}

pub async fn archive_tenant(
    State(state): State<AppState>,
    admin: AdminActor,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_id(&id)?;
    let archived = state.engine.orchestrator.archive(&tenant).await?;
    tracing::warn!(tenant = %tenant, actor = %admin.actor, "Tenant archived");
    to_json(archived)
}

/// POST /tenants/{id}/cancel: stops the running job between units.
pub async fn cancel_tenant_job(
    State(state): State<AppState>,
    _admin: AdminActor,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let tenant = tenant_id(&id)?;
    let job = state.engine.jobs.cancel(&tenant).ok_or_else(|| {
        EngineError::InvalidRequest(format!("tenant '{tenant}' has no provisioning job running"))
    })?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job, "status": "cancelling" }))))
}

// ─── Ledger & snapshots ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub layer: Option<Layer>,
}

pub async fn tenant_history(
    State(state): State<AppState>,
    _admin: AdminActor,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_id(&id)?;
    state.engine.orchestrator.tenant(&tenant).await?;
    let entries = state.engine.ledger.history(&tenant, query.layer).await?;
    to_json(entries)
}

pub async fn capture_snapshot(
    State(state): State<AppState>,
    _admin: AdminActor,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let tenant = tenant_id(&id)?;
    state.engine.orchestrator.tenant(&tenant).await?;
    let snapshot = state.engine.snapshots.capture_and_store(&tenant).await?;
    Ok((StatusCode::CREATED, to_json(snapshot)?))
}
