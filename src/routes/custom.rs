use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    middleware::admin::AdminActor,
    models::{custom::CustomStatus, migration::Operation},
    routes::{accepted, tenant_id, to_json, ApiResult},
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct CreateCustomRequest {
    pub forward: Operation,
    #[serde(default)]
    pub reverse: Option<Operation>,
    pub description: String,
}

pub async fn create_request(
    State(state): State<AppState>,
    admin: AdminActor,
    Path(id): Path<String>,
    Json(body): Json<CreateCustomRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let tenant = tenant_id(&id)?;
    let request = state
        .engine
        .custom
        .request(&tenant, &admin.actor, body.forward, body.reverse, &body.description)
        .await?;
    Ok((StatusCode::CREATED, to_json(request)?))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<CustomStatus>,
}

pub async fn list_requests(
    State(state): State<AppState>,
    _admin: AdminActor,
    Path(id): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_id(&id)?;
    let requests = state.engine.custom.list(&tenant, query.status).await?;
    to_json(requests)
}

pub async fn get_request(
    State(state): State<AppState>,
    _admin: AdminActor,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    to_json(state.engine.custom.get(id).await?)
}

pub async fn approve_request(
    State(state): State<AppState>,
    admin: AdminActor,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let request = state.engine.custom.approve(id, &admin.approver()).await?;
    to_json(request)
}

#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    pub reason: String,
}

pub async fn reject_request(
    State(state): State<AppState>,
    admin: AdminActor,
    Path(id): Path<Uuid>,
    Json(body): Json<RejectRequest>,
) -> ApiResult<Json<Value>> {
    let request = state
        .engine
        .custom
        .reject(id, &admin.approver(), &body.reason)
        .await?;
    to_json(request)
}

/// POST /custom-migrations/{id}/apply: runs as a job under the tenant lock.
pub async fn apply_request(
    State(state): State<AppState>,
    admin: AdminActor,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let request = state.engine.custom.get(id).await?;
    let (guard, plan) = state
        .engine
        .orchestrator
        .prepare_custom(&request.tenant, Some(id))
        .await?;

    let orchestrator = state.engine.orchestrator.clone();
    let actor = admin.actor;
    let job = state.engine.jobs.spawn(guard, "custom", move |cancel| async move {
        orchestrator.run_custom(&plan, &actor, &cancel).await
    });
    Ok(accepted(job))
}

pub async fn rollback_request(
    State(state): State<AppState>,
    admin: AdminActor,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let report = state
        .engine
        .orchestrator
        .rollback_custom(id, &admin.actor)
        .await?;
    to_json(report)
}
