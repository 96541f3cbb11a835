use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    error::EngineError,
    middleware::admin::AdminActor,
    models::migration::parse_definition_ref,
    routes::{accepted, tenant_id, ApiResult},
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct ApplyTemplateRequest {
    /// `slug` or `slug@version`.
    pub template: String,
    #[serde(default)]
    pub modules: Vec<String>,
}

/// POST /tenants/{id}/template: validated and locked now, applied as a job.
pub async fn apply_template(
    State(state): State<AppState>,
    admin: AdminActor,
    Path(id): Path<String>,
    Json(body): Json<ApplyTemplateRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let tenant = tenant_id(&id)?;
    let (slug, version) = parse_definition_ref(&body.template).map_err(EngineError::InvalidRequest)?;
    let (guard, plan) = state
        .engine
        .orchestrator
        .prepare_template(&tenant, &slug, version.as_ref(), &body.modules)
        .await?;

    let orchestrator = state.engine.orchestrator.clone();
    let actor = admin.actor;
    let job = state.engine.jobs.spawn(guard, "template", move |cancel| async move {
        orchestrator.run_template(&plan, &actor, &cancel).await
    });
    Ok(accepted(job))
}

#[derive(Debug, Deserialize)]
pub struct ApplyModulesRequest {
    pub modules: Vec<String>,
}

pub async fn apply_modules(
    State(state): State<AppState>,
    admin: AdminActor,
    Path(id): Path<String>,
    Json(body): Json<ApplyModulesRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let tenant = tenant_id(&id)?;
    let (guard, plan) = state
        .engine
        .orchestrator
        .prepare_modules(&tenant, &body.modules)
        .await?;

    let orchestrator = state.engine.orchestrator.clone();
    let actor = admin.actor;
    let job = state.engine.jobs.spawn(guard, "modules", move |cancel| async move {
        orchestrator.run_modules(&plan, &actor, &cancel).await
    });
    Ok(accepted(job))
}
