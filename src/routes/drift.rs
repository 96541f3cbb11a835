use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use crate::{
    middleware::admin::AdminActor,
    routes::{tenant_id, to_json, ApiResult},
    services::repair::RepairPlan,
    AppState,
};

pub async fn detect_drift(
    State(state): State<AppState>,
    _admin: AdminActor,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_id(&id)?;
    let report = state.engine.drift.detect(&tenant).await?;
    to_json(report)
}

/// POST /tenants/{id}/drift/repair: detects drift afresh, files the repair
/// steps as custom migrations and applies them as a job.
pub async fn repair_drift(
    State(state): State<AppState>,
    admin: AdminActor,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let tenant = tenant_id(&id)?;
    let report = state.engine.drift.detect(&tenant).await?;
    let plan = RepairPlan::from_report(&report);
    let (guard, requests) = state
        .engine
        .repair
        .prepare(&plan, &admin.approver(), &admin.actor)
        .await?;

    let repairer = state.engine.repair.clone();
    let actor = admin.actor;
    let steps = requests.clone();
    let unrepaired = plan.unrepaired.clone();
    let job = state.engine.jobs.spawn(guard, "drift_repair", move |cancel| async move {
        repairer.run(&plan, &steps, &actor, &cancel).await
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "job_id": job,
            "status": "running",
            "requests": requests,
            "unrepaired": unrepaired,
        })),
    ))
}
