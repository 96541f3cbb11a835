use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    middleware::admin::AdminActor,
    routes::{to_json, ApiResult},
    AppState,
};

pub async fn get_job(
    State(state): State<AppState>,
    _admin: AdminActor,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let job = state
        .engine
        .jobs
        .job(id)
        .ok_or((StatusCode::NOT_FOUND, Json(json!({ "error": "Job not found", "code": "unknown_job" }))))?;
    to_json(job)
}
