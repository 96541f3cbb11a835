use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::{
    error::EngineError,
    middleware::admin::AdminActor,
    routes::{to_json, ApiResult},
    services::definitions::DefinitionSet,
    AppState,
};

pub async fn list_templates(
    State(state): State<AppState>,
    _admin: AdminActor,
) -> ApiResult<Json<Value>> {
    to_json(state.engine.catalog.templates())
}

pub async fn list_modules(
    State(state): State<AppState>,
    _admin: AdminActor,
) -> ApiResult<Json<Value>> {
    to_json(state.engine.catalog.modules())
}

/// POST /catalog/reload: re-reads the definitions directory. A set that
/// fails validation leaves the current catalog in place.
pub async fn reload_catalog(
    State(state): State<AppState>,
    admin: AdminActor,
) -> ApiResult<Json<Value>> {
    let defs = DefinitionSet::load_dir(&state.config.definitions_dir)
        .await
        .map_err(|e| EngineError::InvalidDefinition(e.to_string()))?;
    let counts = json!({ "templates": defs.templates.len(), "modules": defs.modules.len() });
    state.engine.catalog.reload(defs);
    tracing::info!(actor = %admin.actor, "Definitions reloaded");
    Ok(Json(counts))
}
