use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::AppState;

/// Control-plane liveness plus the number of loaded definitions.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let defs = state.engine.catalog.definitions();
    let definitions = json!({
        "templates": defs.templates.len(),
        "modules": defs.modules.len(),
    });
    match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "db": "connected", "definitions": definitions })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "error", "db": e.to_string() })),
        ),
    }
}
