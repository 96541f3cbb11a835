use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    Json,
};
use serde_json::{json, Value};

use crate::models::custom::Approver;
use crate::AppState;

const DEFAULT_ACTOR: &str = "admin";

/// Authenticated operator. Validates `X-Admin-Key` against `config.admin_key`;
/// `X-Actor` names who is acting, and a matching `X-Elevated-Key` grants
/// elevated approval.
#[derive(Debug, Clone)]
pub struct AdminActor {
    pub actor: String,
    pub elevated: bool,
}

impl AdminActor {
    pub fn approver(&self) -> Approver {
        if self.elevated {
            Approver::elevated(&self.actor)
        } else {
            Approver::standard(&self.actor)
        }
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}

impl FromRequestParts<AppState> for AdminActor {
    type Rejection = (StatusCode, Json<Value>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let key = header(parts, "X-Admin-Key").ok_or((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Missing X-Admin-Key header", "code": "unauthorized" })),
        ))?;
        if key != state.config.admin_key {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Invalid admin key", "code": "unauthorized" })),
            ));
        }

        let actor = header(parts, "X-Actor")
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .unwrap_or(DEFAULT_ACTOR)
            .to_string();
        let elevated = header(parts, "X-Elevated-Key")
            .is_some_and(|k| k == state.config.elevated_admin_key);

        Ok(AdminActor { actor, elevated })
    }
}
