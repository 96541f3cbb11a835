use axum::{http::StatusCode, Json};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::models::migration::{Layer, UnitRef, Version};
use crate::models::provisioning::{FailureCause, RollbackReport, RollbackStatus, REVERSED_NOT_RECORDED};
use crate::models::tenant::TenantId;
use crate::services::connection::ConnectionError;
use crate::services::store::StoreError;

/// Details of a failed `apply` call: which unit failed, why, and what
/// happened to every unit applied earlier in the same call.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisioningFailure {
    pub tenant: TenantId,
    pub layer: Layer,
    pub failed_unit: UnitRef,
    pub cause: FailureCause,
    pub rollbacks: Vec<RollbackReport>,
    /// Set when the `failed` ledger entry for this call could not be written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unrecorded: Option<String>,
}

impl ProvisioningFailure {
    pub fn fully_rolled_back(&self) -> bool {
        self.rollbacks.iter().all(RollbackReport::succeeded)
    }

    /// The ledger holds a `failed` entry for the unit and an entry for every rollback.
    pub fn fully_recorded(&self) -> bool {
        self.unrecorded.is_none()
            && self.rollbacks.iter().all(|r| match &r.status {
                RollbackStatus::RolledBack => true,
                RollbackStatus::Failed { error } => !error.starts_with(REVERSED_NOT_RECORDED),
            })
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown tenant '{0}'")]
    UnknownTenant(TenantId),

    #[error("tenant '{0}' already exists")]
    TenantExists(TenantId),

    #[error("{0}")]
    InvalidTenantId(String),

    #[error("unknown template '{slug}'{}", .version.as_ref().map(|v| format!("@{v}")).unwrap_or_default())]
    UnknownTemplate { slug: String, version: Option<Version> },

    #[error("unknown module '{0}'")]
    UnknownModule(String),

    #[error("unknown custom migration request {0}")]
    UnknownRequest(Uuid),

    #[error("circular dependency among modules: {}", .cycle.join(", "))]
    CircularDependency { cycle: Vec<String> },

    #[error("module '{module}' requires '{missing}', which is neither selected nor installed")]
    MissingDependency { module: String, missing: String },

    #[error("conflicting modules: {}", .pairs.iter().map(|(a, b)| format!("{a} <-> {b}")).collect::<Vec<_>>().join(", "))]
    ConflictingModules { pairs: Vec<(String, String)> },

    #[error("module '{module}' is not compatible with template '{template}'")]
    IncompatibleModule { template: String, module: String },

    #[error("tenant already has template '{applied}'; cannot apply '{requested}'")]
    TemplateLocked { applied: String, requested: String },

    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("provisioning already in progress for tenant '{0}'")]
    ProvisioningInProgress(TenantId),

    #[error("provisioning failed for tenant '{}' at {} ({}): {}", .0.tenant, .0.failed_unit, .0.layer, .0.cause)]
    ProvisioningFailed(Box<ProvisioningFailure>),

    /// `request` is unset when nothing was filed, as for a refused drift repair.
    #[error(
        "{} contains destructive operations ({}) and needs an elevated approver",
        .request.map(|r| format!("request {r}")).unwrap_or_else(|| "change".into()),
        .matched.join(", ")
    )]
    ElevatedApprovalRequired { request: Option<Uuid>, matched: Vec<String> },

    #[error("drift detection unavailable for tenant '{tenant}': {reason}")]
    DriftDetectionUnavailable { tenant: TenantId, reason: String },

    #[error("audit ledger write failed: {0}")]
    AuditWriteFailed(String),

    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("tenant '{tenant}' database error: {source}")]
    Connection {
        tenant: TenantId,
        #[source]
        source: ConnectionError,
    },

    #[error("control plane storage error: {0}")]
    Storage(#[from] StoreError),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn tenant_transition(from: impl ToString, to: impl ToString) -> Self {
        EngineError::InvalidTransition {
            entity: "tenant",
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Stable, programmatic error code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::UnknownTenant(_) => "unknown_tenant",
            EngineError::TenantExists(_) => "tenant_exists",
            EngineError::InvalidTenantId(_) => "invalid_tenant_id",
            EngineError::UnknownTemplate { .. } => "unknown_template",
            EngineError::UnknownModule(_) => "unknown_module",
            EngineError::UnknownRequest(_) => "unknown_request",
            EngineError::CircularDependency { .. } => "circular_dependency",
            EngineError::MissingDependency { .. } => "missing_dependency",
            EngineError::ConflictingModules { .. } => "conflicting_modules",
            EngineError::IncompatibleModule { .. } => "incompatible_module",
            EngineError::TemplateLocked { .. } => "template_locked",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::ProvisioningInProgress(_) => "provisioning_in_progress",
            EngineError::ProvisioningFailed(_) => "provisioning_failed",
            EngineError::ElevatedApprovalRequired { .. } => "elevated_approval_required",
            EngineError::DriftDetectionUnavailable { .. } => "drift_detection_unavailable",
            EngineError::AuditWriteFailed(_) => "audit_write_failed",
            EngineError::InvalidDefinition(_) => "invalid_definition",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::Connection { .. } => "tenant_connection_error",
            EngineError::Storage(_) => "storage_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            EngineError::UnknownTenant(_)
            | EngineError::UnknownTemplate { .. }
            | EngineError::UnknownModule(_)
            | EngineError::UnknownRequest(_) => StatusCode::NOT_FOUND,
            EngineError::InvalidTenantId(_)
            | EngineError::InvalidDefinition(_)
            | EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::CircularDependency { .. }
            | EngineError::MissingDependency { .. }
            | EngineError::ConflictingModules { .. }
            | EngineError::IncompatibleModule { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::TenantExists(_)
            | EngineError::TemplateLocked { .. }
            | EngineError::InvalidTransition { .. }
            | EngineError::ProvisioningInProgress(_)
            | EngineError::DriftDetectionUnavailable { .. } => StatusCode::CONFLICT,
            EngineError::ElevatedApprovalRequired { .. } => StatusCode::FORBIDDEN,
            EngineError::ProvisioningFailed(_)
            | EngineError::AuditWriteFailed(_)
            | EngineError::Connection { .. }
            | EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON body: `{"error", "code", ...details}`.
    pub fn to_json(&self) -> Value {
        let mut body = json!({ "error": self.to_string(), "code": self.code() });
        let details = match self {
            EngineError::CircularDependency { cycle } => json!({ "cycle": cycle }),
            EngineError::MissingDependency { module, missing } => {
                json!({ "module": module, "missing": missing })
            }
            EngineError::ConflictingModules { pairs } => json!({ "pairs": pairs }),
            EngineError::ProvisioningFailed(failure) => json!({ "failure": failure }),
            EngineError::ElevatedApprovalRequired { request, matched } => {
                json!({ "request": request, "matched": matched })
            }
            _ => Value::Null,
        };
        if let (Some(obj), Value::Object(extra)) = (body.as_object_mut(), details) {
            obj.extend(extra);
        }
        body
    }
}

/// Handlers answer `Result<_, (StatusCode, Json<Value>)>`; `?` converts.
impl From<EngineError> for (StatusCode, Json<Value>) {
    fn from(e: EngineError) -> Self {
        if e.status().is_server_error() {
            tracing::error!(code = e.code(), "{e}");
        }
        (e.status(), Json(e.to_json()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dependency_body_carries_both_slugs() {
        let err = EngineError::MissingDependency {
            module: "election_campaign".into(),
            missing: "membership_management".into(),
        };
        let body = err.to_json();
        assert_eq!(body["code"], "missing_dependency");
        assert_eq!(body["module"], "election_campaign");
        assert_eq!(body["missing"], "membership_management");
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn conflicting_modules_lists_every_pair() {
        let err = EngineError::ConflictingModules {
            pairs: vec![("a".into(), "b".into()), ("c".into(), "d".into())],
        };
        assert_eq!(err.to_string(), "conflicting modules: a <-> b, c <-> d");
        assert_eq!(err.to_json()["pairs"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn unknown_template_mentions_version() {
        let err = EngineError::UnknownTemplate {
            slug: "political_party_nepal".into(),
            version: Some(Version::new(2, 0, 0)),
        };
        assert_eq!(err.to_string(), "unknown template 'political_party_nepal@2.0.0'");
    }
}
