use serde::{Deserialize, Serialize};

use super::migration::{Layer, UnitRef};
use super::tenant::TenantId;

/// Outcome of one `apply` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyResult {
    pub tenant: TenantId,
    pub layer: Layer,
    pub applied: Vec<UnitRef>,
    /// Units whose content hash was already applied for this tenant.
    pub skipped: Vec<UnitRef>,
    /// Only set by a verification no-op: units expected but absent from the ledger.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unverified: Vec<UnitRef>,
    pub duration_ms: u64,
}

impl ApplyResult {
    pub fn new(tenant: TenantId, layer: Layer) -> Self {
        Self {
            tenant,
            layer,
            applied: Vec::new(),
            skipped: Vec::new(),
            unverified: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Combined results of a template or module request, one per `apply` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningOutcome {
    pub tenant: TenantId,
    pub calls: Vec<ApplyResult>,
    pub fingerprint: Option<String>,
}

impl ProvisioningOutcome {
    pub fn applied_count(&self) -> usize {
        self.calls.iter().map(|c| c.applied.len()).sum()
    }
}

/// Error prefix of a reverse that committed but whose ledger entry was lost.
pub const REVERSED_NOT_RECORDED: &str = "reversed but not recorded";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RollbackStatus {
    RolledBack,
    Failed { error: String },
}

/// What happened to a unit applied earlier in a call that then failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub unit: UnitRef,
    #[serde(flatten)]
    pub status: RollbackStatus,
}

impl RollbackReport {
    pub fn succeeded(&self) -> bool {
        self.status == RollbackStatus::RolledBack
    }
}

/// Why a unit failed inside `apply`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    Execution { error: String },
    Timeout { after_secs: u64 },
    Cancelled,
    AuditWrite { error: String },
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::Execution { error } => write!(f, "{error}"),
            FailureCause::Timeout { after_secs } => write!(f, "timed out after {after_secs}s"),
            FailureCause::Cancelled => write!(f, "cancelled"),
            FailureCause::AuditWrite { error } => write!(f, "audit write failed: {error}"),
        }
    }
}
