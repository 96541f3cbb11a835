use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::migration::{Layer, MigrationUnit, Operation, UnitId, Version};
use super::tenant::TenantId;

/// `Pending -> Approved -> Applied -> RolledBack`, `Pending -> Rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomStatus {
    Pending,
    Approved,
    Applied,
    Rejected,
    RolledBack,
}

impl CustomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CustomStatus::Pending => "pending",
            CustomStatus::Approved => "approved",
            CustomStatus::Applied => "applied",
            CustomStatus::Rejected => "rejected",
            CustomStatus::RolledBack => "rolled_back",
        }
    }

    pub fn can_transition_to(self, to: CustomStatus) -> bool {
        use CustomStatus::*;
        matches!(
            (self, to),
            (Pending, Approved) | (Pending, Rejected) | (Approved, Applied) | (Applied, RolledBack)
        )
    }
}

impl fmt::Display for CustomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CustomStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CustomStatus::Pending),
            "approved" => Ok(CustomStatus::Approved),
            "applied" => Ok(CustomStatus::Applied),
            "rejected" => Ok(CustomStatus::Rejected),
            "rolled_back" => Ok(CustomStatus::RolledBack),
            other => Err(format!("unknown custom migration status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Privilege {
    Standard,
    Elevated,
}

/// Someone allowed to decide on custom migration requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approver {
    pub id: String,
    pub privilege: Privilege,
}

impl Approver {
    pub fn standard(id: impl Into<String>) -> Self {
        Self { id: id.into(), privilege: Privilege::Standard }
    }

    pub fn elevated(id: impl Into<String>) -> Self {
        Self { id: id.into(), privilege: Privilege::Elevated }
    }

    pub fn is_elevated(&self) -> bool {
        self.privilege == Privilege::Elevated
    }
}

/// A tenant-specific, human-reviewed schema change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomMigrationRequest {
    pub id: Uuid,
    pub tenant: TenantId,
    pub requester: String,
    pub forward: Operation,
    pub reverse: Option<Operation>,
    pub description: String,
    pub status: CustomStatus,
    pub approver: Option<String>,
    pub decision_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub applied_at: Option<DateTime<Utc>>,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

/// Custom units carry no template/module version of their own.
pub const CUSTOM_UNIT_VERSION: Version = Version::new(0, 0, 0);

impl CustomMigrationRequest {
    pub fn new(
        tenant: TenantId,
        requester: &str,
        forward: Operation,
        reverse: Option<Operation>,
        description: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant,
            requester: requester.to_string(),
            forward,
            reverse,
            description: description.to_string(),
            status: CustomStatus::Pending,
            approver: None,
            decision_note: None,
            created_at: Utc::now(),
            decided_at: None,
            applied_at: None,
            rolled_back_at: None,
        }
    }

    /// The Custom-layer unit this request becomes once approved. The owner is
    /// the request id, so the unit and its hash are scoped to one tenant.
    pub fn to_unit(&self) -> MigrationUnit {
        MigrationUnit::new(
            UnitId {
                layer: Layer::Custom,
                owner: self.id.to_string(),
                name: "custom".into(),
            },
            CUSTOM_UNIT_VERSION,
            self.forward.clone(),
            self.reverse.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_edges() {
        use CustomStatus::*;
        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Approved.can_transition_to(Applied));
        assert!(Applied.can_transition_to(RolledBack));
        assert!(!Pending.can_transition_to(Applied));
        assert!(!Rejected.can_transition_to(Approved));
        assert!(!RolledBack.can_transition_to(Applied));
    }

    #[test]
    fn units_of_distinct_requests_never_share_a_hash() {
        let t = TenantId::parse("T1").unwrap();
        let a = CustomMigrationRequest::new(t.clone(), "ops", Operation::sql("SELECT 1"), None, "a");
        let b = CustomMigrationRequest::new(t, "ops", Operation::sql("SELECT 1"), None, "b");
        assert_ne!(a.to_unit().content_hash, b.to_unit().content_hash);
        assert_eq!(a.to_unit().id.layer, Layer::Custom);
    }
}
