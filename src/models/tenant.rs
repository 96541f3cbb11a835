use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::migration::Version;

/// Identifier of one isolated tenant database.
///
/// Canonical form: ASCII lower-case letters, digits and single `_`
/// separators, at most [`TenantId::MAX_LEN`] chars. Input is lower-cased and
/// `-` is read as `_`, so `Party-One` and `party_one` are the same tenant.
/// The id is used verbatim as lock key and in the database name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// `tenant_` plus the id stays within Postgres' 63-byte identifier limit.
    pub const MAX_LEN: usize = 63 - DATABASE_PREFIX.len();

    pub fn parse(s: &str) -> Result<Self, String> {
        let canonical = s.trim().to_ascii_lowercase().replace('-', "_");
        let valid = !canonical.is_empty()
            && canonical.len() <= Self::MAX_LEN
            && canonical.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            && !canonical.starts_with('_')
            && !canonical.ends_with('_')
            && !canonical.contains("__");
        if valid {
            Ok(Self(canonical))
        } else {
            Err(format!(
                "invalid tenant id '{s}': use letters, digits and single '-' or '_' separators, at most {} chars",
                Self::MAX_LEN
            ))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the tenant's own database, unique per canonical id.
    pub fn database_name(&self) -> String {
        format!("{DATABASE_PREFIX}{}", self.0)
    }
}

const DATABASE_PREFIX: &str = "tenant_";

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for TenantId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Lifecycle of a tenant's provisioning.
///
/// ```text
/// Draft -> Pending -> Provisioning -> Active
/// Provisioning -> Failed -> Pending
/// Active -> Suspended -> Active
/// * -> Archived
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Draft,
    Pending,
    Provisioning,
    Active,
    Failed,
    Suspended,
    Archived,
}

impl TenantStatus {
    pub const ALL: [TenantStatus; 7] = [
        TenantStatus::Draft,
        TenantStatus::Pending,
        TenantStatus::Provisioning,
        TenantStatus::Active,
        TenantStatus::Failed,
        TenantStatus::Suspended,
        TenantStatus::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Draft => "draft",
            TenantStatus::Pending => "pending",
            TenantStatus::Provisioning => "provisioning",
            TenantStatus::Active => "active",
            TenantStatus::Failed => "failed",
            TenantStatus::Suspended => "suspended",
            TenantStatus::Archived => "archived",
        }
    }

    pub fn can_transition_to(self, to: TenantStatus) -> bool {
        use TenantStatus::*;
        match (self, to) {
            (Archived, _) => false,
            (_, Archived) => true,
            (Draft, Pending)
            | (Pending, Provisioning)
            | (Provisioning, Active)
            | (Provisioning, Failed)
            | (Failed, Pending)
            | (Active, Suspended)
            | (Suspended, Active) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TenantStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TenantStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown tenant status '{s}'"))
    }
}

/// A template or module as recorded on a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedDefinition {
    pub slug: String,
    pub version: Version,
}

/// Per-tenant provisioning record kept in the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantState {
    pub tenant: TenantId,
    pub status: TenantStatus,
    pub template: Option<AppliedDefinition>,
    pub modules: BTreeMap<String, Version>,
    /// Aggregate hash of the expected structure after the last successful apply.
    pub fingerprint: Option<String>,
    pub last_drift_check: Option<DateTime<Utc>>,
    /// Last unit applied, as `layer/owner/name`.
    pub checkpoint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TenantState {
    pub fn new(tenant: TenantId) -> Self {
        let now = Utc::now();
        Self {
            tenant,
            status: TenantStatus::Draft,
            template: None,
            modules: BTreeMap::new(),
            fingerprint: None,
            last_drift_check: None,
            checkpoint: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TenantStatus::*;

    #[test]
    fn allowed_transitions() {
        assert!(Draft.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Provisioning));
        assert!(Provisioning.can_transition_to(Active));
        assert!(Provisioning.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        assert!(Active.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Active));
        for s in TenantStatus::ALL {
            if s != Archived {
                assert!(s.can_transition_to(Archived), "{s} -> archived");
            }
        }
    }

    #[test]
    fn rejected_transitions() {
        assert!(!Draft.can_transition_to(Provisioning));
        assert!(!Active.can_transition_to(Provisioning));
        assert!(!Failed.can_transition_to(Provisioning));
        assert!(!Pending.can_transition_to(Active));
        assert!(!Suspended.can_transition_to(Pending));
        for s in TenantStatus::ALL {
            assert!(!Archived.can_transition_to(s));
        }
    }

    #[test]
    fn tenant_id_validation() {
        assert!(TenantId::parse("T1").is_ok());
        assert!(TenantId::parse("party-nepal_01").is_ok());
        assert!(TenantId::parse("").is_err());
        assert!(TenantId::parse("-bad").is_err());
        assert!(TenantId::parse("bad_").is_err());
        assert!(TenantId::parse("a;drop").is_err());
        assert!(TenantId::parse("caf\u{e9}").is_err());
    }

    #[test]
    fn spellings_of_one_tenant_are_one_id() {
        let a = TenantId::parse("Party-One").unwrap();
        let b = TenantId::parse("party_one").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "party_one");
        assert_eq!(a.database_name(), b.database_name());
        // Separators must not collapse into each other either.
        assert!(TenantId::parse("party-_one").is_err());
        assert!(TenantId::parse("party__one").is_err());
    }

    #[test]
    fn database_name_fits_a_postgres_identifier() {
        let longest = "a".repeat(TenantId::MAX_LEN);
        let t = TenantId::parse(&longest).unwrap();
        assert_eq!(t.database_name().len(), 63);
        assert!(TenantId::parse(&format!("{longest}b")).is_err());

        let shared = "x".repeat(TenantId::MAX_LEN - 1);
        let a = TenantId::parse(&format!("{shared}a")).unwrap();
        let b = TenantId::parse(&format!("{shared}b")).unwrap();
        assert_ne!(a.database_name(), b.database_name());
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in TenantStatus::ALL {
            assert_eq!(s.as_str().parse::<TenantStatus>().unwrap(), s);
        }
    }
}
