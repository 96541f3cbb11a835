use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::migration::{Layer, MigrationUnit, UnitId};
use super::tenant::TenantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Applied,
    Failed,
    RolledBack,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Applied => "applied",
            AuditOutcome::Failed => "failed",
            AuditOutcome::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "applied" => Ok(AuditOutcome::Applied),
            "failed" => Ok(AuditOutcome::Failed),
            "rolled_back" => Ok(AuditOutcome::RolledBack),
            other => Err(format!("unknown audit outcome '{other}'")),
        }
    }
}

/// Whether the entry is about the forward or the reverse operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Reverse => "reverse",
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "forward" => Ok(Direction::Forward),
            "reverse" => Ok(Direction::Reverse),
            other => Err(format!("unknown direction '{other}'")),
        }
    }
}

/// An entry to append. The ledger assigns `seq`.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub tenant: TenantId,
    pub unit: UnitId,
    pub content_hash: String,
    pub direction: Direction,
    pub outcome: AuditOutcome,
    pub actor: String,
    pub at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error: Option<String>,
    /// Content hash of the unit whose reverse operation can undo this entry.
    pub reverse_ref: Option<String>,
}

impl NewAuditEntry {
    pub fn for_unit(
        tenant: &TenantId,
        unit: &MigrationUnit,
        direction: Direction,
        outcome: AuditOutcome,
        actor: &str,
    ) -> Self {
        Self {
            tenant: tenant.clone(),
            unit: unit.id.clone(),
            content_hash: unit.content_hash.clone(),
            direction,
            outcome,
            actor: actor.to_string(),
            at: Utc::now(),
            duration_ms: 0,
            error: None,
            reverse_ref: unit.reverse.as_ref().map(|_| unit.content_hash.clone()),
        }
    }

    pub fn took(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Immutable, write-once ledger record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: i64,
    pub tenant: TenantId,
    pub layer: Layer,
    pub unit: UnitId,
    pub content_hash: String,
    pub direction: Direction,
    pub outcome: AuditOutcome,
    pub actor: String,
    pub at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub reverse_ref: Option<String>,
}

impl AuditEntry {
    pub fn from_new(seq: i64, e: NewAuditEntry) -> Self {
        Self {
            seq,
            layer: e.unit.layer,
            tenant: e.tenant,
            unit: e.unit,
            content_hash: e.content_hash,
            direction: e.direction,
            outcome: e.outcome,
            actor: e.actor,
            at: e.at,
            duration_ms: e.duration_ms,
            error: e.error,
            reverse_ref: e.reverse_ref,
        }
    }
}
