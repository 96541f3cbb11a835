use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::models::audit::{AuditEntry, NewAuditEntry};
use crate::models::custom::{CustomMigrationRequest, CustomStatus};
use crate::models::migration::{Layer, Operation, UnitId, Version};
use crate::models::snapshot::{Fingerprint, SchemaSnapshot, SchemaStructure, SnapshotKind};
use crate::models::tenant::{AppliedDefinition, TenantId, TenantState};
use crate::services::store::{ControlStore, StoreError};

/// Control-plane store backed by the platform's Postgres database
/// (tables created by `migrations/0001_control_plane.sql`).
#[derive(Clone)]
pub struct PgControlStore {
    pool: PgPool,
}

impl PgControlStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn corrupt(what: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{what}: {e}"))
}

fn unique_violation(e: sqlx::Error, key: String) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => StoreError::Duplicate(key),
        _ => StoreError::Database(e),
    }
}

// ─── Rows ─────────────────────────────────────────────────────────────────────

#[derive(FromRow)]
struct TenantRow {
    tenant: String,
    status: String,
    template_slug: Option<String>,
    template_version: Option<String>,
    modules: Json<BTreeMap<String, Version>>,
    fingerprint: Option<String>,
    last_drift_check: Option<DateTime<Utc>>,
    checkpoint: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TenantRow> for TenantState {
    type Error = StoreError;

    fn try_from(r: TenantRow) -> Result<Self, Self::Error> {
        let template = match (r.template_slug, r.template_version) {
            (Some(slug), Some(version)) => Some(AppliedDefinition {
                slug,
                version: version.parse().map_err(|e| corrupt("template_version", e))?,
            }),
            _ => None,
        };
        Ok(TenantState {
            tenant: TenantId::parse(&r.tenant).map_err(|e| corrupt("tenant", e))?,
            status: r.status.parse().map_err(|e| corrupt("status", e))?,
            template,
            modules: r.modules.0,
            fingerprint: r.fingerprint,
            last_drift_check: r.last_drift_check,
            checkpoint: r.checkpoint,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(FromRow)]
struct AuditRow {
    seq: i64,
    tenant: String,
    layer: String,
    owner: String,
    unit_name: String,
    content_hash: String,
    direction: String,
    outcome: String,
    actor: String,
    at: DateTime<Utc>,
    duration_ms: i64,
    error: Option<String>,
    reverse_ref: Option<String>,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = StoreError;

    fn try_from(r: AuditRow) -> Result<Self, Self::Error> {
        let layer: Layer = r.layer.parse().map_err(|e| corrupt("layer", e))?;
        Ok(AuditEntry {
            seq: r.seq,
            tenant: TenantId::parse(&r.tenant).map_err(|e| corrupt("tenant", e))?,
            layer,
            unit: UnitId { layer, owner: r.owner, name: r.unit_name },
            content_hash: r.content_hash,
            direction: r.direction.parse().map_err(|e| corrupt("direction", e))?,
            outcome: r.outcome.parse().map_err(|e| corrupt("outcome", e))?,
            actor: r.actor,
            at: r.at,
            duration_ms: r.duration_ms.max(0) as u64,
            error: r.error,
            reverse_ref: r.reverse_ref,
        })
    }
}

#[derive(FromRow)]
struct SnapshotRow {
    id: Uuid,
    tenant: String,
    kind: String,
    captured_at: DateTime<Utc>,
    fingerprint: Json<Fingerprint>,
    structure: Json<SchemaStructure>,
}

impl TryFrom<SnapshotRow> for SchemaSnapshot {
    type Error = StoreError;

    fn try_from(r: SnapshotRow) -> Result<Self, Self::Error> {
        let kind = match r.kind.as_str() {
            "observed" => SnapshotKind::Observed,
            "baseline" => SnapshotKind::Baseline,
            other => return Err(corrupt("kind", other)),
        };
        Ok(SchemaSnapshot {
            id: r.id,
            tenant: TenantId::parse(&r.tenant).map_err(|e| corrupt("tenant", e))?,
            kind,
            captured_at: r.captured_at,
            fingerprint: r.fingerprint.0,
            structure: r.structure.0,
        })
    }
}

#[derive(FromRow)]
struct CustomRow {
    id: Uuid,
    tenant: String,
    requester: String,
    forward: Json<Operation>,
    reverse: Option<Json<Operation>>,
    description: String,
    status: String,
    approver: Option<String>,
    decision_note: Option<String>,
    created_at: DateTime<Utc>,
    decided_at: Option<DateTime<Utc>>,
    applied_at: Option<DateTime<Utc>>,
    rolled_back_at: Option<DateTime<Utc>>,
}

impl TryFrom<CustomRow> for CustomMigrationRequest {
    type Error = StoreError;

    fn try_from(r: CustomRow) -> Result<Self, Self::Error> {
        Ok(CustomMigrationRequest {
            id: r.id,
            tenant: TenantId::parse(&r.tenant).map_err(|e| corrupt("tenant", e))?,
            requester: r.requester,
            forward: r.forward.0,
            reverse: r.reverse.map(|j| j.0),
            description: r.description,
            status: r.status.parse().map_err(|e| corrupt("status", e))?,
            approver: r.approver,
            decision_note: r.decision_note,
            created_at: r.created_at,
            decided_at: r.decided_at,
            applied_at: r.applied_at,
            rolled_back_at: r.rolled_back_at,
        })
    }
}

const TENANT_COLUMNS: &str = "tenant, status, template_slug, template_version, modules, fingerprint,
     last_drift_check, checkpoint, created_at, updated_at";

const AUDIT_COLUMNS: &str = "seq, tenant, layer, owner, unit_name, content_hash, direction, outcome,
     actor, at, duration_ms, error, reverse_ref";

const CUSTOM_COLUMNS: &str = "id, tenant, requester, forward, reverse, description, status, approver,
     decision_note, created_at, decided_at, applied_at, rolled_back_at";

#[async_trait]
impl ControlStore for PgControlStore {
    async fn insert_tenant(&self, state: &TenantState) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO tenant_provisioning
                (tenant, status, template_slug, template_version, modules, fingerprint,
                 last_drift_check, checkpoint, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(state.tenant.as_str())
        .bind(state.status.as_str())
        .bind(state.template.as_ref().map(|t| t.slug.clone()))
        .bind(state.template.as_ref().map(|t| t.version.to_string()))
        .bind(Json(&state.modules))
        .bind(&state.fingerprint)
        .bind(state.last_drift_check)
        .bind(&state.checkpoint)
        .bind(state.created_at)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| unique_violation(e, state.tenant.to_string()))?;
        Ok(())
    }

    async fn tenant(&self, tenant: &TenantId) -> Result<Option<TenantState>, StoreError> {
        let row: Option<TenantRow> = sqlx::query_as(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenant_provisioning WHERE tenant = $1"
        ))
        .bind(tenant.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TenantState::try_from).transpose()
    }

    async fn list_tenants(&self) -> Result<Vec<TenantState>, StoreError> {
        let rows: Vec<TenantRow> = sqlx::query_as(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenant_provisioning ORDER BY tenant"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TenantState::try_from).collect()
    }

    async fn save_tenant(&self, state: &TenantState) -> Result<(), StoreError> {
        let res = sqlx::query(
            "UPDATE tenant_provisioning SET
               status = $2, template_slug = $3, template_version = $4, modules = $5,
               fingerprint = $6, last_drift_check = $7, checkpoint = $8, updated_at = $9
             WHERE tenant = $1",
        )
        .bind(state.tenant.as_str())
        .bind(state.status.as_str())
        .bind(state.template.as_ref().map(|t| t.slug.clone()))
        .bind(state.template.as_ref().map(|t| t.version.to_string()))
        .bind(Json(&state.modules))
        .bind(&state.fingerprint)
        .bind(state.last_drift_check)
        .bind(&state.checkpoint)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound(state.tenant.to_string()));
        }
        Ok(())
    }

    async fn record_drift_check(&self, tenant: &TenantId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let res = sqlx::query("UPDATE tenant_provisioning SET last_drift_check = $2 WHERE tenant = $1")
            .bind(tenant.as_str())
            .bind(at)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound(tenant.to_string()));
        }
        Ok(())
    }

    async fn append_audit(&self, e: NewAuditEntry) -> Result<AuditEntry, StoreError> {
        let row: AuditRow = sqlx::query_as(&format!(
            "INSERT INTO audit_ledger
                (tenant, layer, owner, unit_name, content_hash, direction, outcome,
                 actor, at, duration_ms, error, reverse_ref)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             RETURNING {AUDIT_COLUMNS}"
        ))
        .bind(e.tenant.as_str())
        .bind(e.unit.layer.as_str())
        .bind(&e.unit.owner)
        .bind(&e.unit.name)
        .bind(&e.content_hash)
        .bind(e.direction.as_str())
        .bind(e.outcome.as_str())
        .bind(&e.actor)
        .bind(e.at)
        .bind(e.duration_ms as i64)
        .bind(&e.error)
        .bind(&e.reverse_ref)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn audit_history(&self, tenant: &TenantId, layer: Option<Layer>) -> Result<Vec<AuditEntry>, StoreError> {
        let rows: Vec<AuditRow> = sqlx::query_as(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_ledger
             WHERE tenant = $1 AND ($2::TEXT IS NULL OR layer = $2)
             ORDER BY seq"
        ))
        .bind(tenant.as_str())
        .bind(layer.map(|l| l.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AuditEntry::try_from).collect()
    }

    async fn save_snapshot(&self, s: &SchemaSnapshot) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO schema_snapshots
                (id, tenant, kind, captured_at, aggregate_hash, fingerprint, structure)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(s.id)
        .bind(s.tenant.as_str())
        .bind(s.kind.as_str())
        .bind(s.captured_at)
        .bind(&s.fingerprint.aggregate)
        .bind(Json(&s.fingerprint))
        .bind(Json(&s.structure))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_snapshot(&self, tenant: &TenantId, kind: SnapshotKind) -> Result<Option<SchemaSnapshot>, StoreError> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            "SELECT id, tenant, kind, captured_at, fingerprint, structure
             FROM schema_snapshots
             WHERE tenant = $1 AND kind = $2
             ORDER BY captured_at DESC
             LIMIT 1",
        )
        .bind(tenant.as_str())
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(SchemaSnapshot::try_from).transpose()
    }

    async fn insert_custom_request(&self, r: &CustomMigrationRequest) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO custom_migration_requests ({CUSTOM_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(r.id)
        .bind(r.tenant.as_str())
        .bind(&r.requester)
        .bind(Json(&r.forward))
        .bind(r.reverse.as_ref().map(Json))
        .bind(&r.description)
        .bind(r.status.as_str())
        .bind(&r.approver)
        .bind(&r.decision_note)
        .bind(r.created_at)
        .bind(r.decided_at)
        .bind(r.applied_at)
        .bind(r.rolled_back_at)
        .execute(&self.pool)
        .await
        .map_err(|e| unique_violation(e, r.id.to_string()))?;
        Ok(())
    }

    async fn custom_request(&self, id: Uuid) -> Result<Option<CustomMigrationRequest>, StoreError> {
        let row: Option<CustomRow> = sqlx::query_as(&format!(
            "SELECT {CUSTOM_COLUMNS} FROM custom_migration_requests WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(CustomMigrationRequest::try_from).transpose()
    }

    async fn save_custom_request(&self, r: &CustomMigrationRequest) -> Result<(), StoreError> {
        let res = sqlx::query(
            "UPDATE custom_migration_requests SET
               status = $2, approver = $3, decision_note = $4,
               decided_at = $5, applied_at = $6, rolled_back_at = $7
             WHERE id = $1",
        )
        .bind(r.id)
        .bind(r.status.as_str())
        .bind(&r.approver)
        .bind(&r.decision_note)
        .bind(r.decided_at)
        .bind(r.applied_at)
        .bind(r.rolled_back_at)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound(r.id.to_string()));
        }
        Ok(())
    }

    async fn custom_requests(
        &self,
        tenant: &TenantId,
        status: Option<CustomStatus>,
    ) -> Result<Vec<CustomMigrationRequest>, StoreError> {
        let rows: Vec<CustomRow> = sqlx::query_as(&format!(
            "SELECT {CUSTOM_COLUMNS} FROM custom_migration_requests
             WHERE tenant = $1 AND ($2::TEXT IS NULL OR status = $2)
             ORDER BY created_at, id"
        ))
        .bind(tenant.as_str())
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CustomMigrationRequest::try_from).collect()
    }
}
