//! Control-plane storage seam: tenant provisioning state, the audit ledger,
//! schema snapshots and custom migration requests. All of it lives in the
//! platform's own database, never in a tenant database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::audit::{AuditEntry, NewAuditEntry};
use crate::models::custom::{CustomMigrationRequest, CustomStatus};
use crate::models::migration::Layer;
use crate::models::snapshot::{SchemaSnapshot, SnapshotKind};
use crate::models::tenant::{TenantId, TenantState};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("record already exists: {0}")]
    Duplicate(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ControlStore: Send + Sync {
    async fn insert_tenant(&self, state: &TenantState) -> Result<(), StoreError>;
    async fn tenant(&self, tenant: &TenantId) -> Result<Option<TenantState>, StoreError>;
    async fn list_tenants(&self) -> Result<Vec<TenantState>, StoreError>;
    async fn save_tenant(&self, state: &TenantState) -> Result<(), StoreError>;
    /// Sets only `last_drift_check`; every other field is left as stored.
    async fn record_drift_check(&self, tenant: &TenantId, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Appends one ledger entry and returns it with its sequence number.
    /// Sequence numbers increase strictly in append order.
    async fn append_audit(&self, entry: NewAuditEntry) -> Result<AuditEntry, StoreError>;
    /// Chronological (ascending `seq`) history, optionally for one layer.
    async fn audit_history(&self, tenant: &TenantId, layer: Option<Layer>) -> Result<Vec<AuditEntry>, StoreError>;

    async fn save_snapshot(&self, snapshot: &SchemaSnapshot) -> Result<(), StoreError>;
    async fn latest_snapshot(&self, tenant: &TenantId, kind: SnapshotKind) -> Result<Option<SchemaSnapshot>, StoreError>;

    async fn insert_custom_request(&self, request: &CustomMigrationRequest) -> Result<(), StoreError>;
    async fn custom_request(&self, id: Uuid) -> Result<Option<CustomMigrationRequest>, StoreError>;
    async fn save_custom_request(&self, request: &CustomMigrationRequest) -> Result<(), StoreError>;
    /// Requests of a tenant in creation order, optionally filtered by status.
    async fn custom_requests(
        &self,
        tenant: &TenantId,
        status: Option<CustomStatus>,
    ) -> Result<Vec<CustomMigrationRequest>, StoreError>;
}
