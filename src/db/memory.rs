//! In-memory control store and tenant databases.
//!
//! Used for dry runs (`provisionctl plan`) and by the test-suite. The tenant
//! databases replay structured operations onto a [`SchemaStructure`]; raw SQL
//! is recorded but has no structural effect.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::models::audit::{AuditEntry, NewAuditEntry};
use crate::models::custom::{CustomMigrationRequest, CustomStatus};
use crate::models::migration::{Layer, Operation, SchemaChange};
use crate::models::snapshot::{SchemaSnapshot, SchemaStructure, SnapshotKind, StructureError};
use crate::models::tenant::{TenantId, TenantState};
use crate::services::connection::{
    ConnectionError, ExclusionList, TenantConnection, TenantConnectionProvider,
};
use crate::services::store::{ControlStore, StoreError};

// ─── Tenant databases ─────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryDatabase {
    structure: SchemaStructure,
    committed: Vec<String>,
    fail_patterns: Vec<String>,
    delay: Option<Duration>,
}

#[derive(Default, Clone)]
pub struct MemoryTenantDatabases {
    dbs: Arc<DashMap<TenantId, Arc<Mutex<MemoryDatabase>>>>,
}

impl MemoryTenantDatabases {
    pub fn new() -> Self {
        Self::default()
    }

    fn db(&self, tenant: &TenantId) -> Arc<Mutex<MemoryDatabase>> {
        self.dbs.entry(tenant.clone()).or_default().clone()
    }

    pub fn structure(&self, tenant: &TenantId) -> SchemaStructure {
        self.db(tenant).lock().structure.clone()
    }

    /// Statements committed so far, in order.
    pub fn committed_statements(&self, tenant: &TenantId) -> Vec<String> {
        self.db(tenant).lock().committed.clone()
    }

    /// Any statement containing `pattern` fails from now on.
    pub fn fail_when_contains(&self, tenant: &TenantId, pattern: &str) {
        self.db(tenant).lock().fail_patterns.push(pattern.to_string());
    }

    pub fn clear_failures(&self, tenant: &TenantId) {
        self.db(tenant).lock().fail_patterns.clear();
    }

    /// Every statement execution sleeps for `delay` first.
    pub fn set_delay(&self, tenant: &TenantId, delay: Option<Duration>) {
        self.db(tenant).lock().delay = delay;
    }

    /// Changes the schema behind the engine's back, the way an operator with
    /// direct database access would.
    pub fn alter_out_of_band(&self, tenant: &TenantId, change: &SchemaChange) -> Result<(), StructureError> {
        self.db(tenant).lock().structure.apply(change)
    }
}

struct Working {
    structure: SchemaStructure,
    statements: Vec<String>,
}

pub struct MemoryConnection {
    db: Arc<Mutex<MemoryDatabase>>,
    tx: Option<Working>,
}

#[async_trait]
impl TenantConnection for MemoryConnection {
    async fn begin(&mut self) -> Result<(), ConnectionError> {
        if self.tx.is_some() {
            return Err(ConnectionError::TransactionOpen);
        }
        let structure = self.db.lock().structure.clone();
        self.tx = Some(Working { structure, statements: Vec::new() });
        Ok(())
    }

    async fn execute(&mut self, op: &Operation) -> Result<(), ConnectionError> {
        let (delay, fail_patterns) = {
            let db = self.db.lock();
            (db.delay, db.fail_patterns.clone())
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let tx = self.tx.as_mut().ok_or(ConnectionError::NoTransaction)?;
        let statements = op.to_sql();
        if let Some(stmt) = statements
            .iter()
            .find(|s| fail_patterns.iter().any(|p| s.contains(p.as_str())))
        {
            return Err(ConnectionError::Statement(format!("injected failure: {stmt}")));
        }
        if op.is_structured() {
            tx.structure
                .apply_operation(op)
                .map_err(|e| ConnectionError::Statement(e.to_string()))?;
        }
        tx.statements.extend(statements);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), ConnectionError> {
        let tx = self.tx.take().ok_or(ConnectionError::NoTransaction)?;
        let mut db = self.db.lock();
        db.structure = tx.structure;
        db.committed.extend(tx.statements);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), ConnectionError> {
        self.tx.take().map(|_| ()).ok_or(ConnectionError::NoTransaction)
    }

    async fn introspect(&mut self, excluded: &ExclusionList) -> Result<SchemaStructure, ConnectionError> {
        let mut structure = self.db.lock().structure.clone();
        structure.tables.retain(|name, _| !excluded.excludes(name));
        Ok(structure)
    }
}

#[async_trait]
impl TenantConnectionProvider for MemoryTenantDatabases {
    async fn connection_for(&self, tenant: &TenantId) -> Result<Box<dyn TenantConnection>, ConnectionError> {
        Ok(Box::new(MemoryConnection { db: self.db(tenant), tx: None }))
    }
}

// ─── Control store ────────────────────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    tenants: BTreeMap<TenantId, TenantState>,
    audit: Vec<AuditEntry>,
    snapshots: Vec<SchemaSnapshot>,
    requests: Vec<CustomMigrationRequest>,
}

#[derive(Default)]
pub struct MemoryControlStore {
    inner: Mutex<Inner>,
    fail_audit: AtomicBool,
}

impl MemoryControlStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every audit append fail until switched off again.
    pub fn fail_audit_writes(&self, fail: bool) {
        self.fail_audit.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ControlStore for MemoryControlStore {
    async fn insert_tenant(&self, state: &TenantState) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.tenants.contains_key(&state.tenant) {
            return Err(StoreError::Duplicate(state.tenant.to_string()));
        }
        inner.tenants.insert(state.tenant.clone(), state.clone());
        Ok(())
    }

    async fn tenant(&self, tenant: &TenantId) -> Result<Option<TenantState>, StoreError> {
        Ok(self.inner.lock().tenants.get(tenant).cloned())
    }

    async fn list_tenants(&self) -> Result<Vec<TenantState>, StoreError> {
        Ok(self.inner.lock().tenants.values().cloned().collect())
    }

    async fn save_tenant(&self, state: &TenantState) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        match inner.tenants.get_mut(&state.tenant) {
            Some(existing) => {
                *existing = state.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(state.tenant.to_string())),
        }
    }

    async fn record_drift_check(&self, tenant: &TenantId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let state = inner
            .tenants
            .get_mut(tenant)
            .ok_or_else(|| StoreError::NotFound(tenant.to_string()))?;
        state.last_drift_check = Some(at);
        Ok(())
    }

    async fn append_audit(&self, entry: NewAuditEntry) -> Result<AuditEntry, StoreError> {
        if self.fail_audit.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("audit ledger offline".into()));
        }
        let mut inner = self.inner.lock();
        let seq = inner.audit.last().map(|e| e.seq + 1).unwrap_or(1);
        let entry = AuditEntry::from_new(seq, entry);
        inner.audit.push(entry.clone());
        Ok(entry)
    }

    async fn audit_history(&self, tenant: &TenantId, layer: Option<Layer>) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(self
            .inner
            .lock()
            .audit
            .iter()
            .filter(|e| &e.tenant == tenant && layer.map_or(true, |l| e.layer == l))
            .cloned()
            .collect())
    }

    async fn save_snapshot(&self, snapshot: &SchemaSnapshot) -> Result<(), StoreError> {
        self.inner.lock().snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn latest_snapshot(&self, tenant: &TenantId, kind: SnapshotKind) -> Result<Option<SchemaSnapshot>, StoreError> {
        Ok(self
            .inner
            .lock()
            .snapshots
            .iter()
            .rev()
            .find(|s| &s.tenant == tenant && s.kind == kind)
            .cloned())
    }

    async fn insert_custom_request(&self, request: &CustomMigrationRequest) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.requests.iter().any(|r| r.id == request.id) {
            return Err(StoreError::Duplicate(request.id.to_string()));
        }
        inner.requests.push(request.clone());
        Ok(())
    }

    async fn custom_request(&self, id: Uuid) -> Result<Option<CustomMigrationRequest>, StoreError> {
        Ok(self.inner.lock().requests.iter().find(|r| r.id == id).cloned())
    }

    async fn save_custom_request(&self, request: &CustomMigrationRequest) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        match inner.requests.iter_mut().find(|r| r.id == request.id) {
            Some(existing) => {
                *existing = request.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(request.id.to_string())),
        }
    }

    async fn custom_requests(
        &self,
        tenant: &TenantId,
        status: Option<CustomStatus>,
    ) -> Result<Vec<CustomMigrationRequest>, StoreError> {
        Ok(self
            .inner
            .lock()
            .requests
            .iter()
            .filter(|r| &r.tenant == tenant && status.map_or(true, |s| r.status == s))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::snapshot::{ColumnDef, TableDef};

    fn create(name: &str) -> Operation {
        Operation::structured(vec![SchemaChange::CreateTable {
            table: TableDef {
                name: name.into(),
                columns: vec![ColumnDef::new("id", "uuid", false)],
                primary_key: vec!["id".into()],
                indexes: vec![],
                foreign_keys: vec![],
            },
        }])
    }

    #[tokio::test]
    async fn uncommitted_work_is_discarded_on_drop() {
        let dbs = MemoryTenantDatabases::new();
        let t = TenantId::parse("T1").unwrap();
        {
            let mut conn = dbs.connection_for(&t).await.unwrap();
            conn.begin().await.unwrap();
            conn.execute(&create("members")).await.unwrap();
        }
        assert!(dbs.structure(&t).tables.is_empty());

        let mut conn = dbs.connection_for(&t).await.unwrap();
        conn.begin().await.unwrap();
        conn.execute(&create("members")).await.unwrap();
        conn.commit().await.unwrap();
        assert!(dbs.structure(&t).tables.contains_key("members"));
        assert_eq!(dbs.committed_statements(&t).len(), 1);
    }

    #[tokio::test]
    async fn audit_sequence_is_monotonic() {
        use crate::models::audit::{AuditOutcome, Direction};
        use crate::models::migration::{MigrationUnit, UnitId, Version};

        let store = MemoryControlStore::new();
        let t = TenantId::parse("T1").unwrap();
        let unit = MigrationUnit::new(
            UnitId { layer: Layer::Basic, owner: "basic".into(), name: "001".into() },
            Version::new(1, 0, 0),
            Operation::sql("SELECT 1"),
            None,
        );
        let mut last = 0;
        for _ in 0..5 {
            let e = store
                .append_audit(NewAuditEntry::for_unit(&t, &unit, Direction::Forward, AuditOutcome::Applied, "ops"))
                .await
                .unwrap();
            assert!(e.seq > last);
            last = e.seq;
        }
        store.fail_audit_writes(true);
        assert!(store
            .append_audit(NewAuditEntry::for_unit(&t, &unit, Direction::Forward, AuditOutcome::Applied, "ops"))
            .await
            .is_err());
    }
}
