use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::models::snapshot::{SchemaSnapshot, SchemaStructure, SnapshotKind};
use crate::models::tenant::TenantId;
use crate::services::connection::{ExclusionList, TenantConnectionProvider};
use crate::services::store::ControlStore;

/// Captures the actual structure of a tenant database and keeps snapshot
/// history in the control plane.
pub struct SnapshotService {
    connections: Arc<dyn TenantConnectionProvider>,
    store: Arc<dyn ControlStore>,
    excluded: ExclusionList,
}

impl SnapshotService {
    pub fn new(
        connections: Arc<dyn TenantConnectionProvider>,
        store: Arc<dyn ControlStore>,
        excluded: ExclusionList,
    ) -> Self {
        Self { connections, store, excluded }
    }

    /// Introspects the tenant database. Nothing is stored.
    pub async fn capture(&self, tenant: &TenantId) -> EngineResult<SchemaSnapshot> {
        let connection_error = |source| EngineError::Connection { tenant: tenant.clone(), source };
        let mut conn = self
            .connections
            .connection_for(tenant)
            .await
            .map_err(connection_error)?;
        let structure = conn.introspect(&self.excluded).await.map_err(connection_error)?;
        let snapshot = SchemaSnapshot::new(tenant.clone(), SnapshotKind::Observed, structure);
        tracing::debug!(
            tenant = %tenant,
            tables = snapshot.structure.tables.len(),
            fingerprint = %snapshot.fingerprint.aggregate,
            "Schema captured"
        );
        Ok(snapshot)
    }

    /// Captures and stores an `observed` snapshot.
    pub async fn capture_and_store(&self, tenant: &TenantId) -> EngineResult<SchemaSnapshot> {
        let snapshot = self.capture(tenant).await?;
        self.store.save_snapshot(&snapshot).await?;
        Ok(snapshot)
    }

    /// Stores the expected structure. Excluded tables are dropped so the
    /// baseline compares like-for-like with captures.
    pub async fn record_baseline(&self, tenant: &TenantId, mut structure: SchemaStructure) -> EngineResult<SchemaSnapshot> {
        structure.tables.retain(|name, _| !self.excluded.excludes(name));
        let snapshot = SchemaSnapshot::new(tenant.clone(), SnapshotKind::Baseline, structure);
        self.store.save_snapshot(&snapshot).await?;
        Ok(snapshot)
    }

    pub async fn latest_baseline(&self, tenant: &TenantId) -> EngineResult<Option<SchemaSnapshot>> {
        Ok(self.store.latest_snapshot(tenant, SnapshotKind::Baseline).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::{MemoryControlStore, MemoryTenantDatabases};
    use crate::models::migration::SchemaChange;
    use crate::models::snapshot::{ColumnDef, TableDef};

    #[tokio::test]
    async fn capture_is_deterministic_and_honours_exclusions() {
        let dbs = MemoryTenantDatabases::new();
        let t = TenantId::parse("T1").unwrap();
        for name in ["members", "_sqlx_migrations"] {
            dbs.alter_out_of_band(
                &t,
                &SchemaChange::CreateTable {
                    table: TableDef {
                        name: name.into(),
                        columns: vec![ColumnDef::new("id", "uuid", false)],
                        primary_key: vec!["id".into()],
                        indexes: vec![],
                        foreign_keys: vec![],
                    },
                },
            )
            .unwrap();
        }
        let service = SnapshotService::new(
            Arc::new(dbs),
            Arc::new(MemoryControlStore::new()),
            ExclusionList::new(["_sqlx_migrations"]),
        );

        let first = service.capture(&t).await.unwrap();
        let second = service.capture(&t).await.unwrap();
        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(first.structure.tables.keys().collect::<Vec<_>>(), vec!["members"]);
    }
}
