use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::models::audit::{AuditEntry, AuditOutcome, NewAuditEntry};
use crate::models::migration::Layer;
use crate::models::tenant::TenantId;
use crate::services::store::ControlStore;

/// Append-only record of every migration attempt. It is the source of truth
/// for what has actually run on a tenant.
#[derive(Clone)]
pub struct AuditLedger {
    store: Arc<dyn ControlStore>,
}

impl AuditLedger {
    pub fn new(store: Arc<dyn ControlStore>) -> Self {
        Self { store }
    }

    /// Appends one entry. A failed write is an error, never a warning.
    pub async fn record(&self, entry: NewAuditEntry) -> EngineResult<AuditEntry> {
        let unit = entry.unit.to_string();
        let tenant = entry.tenant.clone();
        let recorded = self.store.append_audit(entry).await.map_err(|e| {
            tracing::error!(tenant = %tenant, unit = %unit, "Audit write failed: {e}");
            EngineError::AuditWriteFailed(e.to_string())
        })?;
        tracing::debug!(
            tenant = %recorded.tenant,
            unit = %recorded.unit,
            seq = recorded.seq,
            outcome = %recorded.outcome,
            "Audit entry recorded"
        );
        Ok(recorded)
    }

    pub async fn history(&self, tenant: &TenantId, layer: Option<Layer>) -> EngineResult<Vec<AuditEntry>> {
        Ok(self.store.audit_history(tenant, layer).await?)
    }

    /// Content hashes currently in effect on the tenant: every `applied` entry
    /// not cancelled by a later `rolled_back` entry for the same hash.
    pub async fn applied_hashes(&self, tenant: &TenantId) -> EngineResult<BTreeSet<String>> {
        Ok(net_applied(&self.history(tenant, None).await?))
    }

    pub async fn has_succeeded(&self, tenant: &TenantId, content_hash: &str) -> EngineResult<bool> {
        Ok(self.applied_hashes(tenant).await?.contains(content_hash))
    }
}

/// Replays entries in sequence order.
pub fn net_applied(entries: &[AuditEntry]) -> BTreeSet<String> {
    let mut sorted: Vec<&AuditEntry> = entries.iter().collect();
    sorted.sort_by_key(|e| e.seq);
    let mut applied = BTreeSet::new();
    for e in sorted {
        match e.outcome {
            AuditOutcome::Applied => {
                applied.insert(e.content_hash.clone());
            }
            AuditOutcome::RolledBack => {
                applied.remove(&e.content_hash);
            }
            AuditOutcome::Failed => {}
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryControlStore;
    use crate::models::audit::Direction;
    use crate::models::migration::{MigrationUnit, Operation, UnitId, Version};

    fn unit(name: &str) -> MigrationUnit {
        MigrationUnit::new(
            UnitId { layer: Layer::Module, owner: "finance".into(), name: name.into() },
            Version::new(1, 0, 0),
            Operation::sql(format!("CREATE TABLE {name} (id INT)")),
            Some(Operation::sql(format!("DROP TABLE {name}"))),
        )
    }

    #[tokio::test]
    async fn rollback_cancels_earlier_apply() {
        let store = Arc::new(MemoryControlStore::new());
        let ledger = AuditLedger::new(store);
        let t = TenantId::parse("T1").unwrap();
        let (a, b) = (unit("a"), unit("b"));

        for (u, dir, outcome) in [
            (&a, Direction::Forward, AuditOutcome::Applied),
            (&b, Direction::Forward, AuditOutcome::Applied),
            (&b, Direction::Reverse, AuditOutcome::RolledBack),
            (&b, Direction::Forward, AuditOutcome::Failed),
        ] {
            ledger.record(NewAuditEntry::for_unit(&t, u, dir, outcome, "ops")).await.unwrap();
        }

        let applied = ledger.applied_hashes(&t).await.unwrap();
        assert!(applied.contains(&a.content_hash));
        assert!(!applied.contains(&b.content_hash));
        assert!(ledger.has_succeeded(&t, &a.content_hash).await.unwrap());
    }

    #[tokio::test]
    async fn write_failure_is_fatal() {
        let store = Arc::new(MemoryControlStore::new());
        store.fail_audit_writes(true);
        let ledger = AuditLedger::new(store);
        let t = TenantId::parse("T1").unwrap();
        let err = ledger
            .record(NewAuditEntry::for_unit(&t, &unit("a"), Direction::Forward, AuditOutcome::Applied, "ops"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "audit_write_failed");
    }
}
