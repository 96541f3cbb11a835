use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;


use crate::error::{EngineError, EngineResult};
use crate::models::custom::CustomStatus;
use crate::models::drift::{ColumnDrift, DriftReport, ForeignKeyDrift, IndexDrift, Severity, TableDrift};
use crate::models::snapshot::{SchemaStructure, TableDef};
use crate::models::tenant::{TenantId, TenantState};
use crate::services::catalog::{LayerCatalog, UnitQuery};
use crate::services::events::{EventSink, ProvisioningEvent};
use crate::services::ledger::AuditLedger;
use crate::services::lock::ProvisioningLock;
use crate::services::metrics::DRIFT_SCORE;
use crate::services::resolver;
use crate::services::snapshot::SnapshotService;
use crate::services::store::ControlStore;

/// Compares two structures table by table, from the expected side.
pub fn diff(expected: &SchemaStructure, actual: &SchemaStructure) -> Vec<TableDrift> {
    let expected = expected.normalized();
    let actual = actual.normalized();
    let names: BTreeSet<&String> = expected.tables.keys().chain(actual.tables.keys()).collect();

    let mut drift = Vec::new();
    for name in names {
        match (expected.tables.get(name), actual.tables.get(name)) {
            (Some(e), None) => drift.push(TableDrift::Removed { table: e.clone() }),
            (None, Some(a)) => drift.push(TableDrift::Added { table: a.clone() }),
            (Some(e), Some(a)) if e != a => {
                if let Some(modified) = diff_table(e, a) {
                    drift.push(modified);
                }
            }
            _ => {}
        }
    }
    drift
}

/// Pairs items by name: `(expected, actual)`, expected order first, then
/// items only present on the actual side.
fn pair_by_name<'a, T>(
    expected: &'a [T],
    actual: &'a [T],
    name: impl Fn(&T) -> &str,
) -> Vec<(Option<&'a T>, Option<&'a T>)> {
    let actual_by_name: BTreeMap<&str, &T> = actual.iter().map(|a| (name(a), a)).collect();
    let expected_names: BTreeSet<&str> = expected.iter().map(|e| name(e)).collect();
    let mut pairs: Vec<_> = expected
        .iter()
        .map(|e| (Some(e), actual_by_name.get(name(e)).copied()))
        .collect();
    pairs.extend(
        actual
            .iter()
            .filter(|a| !expected_names.contains(name(a)))
            .map(|a| (None, Some(a))),
    );
    pairs
}

fn diff_table(expected: &TableDef, actual: &TableDef) -> Option<TableDrift> {
    let columns: Vec<ColumnDrift> = pair_by_name(&expected.columns, &actual.columns, |c| &c.name)
        .into_iter()
        .filter_map(|pair| match pair {
            (Some(e), None) => Some(ColumnDrift::Removed { column: e.clone() }),
            (None, Some(a)) => Some(ColumnDrift::Added { column: a.clone() }),
            (Some(e), Some(a)) if e != a => Some(ColumnDrift::Modified {
                expected: e.clone(),
                actual: a.clone(),
            }),
            _ => None,
        })
        .collect();

    let indexes: Vec<IndexDrift> = pair_by_name(&expected.indexes, &actual.indexes, |i| &i.name)
        .into_iter()
        .filter_map(|pair| match pair {
            (Some(e), None) => Some(IndexDrift::Removed { index: e.clone() }),
            (None, Some(a)) => Some(IndexDrift::Added { index: a.clone() }),
            (Some(e), Some(a)) if e != a => Some(IndexDrift::Modified {
                expected: e.clone(),
                actual: a.clone(),
            }),
            _ => None,
        })
        .collect();

    let foreign_keys: Vec<ForeignKeyDrift> =
        pair_by_name(&expected.foreign_keys, &actual.foreign_keys, |f| &f.name)
            .into_iter()
            .filter_map(|pair| match pair {
                (Some(e), None) => Some(ForeignKeyDrift::Removed { foreign_key: e.clone() }),
                (None, Some(a)) => Some(ForeignKeyDrift::Added { foreign_key: a.clone() }),
                (Some(e), Some(a)) if e != a => Some(ForeignKeyDrift::Modified {
                    expected: e.clone(),
                    actual: a.clone(),
                }),
                _ => None,
            })
            .collect();

    let primary_key = (expected.primary_key != actual.primary_key)
        .then(|| (expected.primary_key.clone(), actual.primary_key.clone()));

    // Column order alone carries no weight.
    if columns.is_empty() && indexes.is_empty() && foreign_keys.is_empty() && primary_key.is_none() {
        return None;
    }
    Some(TableDrift::Modified {
        name: expected.name.clone(),
        columns,
        primary_key,
        indexes,
        foreign_keys,
    })
}

/// Detects schema drift. Reports are advisory: nothing here changes a
/// tenant schema.
pub struct DriftDetector {
    catalog: Arc<LayerCatalog>,
    ledger: AuditLedger,
    store: Arc<dyn ControlStore>,
    snapshots: Arc<SnapshotService>,
    lock: Arc<dyn ProvisioningLock>,
    events: Arc<dyn EventSink>,
}

impl DriftDetector {
    pub fn new(
        catalog: Arc<LayerCatalog>,
        ledger: AuditLedger,
        store: Arc<dyn ControlStore>,
        snapshots: Arc<SnapshotService>,
        lock: Arc<dyn ProvisioningLock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self { catalog, ledger, store, snapshots, lock, events }
    }

    pub async fn detect(&self, tenant: &TenantId) -> EngineResult<DriftReport> {
        // read and check time both under the tenant lock
        let report = {
            let _guard = self.lock.try_acquire(tenant).await?;
            let state = self
                .store
                .tenant(tenant)
                .await?
                .ok_or_else(|| EngineError::UnknownTenant(tenant.clone()))?;
            let expected = self.expected_structure(&state).await?;
            let observed = self.snapshots.capture_and_store(tenant).await?;
            let expected_fingerprint = expected.fingerprint().aggregate;
            let actual_fingerprint = observed.fingerprint.aggregate.clone();

            let tables = if expected_fingerprint == actual_fingerprint {
                Vec::new()
            } else {
                diff(&expected, &observed.structure)
            };
            let report = DriftReport::new(tenant.clone(), expected_fingerprint, actual_fingerprint, tables);
            self.store.record_drift_check(tenant, report.checked_at).await?;
            report
        };

        DRIFT_SCORE
            .with_label_values(&[tenant.as_str()])
            .set(report.score as f64);

        if report.severity == Severity::None {
            tracing::info!(tenant = %tenant, "No drift");
        } else {
            tracing::warn!(
                tenant = %tenant,
                severity = %report.severity,
                score = report.score,
                tables = report.tables.len(),
                "Schema drift detected"
            );
            self.events
                .publish(ProvisioningEvent::DriftDetected {
                    tenant: tenant.clone(),
                    severity: report.severity,
                    score: report.score,
                    tables: report.tables.len(),
                })
                .await;
        }
        Ok(report)
    }

    /// The latest baseline, or a structural replay of everything the ledger
    /// says is applied.
    pub async fn expected_structure(&self, state: &TenantState) -> EngineResult<SchemaStructure> {
        if let Some(baseline) = self.snapshots.latest_baseline(&state.tenant).await? {
            return Ok(baseline.structure);
        }
        self.replay(state).await
    }

    async fn replay(&self, state: &TenantState) -> EngineResult<SchemaStructure> {
        let tenant = &state.tenant;
        let unavailable = |reason: String| EngineError::DriftDetectionUnavailable {
            tenant: tenant.clone(),
            reason,
        };

        let mut units = self.catalog.units_for(UnitQuery::Basic).await?;
        if let Some(t) = &state.template {
            units.extend(self.catalog.recorded_template(&t.slug, &t.version)?.units);
        }
        let defs = self.catalog.definitions();
        let installed: BTreeSet<String> = state.modules.keys().cloned().collect();
        let order = resolver::resolve(&defs.modules, &installed, &BTreeSet::new())
            .map_err(|e| unavailable(format!("installed modules cannot be ordered: {e}")))?;
        for slug in &order {
            units.extend(defs.modules[slug.as_str()].units.iter().cloned());
        }
        units.extend(
            self.store
                .custom_requests(tenant, Some(CustomStatus::Applied))
                .await?
                .iter()
                .map(|r| r.to_unit()),
        );

        let applied = self.ledger.applied_hashes(tenant).await?;
        let mut structure = SchemaStructure::default();
        for unit in units.iter().filter(|u| applied.contains(&u.content_hash)) {
            structure
                .apply_operation(&unit.forward)
                .map_err(|e| unavailable(format!("no baseline recorded and {} cannot be replayed: {e}", unit.id)))?;
        }
        Ok(structure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::snapshot::{ColumnDef, IndexDef};

    fn table(name: &str, columns: &[&str]) -> TableDef {
        TableDef {
            name: name.into(),
            columns: columns.iter().map(|c| ColumnDef::new(c, "text", true)).collect(),
            primary_key: vec![],
            indexes: vec![],
            foreign_keys: vec![],
        }
    }

    fn structure(tables: Vec<TableDef>) -> SchemaStructure {
        SchemaStructure {
            tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    #[test]
    fn identical_structures_have_no_drift() {
        let s = structure(vec![table("members", &["id", "name"])]);
        assert!(diff(&s, &s).is_empty());
    }

    #[test]
    fn classifies_added_removed_and_modified() {
        let expected = structure(vec![table("members", &["id", "name"]), table("donations", &["id"])]);
        let mut members = table("members", &["id", "ward"]);
        members.indexes.push(IndexDef {
            name: "members_ward_idx".into(),
            columns: vec!["ward".into()],
            unique: false,
        });
        let actual = structure(vec![members, table("scratch", &["x"])]);

        let drift = diff(&expected, &actual);
        let names: Vec<&str> = drift.iter().map(TableDrift::table_name).collect();
        assert_eq!(names, vec!["donations", "members", "scratch"]);
        assert!(matches!(drift[0], TableDrift::Removed { .. }));
        assert!(matches!(drift[2], TableDrift::Added { .. }));

        let TableDrift::Modified { columns, indexes, .. } = &drift[1] else {
            panic!("members should be modified");
        };
        assert_eq!(columns.len(), 2);
        assert!(matches!(&columns[0], ColumnDrift::Removed { column } if column.name == "name"));
        assert!(matches!(&columns[1], ColumnDrift::Added { column } if column.name == "ward"));
        assert_eq!(indexes.len(), 1);
        // 10 + 10 + 2 columns * 3 + 1 index
        let report = DriftReport::new(TenantId::parse("T1").unwrap(), "e".into(), "a".into(), drift);
        assert_eq!(report.score, 27);
        assert_eq!(report.severity, Severity::Critical);
    }

    #[test]
    fn modified_column_type_is_medium() {
        let expected = structure(vec![table("members", &["id"])]);
        let mut changed = table("members", &["id"]);
        changed.columns[0].data_type = "integer".into();
        let drift = diff(&expected, &structure(vec![changed]));
        let report = DriftReport::new(TenantId::parse("T1").unwrap(), "e".into(), "a".into(), drift);
        assert_eq!(report.score, 3);
        assert_eq!(report.severity, Severity::Medium);
    }

    #[test]
    fn case_differences_are_not_drift() {
        let expected = structure(vec![table("members", &["id"])]);
        let actual = structure(vec![table("MEMBERS", &["ID"])]);
        assert!(diff(&expected, &actual).is_empty());
    }
}
