//! Turns a drift report into custom migrations that move the actual schema
//! back to the expected one. Repair is always an explicit operator action.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::custom::Approver;
use crate::models::drift::{ColumnDrift, DriftReport, ForeignKeyDrift, IndexDrift, TableDrift};
use crate::models::migration::{Operation, SchemaChange};
use crate::models::provisioning::ApplyResult;
use crate::models::snapshot::{ForeignKeyDef, IndexDef};
use crate::models::tenant::{TenantId, TenantStatus};
use crate::services::custom::CustomWorkflow;
use crate::services::lock::LockGuard;
use crate::services::orchestrator::Orchestrator;

#[derive(Debug, Clone, Serialize)]
pub struct RepairStep {
    pub description: String,
    pub forward: SchemaChange,
    pub reverse: Option<SchemaChange>,
}

impl RepairStep {
    fn new(description: String, forward: SchemaChange, reverse: SchemaChange) -> Self {
        Self { description, forward, reverse: Some(reverse) }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairPlan {
    pub tenant: TenantId,
    pub steps: Vec<RepairStep>,
    /// Differences no structural change can fix (primary keys).
    pub unrepaired: Vec<String>,
}

impl RepairPlan {
    /// Steps run in dependency-safe order: drop unexpected foreign keys,
    /// indexes, columns and tables, then create missing tables, columns,
    /// indexes and foreign keys.
    pub fn from_report(report: &DriftReport) -> Self {
        let mut drop_fks = Vec::new();
        let mut drop_indexes = Vec::new();
        let mut drop_columns = Vec::new();
        let mut drop_tables = Vec::new();
        let mut create_tables = Vec::new();
        let mut columns = Vec::new();
        let mut create_indexes = Vec::new();
        let mut add_fks = Vec::new();
        let mut unrepaired = Vec::new();

        for drift in &report.tables {
            match drift {
                TableDrift::Added { table } => drop_tables.push(RepairStep::new(
                    format!("drop unexpected table {}", table.name),
                    SchemaChange::DropTable { table: table.name.clone() },
                    SchemaChange::CreateTable { table: table.clone() },
                )),
                TableDrift::Removed { table } => {
                    let mut bare = table.clone();
                    bare.foreign_keys.clear();
                    create_tables.push(RepairStep::new(
                        format!("recreate missing table {}", table.name),
                        SchemaChange::CreateTable { table: bare },
                        SchemaChange::DropTable { table: table.name.clone() },
                    ));
                    for fk in &table.foreign_keys {
                        add_fks.push(add_fk(&table.name, fk));
                    }
                }
                TableDrift::Modified { name, columns: column_drift, primary_key, indexes, foreign_keys } => {
                    for c in column_drift {
                        match c {
                            ColumnDrift::Added { column } => drop_columns.push(RepairStep::new(
                                format!("drop unexpected column {name}.{}", column.name),
                                SchemaChange::DropColumn { table: name.clone(), column: column.name.clone() },
                                SchemaChange::AddColumn { table: name.clone(), column: column.clone() },
                            )),
                            ColumnDrift::Removed { column } => columns.push(RepairStep::new(
                                format!("add missing column {name}.{}", column.name),
                                SchemaChange::AddColumn { table: name.clone(), column: column.clone() },
                                SchemaChange::DropColumn { table: name.clone(), column: column.name.clone() },
                            )),
                            ColumnDrift::Modified { expected, actual } => columns.push(RepairStep::new(
                                format!("restore column {name}.{}", expected.name),
                                SchemaChange::AlterColumn { table: name.clone(), column: expected.clone() },
                                SchemaChange::AlterColumn { table: name.clone(), column: actual.clone() },
                            )),
                        }
                    }
                    for i in indexes {
                        match i {
                            IndexDrift::Added { index } => drop_indexes.push(drop_index(name, index)),
                            IndexDrift::Removed { index } => create_indexes.push(create_index(name, index)),
                            IndexDrift::Modified { expected, actual } => {
                                drop_indexes.push(drop_index(name, actual));
                                create_indexes.push(create_index(name, expected));
                            }
                        }
                    }
                    for f in foreign_keys {
                        match f {
                            ForeignKeyDrift::Added { foreign_key } => drop_fks.push(drop_fk(name, foreign_key)),
                            ForeignKeyDrift::Removed { foreign_key } => add_fks.push(add_fk(name, foreign_key)),
                            ForeignKeyDrift::Modified { expected, actual } => {
                                drop_fks.push(drop_fk(name, actual));
                                add_fks.push(add_fk(name, expected));
                            }
                        }
                    }
                    if let Some((expected, actual)) = primary_key {
                        unrepaired.push(format!(
                            "{name}: primary key is ({}) but ({}) is expected",
                            actual.join(", "),
                            expected.join(", ")
                        ));
                    }
                }
            }
        }

        let steps = [drop_fks, drop_indexes, drop_columns, drop_tables, create_tables, columns, create_indexes, add_fks]
            .into_iter()
            .flatten()
            .collect();
        Self { tenant: report.tenant.clone(), steps, unrepaired }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

fn drop_index(table: &str, index: &IndexDef) -> RepairStep {
    RepairStep::new(
        format!("drop index {}", index.name),
        SchemaChange::DropIndex { table: table.to_string(), index: index.name.clone() },
        SchemaChange::CreateIndex { table: table.to_string(), index: index.clone() },
    )
}

fn create_index(table: &str, index: &IndexDef) -> RepairStep {
    RepairStep::new(
        format!("create index {}", index.name),
        SchemaChange::CreateIndex { table: table.to_string(), index: index.clone() },
        SchemaChange::DropIndex { table: table.to_string(), index: index.name.clone() },
    )
}

fn drop_fk(table: &str, fk: &ForeignKeyDef) -> RepairStep {
    RepairStep::new(
        format!("drop foreign key {}", fk.name),
        SchemaChange::DropForeignKey { table: table.to_string(), foreign_key: fk.name.clone() },
        SchemaChange::AddForeignKey { table: table.to_string(), foreign_key: fk.clone() },
    )
}

fn add_fk(table: &str, fk: &ForeignKeyDef) -> RepairStep {
    RepairStep::new(
        format!("add foreign key {}", fk.name),
        SchemaChange::AddForeignKey { table: table.to_string(), foreign_key: fk.clone() },
        SchemaChange::DropForeignKey { table: table.to_string(), foreign_key: fk.name.clone() },
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairOutcome {
    pub tenant: TenantId,
    pub requests: Vec<Uuid>,
    pub applied: Vec<ApplyResult>,
    pub unrepaired: Vec<String>,
}

/// Files every repair step as a custom migration, approves it and applies it.
pub struct DriftRepairer {
    orchestrator: Arc<Orchestrator>,
    workflow: Arc<CustomWorkflow>,
}

impl DriftRepairer {
    pub fn new(orchestrator: Arc<Orchestrator>, workflow: Arc<CustomWorkflow>) -> Self {
        Self { orchestrator, workflow }
    }

    /// Takes the tenant lock, files the requests and approves them.
    ///
    /// When a step is destructive and `approver` is not elevated, the call
    /// fails with `ElevatedApprovalRequired` before anything is filed.
    pub async fn prepare(
        &self,
        plan: &RepairPlan,
        approver: &Approver,
        actor: &str,
    ) -> EngineResult<(LockGuard, Vec<Uuid>)> {
        let tenant = &plan.tenant;
        if plan.is_empty() {
            return Err(EngineError::InvalidRequest(format!("nothing to repair on tenant '{tenant}'")));
        }
        let guard = self.orchestrator.lock(tenant).await?;
        let state = self.orchestrator.tenant(tenant).await?;
        if state.status != TenantStatus::Active {
            return Err(EngineError::InvalidTransition {
                entity: "tenant",
                from: state.status.to_string(),
                to: "drift repair (requires active)".into(),
            });
        }

        let steps: Vec<(Operation, Option<Operation>, &str)> = plan
            .steps
            .iter()
            .map(|step| {
                (
                    Operation::structured(vec![step.forward.clone()]),
                    step.reverse.clone().map(|r| Operation::structured(vec![r])),
                    step.description.as_str(),
                )
            })
            .collect();
        if !approver.is_elevated() {
            let mut matched: Vec<String> = Vec::new();
            for (forward, _, _) in &steps {
                for keyword in self.workflow.policy().matches(forward) {
                    if !matched.contains(&keyword) {
                        matched.push(keyword);
                    }
                }
            }
            if !matched.is_empty() {
                tracing::warn!(tenant = %tenant, steps = steps.len(), "Drift repair refused, a step needs elevated approval");
                return Err(EngineError::ElevatedApprovalRequired { request: None, matched });
            }
        }

        let mut requests = Vec::with_capacity(steps.len());
        for (forward, reverse, description) in steps {
            let request = self
                .workflow
                .request(tenant, actor, forward, reverse, &format!("drift repair: {description}"))
                .await?;
            requests.push(request.id);
        }

        for id in &requests {
            self.workflow.approve(*id, approver).await?;
        }
        tracing::info!(tenant = %tenant, steps = requests.len(), approver = %approver.id, "Drift repair approved");
        Ok((guard, requests))
    }

    /// Applies the approved requests in order, one `apply` call each. The
    /// caller holds the guard from [`DriftRepairer::prepare`].
    pub async fn run(
        &self,
        plan: &RepairPlan,
        requests: &[Uuid],
        actor: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<RepairOutcome> {
        let mut applied = Vec::with_capacity(requests.len());
        for id in requests {
            let custom = self.orchestrator.custom_plan(&plan.tenant, Some(*id)).await?;
            applied.push(self.orchestrator.run_custom(&custom, actor, cancel).await?);
        }
        Ok(RepairOutcome {
            tenant: plan.tenant.clone(),
            requests: requests.to_vec(),
            applied,
            unrepaired: plan.unrepaired.clone(),
        })
    }

    pub async fn repair(&self, plan: &RepairPlan, approver: &Approver, actor: &str) -> EngineResult<RepairOutcome> {
        let (_guard, requests) = self.prepare(plan, approver, actor).await?;
        self.run(plan, &requests, actor, &CancellationToken::new()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::snapshot::{ColumnDef, SchemaStructure, TableDef};
    use crate::services::drift::diff;

    fn table(name: &str, cols: &[&str]) -> TableDef {
        TableDef {
            name: name.into(),
            columns: cols.iter().map(|c| ColumnDef::new(c, "uuid", true)).collect(),
            primary_key: vec![],
            indexes: vec![],
            foreign_keys: vec![],
        }
    }

    fn structure(tables: Vec<TableDef>) -> SchemaStructure {
        SchemaStructure { tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect() }
    }

    #[test]
    fn replaying_the_plan_restores_the_expected_structure() {
        let mut donations = table("donations", &["id", "member_id"]);
        donations.foreign_keys.push(ForeignKeyDef {
            name: "donations_member_fk".into(),
            columns: vec!["member_id".into()],
            ref_table: "members".into(),
            ref_columns: vec!["id".into()],
            on_delete: None,
        });
        let expected = structure(vec![table("members", &["id", "name"]), donations]);
        let actual = structure(vec![table("members", &["id", "nickname"]), table("scratch", &["x"])]);

        let report = DriftReport::new(TenantId::parse("T1").unwrap(), "e".into(), "a".into(), diff(&expected, &actual));
        let plan = RepairPlan::from_report(&report);
        assert!(plan.unrepaired.is_empty());

        let mut repaired = actual.clone();
        for step in &plan.steps {
            repaired.apply(&step.forward).unwrap();
        }
        assert!(diff(&expected, &repaired).is_empty(), "{:?}", diff(&expected, &repaired));

        // every step can be undone, newest first
        for step in plan.steps.iter().rev() {
            repaired.apply(step.reverse.as_ref().unwrap()).unwrap();
        }
        assert!(diff(&actual, &repaired).is_empty());
    }

    #[test]
    fn drops_come_before_creates() {
        let expected = structure(vec![table("members", &["id"])]);
        let actual = structure(vec![table("scratch", &["id"])]);
        let report = DriftReport::new(TenantId::parse("T1").unwrap(), "e".into(), "a".into(), diff(&expected, &actual));
        let plan = RepairPlan::from_report(&report);
        assert_eq!(plan.steps.len(), 2);
        assert!(matches!(plan.steps[0].forward, SchemaChange::DropTable { .. }));
        assert!(matches!(plan.steps[1].forward, SchemaChange::CreateTable { .. }));
    }
}
