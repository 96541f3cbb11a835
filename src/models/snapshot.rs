use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use super::migration::{Operation, SchemaChange};
use super::tenant::TenantId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ColumnDef {
    pub fn new(name: &str, data_type: &str, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
            default: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    pub name: String,
    pub columns: Vec<String>,
    pub ref_table: String,
    pub ref_columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<String>,
}

/// Structural description of one table. Column order is significant;
/// indexes and foreign keys are kept sorted by name once normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyDef>,
}

impl TableDef {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Lower-cases identifiers, trims types and sorts indexes and foreign keys,
    /// so that two descriptions of the same table compare and hash equal.
    pub fn normalized(&self) -> TableDef {
        let lower = |s: &str| s.trim().to_lowercase();
        let lower_all = |v: &[String]| v.iter().map(|s| lower(s)).collect::<Vec<_>>();

        let mut indexes: Vec<IndexDef> = self
            .indexes
            .iter()
            .map(|i| IndexDef {
                name: lower(&i.name),
                columns: lower_all(&i.columns),
                unique: i.unique,
            })
            .collect();
        indexes.sort_by(|a, b| a.name.cmp(&b.name));

        let mut foreign_keys: Vec<ForeignKeyDef> = self
            .foreign_keys
            .iter()
            .map(|f| ForeignKeyDef {
                name: lower(&f.name),
                columns: lower_all(&f.columns),
                ref_table: lower(&f.ref_table),
                ref_columns: lower_all(&f.ref_columns),
                on_delete: f.on_delete.as_ref().map(|a| a.trim().to_uppercase()),
            })
            .collect();
        foreign_keys.sort_by(|a, b| a.name.cmp(&b.name));

        TableDef {
            name: lower(&self.name),
            columns: self
                .columns
                .iter()
                .map(|c| ColumnDef {
                    name: lower(&c.name),
                    data_type: c.data_type.trim().to_lowercase(),
                    nullable: c.nullable,
                    default: c.default.as_ref().map(|d| d.trim().to_string()),
                })
                .collect(),
            primary_key: lower_all(&self.primary_key),
            indexes,
            foreign_keys,
        }
    }

    /// sha256 of the normalized structural description.
    pub fn structural_hash(&self) -> String {
        let bytes = serde_json::to_vec(&self.normalized()).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StructureError {
    #[error("table '{0}' already exists")]
    TableExists(String),
    #[error("table '{0}' does not exist")]
    NoSuchTable(String),
    #[error("column '{1}' already exists on '{0}'")]
    ColumnExists(String, String),
    #[error("column '{1}' does not exist on '{0}'")]
    NoSuchColumn(String, String),
    #[error("'{1}' already exists on '{0}'")]
    ObjectExists(String, String),
    #[error("'{1}' does not exist on '{0}'")]
    NoSuchObject(String, String),
    #[error("operation is raw SQL and cannot be replayed structurally")]
    NotReplayable,
}

/// The full structure of a tenant schema, keyed by table name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaStructure {
    pub tables: BTreeMap<String, TableDef>,
}

impl SchemaStructure {
    pub fn normalized(&self) -> SchemaStructure {
        SchemaStructure {
            tables: self
                .tables
                .values()
                .map(|t| {
                    let n = t.normalized();
                    (n.name.clone(), n)
                })
                .collect(),
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self)
    }

    pub fn apply_operation(&mut self, op: &Operation) -> Result<(), StructureError> {
        match op {
            Operation::Structured { changes } => {
                for change in changes {
                    self.apply(change)?;
                }
                Ok(())
            }
            Operation::Sql { .. } => Err(StructureError::NotReplayable),
        }
    }

    /// Replays one change. Fails on the same conditions Postgres would.
    pub fn apply(&mut self, change: &SchemaChange) -> Result<(), StructureError> {
        match change {
            SchemaChange::CreateTable { table } => {
                if self.tables.contains_key(&table.name) {
                    return Err(StructureError::TableExists(table.name.clone()));
                }
                self.tables.insert(table.name.clone(), table.clone());
            }
            SchemaChange::DropTable { table } => {
                self.tables
                    .remove(table)
                    .ok_or_else(|| StructureError::NoSuchTable(table.clone()))?;
            }
            SchemaChange::AddColumn { table, column } => {
                let t = self.table_mut(table)?;
                if t.column(&column.name).is_some() {
                    return Err(StructureError::ColumnExists(table.clone(), column.name.clone()));
                }
                t.columns.push(column.clone());
            }
            SchemaChange::DropColumn { table, column } => {
                let t = self.table_mut(table)?;
                let before = t.columns.len();
                t.columns.retain(|c| &c.name != column);
                if t.columns.len() == before {
                    return Err(StructureError::NoSuchColumn(table.clone(), column.clone()));
                }
                t.primary_key.retain(|c| c != column);
                t.indexes.retain(|i| !i.columns.contains(column));
                t.foreign_keys.retain(|f| !f.columns.contains(column));
            }
            SchemaChange::AlterColumn { table, column } => {
                let t = self.table_mut(table)?;
                let existing = t
                    .columns
                    .iter_mut()
                    .find(|c| c.name == column.name)
                    .ok_or_else(|| StructureError::NoSuchColumn(table.clone(), column.name.clone()))?;
                *existing = column.clone();
            }
            SchemaChange::CreateIndex { table, index } => {
                let t = self.table_mut(table)?;
                if t.indexes.iter().any(|i| i.name == index.name) {
                    return Err(StructureError::ObjectExists(table.clone(), index.name.clone()));
                }
                t.indexes.push(index.clone());
            }
            SchemaChange::DropIndex { table, index } => {
                let t = self.table_mut(table)?;
                let before = t.indexes.len();
                t.indexes.retain(|i| &i.name != index);
                if t.indexes.len() == before {
                    return Err(StructureError::NoSuchObject(table.clone(), index.clone()));
                }
            }
            SchemaChange::AddForeignKey { table, foreign_key } => {
                let t = self.table_mut(table)?;
                if t.foreign_keys.iter().any(|f| f.name == foreign_key.name) {
                    return Err(StructureError::ObjectExists(table.clone(), foreign_key.name.clone()));
                }
                t.foreign_keys.push(foreign_key.clone());
            }
            SchemaChange::DropForeignKey { table, foreign_key } => {
                let t = self.table_mut(table)?;
                let before = t.foreign_keys.len();
                t.foreign_keys.retain(|f| &f.name != foreign_key);
                if t.foreign_keys.len() == before {
                    return Err(StructureError::NoSuchObject(table.clone(), foreign_key.clone()));
                }
            }
        }
        Ok(())
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut TableDef, StructureError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| StructureError::NoSuchTable(name.to_string()))
    }
}

/// Per-table hashes plus an aggregate hash over them in table-name order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub tables: BTreeMap<String, String>,
    pub aggregate: String,
}

impl Fingerprint {
    pub fn of(structure: &SchemaStructure) -> Self {
        let tables: BTreeMap<String, String> = structure
            .tables
            .values()
            .map(|t| (t.name.trim().to_lowercase(), t.structural_hash()))
            .collect();

        let mut hasher = Sha256::new();
        for (name, hash) in &tables {
            hasher.update(name.as_bytes());
            hasher.update(b":");
            hasher.update(hash.as_bytes());
            hasher.update(b"\n");
        }
        Self {
            tables,
            aggregate: hex::encode(hasher.finalize()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    /// Captured from the tenant database.
    Observed,
    /// Expected structure recorded after a successful apply.
    Baseline,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Observed => "observed",
            SnapshotKind::Baseline => "baseline",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub id: Uuid,
    pub tenant: TenantId,
    pub kind: SnapshotKind,
    pub captured_at: DateTime<Utc>,
    pub fingerprint: Fingerprint,
    pub structure: SchemaStructure,
}

impl SchemaSnapshot {
    pub fn new(tenant: TenantId, kind: SnapshotKind, structure: SchemaStructure) -> Self {
        let structure = structure.normalized();
        Self {
            id: Uuid::new_v4(),
            tenant,
            kind,
            captured_at: Utc::now(),
            fingerprint: structure.fingerprint(),
            structure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members() -> TableDef {
        TableDef {
            name: "members".into(),
            columns: vec![
                ColumnDef::new("id", "uuid", false),
                ColumnDef::new("full_name", "text", false),
            ],
            primary_key: vec!["id".into()],
            indexes: vec![],
            foreign_keys: vec![],
        }
    }

    #[test]
    fn fingerprint_ignores_case_and_index_order() {
        let mut a = members();
        a.indexes = vec![
            IndexDef { name: "b_idx".into(), columns: vec!["full_name".into()], unique: false },
            IndexDef { name: "a_idx".into(), columns: vec!["id".into()], unique: true },
        ];
        let mut b = a.clone();
        b.indexes.reverse();
        b.name = "MEMBERS".into();
        b.columns[1].data_type = " TEXT ".into();
        assert_eq!(a.structural_hash(), b.structural_hash());
    }

    #[test]
    fn fingerprint_sensitive_to_column_order() {
        let a = members();
        let mut b = members();
        b.columns.reverse();
        assert_ne!(a.structural_hash(), b.structural_hash());
    }

    #[test]
    fn aggregate_changes_when_any_table_changes() {
        let mut s = SchemaStructure::default();
        s.apply(&SchemaChange::CreateTable { table: members() }).unwrap();
        let before = s.fingerprint();
        s.apply(&SchemaChange::AddColumn {
            table: "members".into(),
            column: ColumnDef::new("ward", "int4", true),
        })
        .unwrap();
        let after = s.fingerprint();
        assert_ne!(before.aggregate, after.aggregate);
        assert_ne!(before.tables["members"], after.tables["members"]);
    }

    #[test]
    fn replay_rejects_impossible_changes() {
        let mut s = SchemaStructure::default();
        assert_eq!(
            s.apply(&SchemaChange::DropTable { table: "missing".into() }),
            Err(StructureError::NoSuchTable("missing".into()))
        );
        s.apply(&SchemaChange::CreateTable { table: members() }).unwrap();
        assert_eq!(
            s.apply(&SchemaChange::CreateTable { table: members() }),
            Err(StructureError::TableExists("members".into()))
        );
        assert!(matches!(
            s.apply(&SchemaChange::DropColumn { table: "members".into(), column: "nope".into() }),
            Err(StructureError::NoSuchColumn(_, _))
        ));
        assert_eq!(
            s.apply_operation(&Operation::sql("SELECT 1")),
            Err(StructureError::NotReplayable)
        );
    }

    #[test]
    fn drop_column_removes_dependent_objects() {
        let mut t = members();
        t.indexes.push(IndexDef {
            name: "members_name_idx".into(),
            columns: vec!["full_name".into()],
            unique: false,
        });
        let mut s = SchemaStructure::default();
        s.apply(&SchemaChange::CreateTable { table: t }).unwrap();
        s.apply(&SchemaChange::DropColumn { table: "members".into(), column: "full_name".into() })
            .unwrap();
        assert!(s.tables["members"].indexes.is_empty());
    }
}
