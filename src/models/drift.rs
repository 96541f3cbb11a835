use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::snapshot::{ColumnDef, ForeignKeyDef, IndexDef, TableDef};
use super::tenant::TenantId;

pub const TABLE_WEIGHT: u32 = 10;
pub const COLUMN_WEIGHT: u32 = 3;
pub const INDEX_WEIGHT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// 0 none, 1-2 low, 3-5 medium, 6-9 high, 10+ critical.
    pub fn from_score(score: u32) -> Self {
        match score {
            0 => Severity::None,
            1..=2 => Severity::Low,
            3..=5 => Severity::Medium,
            6..=9 => Severity::High,
            _ => Severity::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::None => "none",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum ColumnDrift {
    Added { column: ColumnDef },
    Removed { column: ColumnDef },
    Modified { expected: ColumnDef, actual: ColumnDef },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum IndexDrift {
    Added { index: IndexDef },
    Removed { index: IndexDef },
    Modified { expected: IndexDef, actual: IndexDef },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum ForeignKeyDrift {
    Added { foreign_key: ForeignKeyDef },
    Removed { foreign_key: ForeignKeyDef },
    Modified { expected: ForeignKeyDef, actual: ForeignKeyDef },
}

/// Difference for one table, seen from the expected side: `Added` means the
/// tenant has a table nobody expects, `Removed` means an expected table is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum TableDrift {
    Added {
        table: TableDef,
    },
    Removed {
        table: TableDef,
    },
    Modified {
        name: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        columns: Vec<ColumnDrift>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        primary_key: Option<(Vec<String>, Vec<String>)>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        indexes: Vec<IndexDrift>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        foreign_keys: Vec<ForeignKeyDrift>,
    },
}

impl TableDrift {
    pub fn table_name(&self) -> &str {
        match self {
            TableDrift::Added { table } | TableDrift::Removed { table } => &table.name,
            TableDrift::Modified { name, .. } => name,
        }
    }

    pub fn score(&self) -> u32 {
        match self {
            TableDrift::Added { .. } | TableDrift::Removed { .. } => TABLE_WEIGHT,
            TableDrift::Modified { columns, primary_key, indexes, foreign_keys, .. } => {
                let pk = if primary_key.is_some() { INDEX_WEIGHT } else { 0 };
                columns.len() as u32 * COLUMN_WEIGHT
                    + (indexes.len() + foreign_keys.len()) as u32 * INDEX_WEIGHT
                    + pk
            }
        }
    }
}

/// Advisory comparison of a tenant's actual schema against its expected schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftReport {
    pub tenant: TenantId,
    pub checked_at: DateTime<Utc>,
    pub expected_fingerprint: String,
    pub actual_fingerprint: String,
    pub tables: Vec<TableDrift>,
    pub score: u32,
    pub severity: Severity,
}

impl DriftReport {
    pub fn new(
        tenant: TenantId,
        expected_fingerprint: String,
        actual_fingerprint: String,
        tables: Vec<TableDrift>,
    ) -> Self {
        let score = tables.iter().map(TableDrift::score).sum();
        Self {
            tenant,
            checked_at: Utc::now(),
            expected_fingerprint,
            actual_fingerprint,
            tables,
            score,
            severity: Severity::from_score(score),
        }
    }

    pub fn added(&self) -> impl Iterator<Item = &TableDef> {
        self.tables.iter().filter_map(|t| match t {
            TableDrift::Added { table } => Some(table),
            _ => None,
        })
    }

    pub fn removed(&self) -> impl Iterator<Item = &TableDef> {
        self.tables.iter().filter_map(|t| match t {
            TableDrift::Removed { table } => Some(table),
            _ => None,
        })
    }

    pub fn modified(&self) -> impl Iterator<Item = &TableDrift> {
        self.tables
            .iter()
            .filter(|t| matches!(t, TableDrift::Modified { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds() {
        assert_eq!(Severity::from_score(0), Severity::None);
        assert_eq!(Severity::from_score(1), Severity::Low);
        assert_eq!(Severity::from_score(3), Severity::Medium);
        assert_eq!(Severity::from_score(6), Severity::High);
        assert_eq!(Severity::from_score(TABLE_WEIGHT), Severity::Critical);
    }

    #[test]
    fn one_missing_table_is_critical() {
        let table = TableDef {
            name: "members".into(),
            columns: vec![],
            primary_key: vec![],
            indexes: vec![],
            foreign_keys: vec![],
        };
        let report = DriftReport::new(
            TenantId::parse("T1").unwrap(),
            "a".into(),
            "b".into(),
            vec![TableDrift::Removed { table }],
        );
        assert_eq!(report.severity, Severity::Critical);
        assert_eq!(report.removed().count(), 1);
    }
}
