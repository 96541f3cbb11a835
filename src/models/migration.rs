use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::snapshot::{ColumnDef, ForeignKeyDef, IndexDef, TableDef};

/// The four ordered categories of schema change. Derived `Ord` follows
/// application order: Basic first, Custom last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Basic,
    Template,
    Module,
    Custom,
}

impl Layer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Basic => "basic",
            Layer::Template => "template",
            Layer::Module => "module",
            Layer::Custom => "custom",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(Layer::Basic),
            "template" => Ok(Layer::Template),
            "module" => Ok(Layer::Module),
            "custom" => Ok(Layer::Custom),
            other => Err(format!("unknown layer '{other}'")),
        }
    }
}

/// Semantic version of a template, module or the basic layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(format!("invalid version '{s}': expected MAJOR.MINOR.PATCH"));
        }
        let parse = |p: &str| {
            p.parse::<u64>()
                .map_err(|_| format!("invalid version '{s}': '{p}' is not a number"))
        };
        Ok(Self {
            major: parse(parts[0])?,
            minor: parse(parts[1])?,
            patch: parse(parts[2])?,
        })
    }
}

impl Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Splits `slug@1.2.3` into its slug and optional version.
pub fn parse_definition_ref(s: &str) -> Result<(String, Option<Version>), String> {
    match s.split_once('@') {
        Some((slug, version)) => Ok((slug.to_string(), Some(version.parse()?))),
        None => Ok((s.to_string(), None)),
    }
}

/// Identity of a migration unit: its layer, its owner (`basic`, a template or
/// module slug, or a custom request id) and its ordinal name within the owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId {
    pub layer: Layer,
    pub owner: String,
    pub name: String,
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.layer, self.owner, self.name)
    }
}

/// A single structural schema change. Structured changes can be rendered to
/// Postgres DDL and replayed onto a [`super::snapshot::SchemaStructure`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchemaChange {
    CreateTable { table: TableDef },
    DropTable { table: String },
    AddColumn { table: String, column: ColumnDef },
    DropColumn { table: String, column: String },
    AlterColumn { table: String, column: ColumnDef },
    CreateIndex { table: String, index: IndexDef },
    DropIndex { table: String, index: String },
    AddForeignKey { table: String, foreign_key: ForeignKeyDef },
    DropForeignKey { table: String, foreign_key: String },
}

impl SchemaChange {
    pub fn is_destructive(&self) -> bool {
        matches!(self, SchemaChange::DropTable { .. } | SchemaChange::DropColumn { .. })
    }

    pub fn table(&self) -> &str {
        match self {
            SchemaChange::CreateTable { table } => &table.name,
            SchemaChange::DropTable { table }
            | SchemaChange::AddColumn { table, .. }
            | SchemaChange::DropColumn { table, .. }
            | SchemaChange::AlterColumn { table, .. }
            | SchemaChange::CreateIndex { table, .. }
            | SchemaChange::DropIndex { table, .. }
            | SchemaChange::AddForeignKey { table, .. }
            | SchemaChange::DropForeignKey { table, .. } => table,
        }
    }

    /// Render as Postgres statements.
    pub fn to_sql(&self) -> Vec<String> {
        match self {
            SchemaChange::CreateTable { table } => {
                let mut parts: Vec<String> = table.columns.iter().map(column_sql).collect();
                if !table.primary_key.is_empty() {
                    parts.push(format!("PRIMARY KEY ({})", ident_list(&table.primary_key)));
                }
                for fk in &table.foreign_keys {
                    parts.push(format!("CONSTRAINT {} {}", ident(&fk.name), foreign_key_sql(fk)));
                }
                let mut stmts = vec![format!(
                    "CREATE TABLE {} (\n    {}\n)",
                    ident(&table.name),
                    parts.join(",\n    ")
                )];
                stmts.extend(table.indexes.iter().map(|idx| index_sql(&table.name, idx)));
                stmts
            }
            SchemaChange::DropTable { table } => vec![format!("DROP TABLE {}", ident(table))],
            SchemaChange::AddColumn { table, column } => vec![format!(
                "ALTER TABLE {} ADD COLUMN {}",
                ident(table),
                column_sql(column)
            )],
            SchemaChange::DropColumn { table, column } => vec![format!(
                "ALTER TABLE {} DROP COLUMN {}",
                ident(table),
                ident(column)
            )],
            SchemaChange::AlterColumn { table, column } => {
                let t = ident(table);
                let c = ident(&column.name);
                let mut stmts = vec![format!(
                    "ALTER TABLE {t} ALTER COLUMN {c} TYPE {}",
                    column.data_type
                )];
                stmts.push(if column.nullable {
                    format!("ALTER TABLE {t} ALTER COLUMN {c} DROP NOT NULL")
                } else {
                    format!("ALTER TABLE {t} ALTER COLUMN {c} SET NOT NULL")
                });
                stmts.push(match &column.default {
                    Some(d) => format!("ALTER TABLE {t} ALTER COLUMN {c} SET DEFAULT {d}"),
                    None => format!("ALTER TABLE {t} ALTER COLUMN {c} DROP DEFAULT"),
                });
                stmts
            }
            SchemaChange::CreateIndex { table, index } => vec![index_sql(table, index)],
            SchemaChange::DropIndex { index, .. } => vec![format!("DROP INDEX {}", ident(index))],
            SchemaChange::AddForeignKey { table, foreign_key } => vec![format!(
                "ALTER TABLE {} ADD CONSTRAINT {} {}",
                ident(table),
                ident(&foreign_key.name),
                foreign_key_sql(foreign_key)
            )],
            SchemaChange::DropForeignKey { table, foreign_key } => vec![format!(
                "ALTER TABLE {} DROP CONSTRAINT {}",
                ident(table),
                ident(foreign_key)
            )],
        }
    }
}

fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn ident_list(names: &[String]) -> String {
    names.iter().map(|n| ident(n)).collect::<Vec<_>>().join(", ")
}

fn column_sql(c: &ColumnDef) -> String {
    let mut s = format!("{} {}", ident(&c.name), c.data_type);
    if !c.nullable {
        s.push_str(" NOT NULL");
    }
    if let Some(d) = &c.default {
        s.push_str(" DEFAULT ");
        s.push_str(d);
    }
    s
}

fn index_sql(table: &str, idx: &IndexDef) -> String {
    format!(
        "CREATE {}INDEX {} ON {} ({})",
        if idx.unique { "UNIQUE " } else { "" },
        ident(&idx.name),
        ident(table),
        ident_list(&idx.columns)
    )
}

fn foreign_key_sql(fk: &ForeignKeyDef) -> String {
    let mut s = format!(
        "FOREIGN KEY ({}) REFERENCES {} ({})",
        ident_list(&fk.columns),
        ident(&fk.ref_table),
        ident_list(&fk.ref_columns)
    );
    if let Some(action) = &fk.on_delete {
        s.push_str(" ON DELETE ");
        s.push_str(action);
    }
    s
}

/// Forward or reverse body of a migration unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    /// Replayable structural changes.
    Structured { changes: Vec<SchemaChange> },
    /// Opaque SQL text, executed as-is.
    Sql { sql: String },
}

impl Operation {
    pub fn structured(changes: Vec<SchemaChange>) -> Self {
        Operation::Structured { changes }
    }

    pub fn sql(sql: impl Into<String>) -> Self {
        Operation::Sql { sql: sql.into() }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, Operation::Structured { .. })
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Operation::Structured { changes } => changes.is_empty(),
            Operation::Sql { sql } => sql.trim().is_empty(),
        }
    }

    pub fn to_sql(&self) -> Vec<String> {
        match self {
            Operation::Structured { changes } => changes.iter().flat_map(|c| c.to_sql()).collect(),
            Operation::Sql { sql } => vec![sql.clone()],
        }
    }
}

/// A single named, versioned schema change. Immutable once published: a new
/// change is a new unit, never an edit of an existing one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationUnit {
    pub id: UnitId,
    pub version: Version,
    pub forward: Operation,
    pub reverse: Option<Operation>,
    pub content_hash: String,
}

#[derive(Serialize)]
struct HashInput<'a> {
    id: &'a UnitId,
    version: &'a Version,
    forward: &'a Operation,
}

impl MigrationUnit {
    pub fn new(id: UnitId, version: Version, forward: Operation, reverse: Option<Operation>) -> Self {
        let content_hash = content_hash(&id, &version, &forward);
        Self {
            id,
            version,
            forward,
            reverse,
            content_hash,
        }
    }

    pub fn unit_ref(&self) -> UnitRef {
        UnitRef {
            id: self.id.clone(),
            content_hash: self.content_hash.clone(),
        }
    }
}

/// sha256 over the canonical JSON of a unit's identity, version and forward body.
pub fn content_hash(id: &UnitId, version: &Version, forward: &Operation) -> String {
    // Struct fields serialize in declaration order and all maps are BTreeMaps,
    // so the encoding is stable.
    let bytes = serde_json::to_vec(&HashInput { id, version, forward }).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Lightweight reference to a unit, used in results and error reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRef {
    pub id: UnitId,
    pub content_hash: String,
}

impl fmt::Display for UnitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(name: &str, sql: &str) -> MigrationUnit {
        MigrationUnit::new(
            UnitId {
                layer: Layer::Template,
                owner: "political_party_nepal".into(),
                name: name.into(),
            },
            Version::new(1, 0, 0),
            Operation::sql(sql),
            None,
        )
    }

    #[test]
    fn layers_order_basic_to_custom() {
        let mut layers = vec![Layer::Custom, Layer::Basic, Layer::Module, Layer::Template];
        layers.sort();
        assert_eq!(layers, vec![Layer::Basic, Layer::Template, Layer::Module, Layer::Custom]);
    }

    #[test]
    fn version_parses_and_orders() {
        let a: Version = "1.2.3".parse().unwrap();
        let b: Version = "1.10.0".parse().unwrap();
        assert!(a < b);
        assert_eq!(a.to_string(), "1.2.3");
        assert!("1.2".parse::<Version>().is_err());
        assert!("1.x.0".parse::<Version>().is_err());
    }

    #[test]
    fn definition_ref_with_and_without_version() {
        let (slug, v) = parse_definition_ref("political_party_nepal@1.0.0").unwrap();
        assert_eq!(slug, "political_party_nepal");
        assert_eq!(v, Some(Version::new(1, 0, 0)));
        let (slug, v) = parse_definition_ref("financial_tracking").unwrap();
        assert_eq!(slug, "financial_tracking");
        assert_eq!(v, None);
    }

    #[test]
    fn content_hash_is_stable_and_content_sensitive() {
        let a = unit("001_members", "CREATE TABLE members (id UUID)");
        let again = unit("001_members", "CREATE TABLE members (id UUID)");
        let changed = unit("001_members", "CREATE TABLE members (id BIGINT)");
        assert_eq!(a.content_hash, again.content_hash);
        assert_ne!(a.content_hash, changed.content_hash);
        assert_eq!(a.content_hash.len(), 64);
    }

    #[test]
    fn renders_create_table_with_keys_and_indexes() {
        let change = SchemaChange::CreateTable {
            table: TableDef {
                name: "donations".into(),
                columns: vec![
                    ColumnDef::new("id", "uuid", false),
                    ColumnDef::new("member_id", "uuid", true),
                ],
                primary_key: vec!["id".into()],
                indexes: vec![IndexDef {
                    name: "donations_member_idx".into(),
                    columns: vec!["member_id".into()],
                    unique: false,
                }],
                foreign_keys: vec![ForeignKeyDef {
                    name: "donations_member_fk".into(),
                    columns: vec!["member_id".into()],
                    ref_table: "members".into(),
                    ref_columns: vec!["id".into()],
                    on_delete: Some("SET NULL".into()),
                }],
            },
        };
        let sql = change.to_sql();
        assert_eq!(sql.len(), 2);
        assert!(sql[0].starts_with("CREATE TABLE \"donations\""));
        assert!(sql[0].contains("\"id\" uuid NOT NULL"));
        assert!(sql[0].contains("PRIMARY KEY (\"id\")"));
        assert!(sql[0].contains("REFERENCES \"members\" (\"id\") ON DELETE SET NULL"));
        assert_eq!(
            sql[1],
            "CREATE INDEX \"donations_member_idx\" ON \"donations\" (\"member_id\")"
        );
    }

    #[test]
    fn operation_serializes_tagged() {
        let op = Operation::structured(vec![SchemaChange::DropTable { table: "t".into() }]);
        let v = serde_json::to_value(&op).unwrap();
        assert_eq!(v["kind"], "structured");
        assert_eq!(v["changes"][0]["op"], "drop_table");
        let back: Operation = serde_json::from_value(v).unwrap();
        assert_eq!(back, op);
    }
}
