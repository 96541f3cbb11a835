use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::migration::Operation;
use crate::models::snapshot::{ColumnDef, ForeignKeyDef, IndexDef, SchemaStructure, TableDef};
use crate::models::tenant::TenantId;
use crate::services::connection::{
    ConnectionError, ExclusionList, TenantConnection, TenantConnectionProvider,
};

/// Resolve a tenant's database URL from a template containing `{tenant}`.
pub fn tenant_database_url(template: &str, tenant: &TenantId) -> String {
    template.replace("{tenant}", &tenant.database_name())
}

/// Create the tenant's database on the control-plane server if it is missing.
/// Idempotent.
pub async fn ensure_tenant_database(pool: &PgPool, tenant: &TenantId) -> Result<(), sqlx::Error> {
    let name = tenant.database_name();
    let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(&name)
        .fetch_one(pool)
        .await?;
    if !exists {
        // CREATE DATABASE cannot run inside a transaction block
        sqlx::raw_sql(&format!("CREATE DATABASE \"{name}\""))
            .execute(pool)
            .await?;
        tracing::info!("Created tenant database {name}");
    }
    Ok(())
}

/// One lazily created pool per tenant database. Routing is by URL template.
pub struct PgTenantConnections {
    url_template: String,
    max_connections: u32,
    pools: DashMap<TenantId, PgPool>,
    /// Control-plane pool used to create missing tenant databases.
    admin: Option<PgPool>,
}

impl PgTenantConnections {
    pub fn new(url_template: String, max_connections: u32) -> Self {
        Self {
            url_template,
            max_connections,
            pools: DashMap::new(),
            admin: None,
        }
    }

    pub fn with_admin_pool(mut self, pool: PgPool) -> Self {
        self.admin = Some(pool);
        self
    }

    async fn pool(&self, tenant: &TenantId) -> Result<PgPool, ConnectionError> {
        if let Some(pool) = self.pools.get(tenant) {
            return Ok(pool.clone());
        }
        let url = tenant_database_url(&self.url_template, tenant);
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&url)
            .await
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;
        Ok(self.pools.entry(tenant.clone()).or_insert(pool).clone())
    }
}

#[async_trait]
impl TenantConnectionProvider for PgTenantConnections {
    async fn connection_for(&self, tenant: &TenantId) -> Result<Box<dyn TenantConnection>, ConnectionError> {
        let pool = self.pool(tenant).await?;
        Ok(Box::new(PgTenantConnection { pool, tx: None }))
    }

    async fn prepare(&self, tenant: &TenantId) -> Result<(), ConnectionError> {
        match &self.admin {
            Some(admin) => ensure_tenant_database(admin, tenant)
                .await
                .map_err(|e| ConnectionError::Connect(e.to_string())),
            None => Ok(()),
        }
    }
}

/// Scoped handle: at most one open transaction, rolled back by sqlx on drop.
pub struct PgTenantConnection {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
}

#[async_trait]
impl TenantConnection for PgTenantConnection {
    async fn begin(&mut self) -> Result<(), ConnectionError> {
        if self.tx.is_some() {
            return Err(ConnectionError::TransactionOpen);
        }
        self.tx = Some(self.pool.begin().await?);
        Ok(())
    }

    async fn execute(&mut self, op: &Operation) -> Result<(), ConnectionError> {
        // Owned while executing; a failure leaves it open for the caller's rollback.
        let mut tx = self.tx.take().ok_or(ConnectionError::NoTransaction)?;
        let mut outcome = Ok(());
        for stmt in op.to_sql() {
            if let Err(e) = execute_raw(&mut tx, &stmt).await {
                outcome = Err(ConnectionError::from(e));
                break;
            }
        }
        self.tx = Some(tx);
        outcome
    }

    async fn commit(&mut self) -> Result<(), ConnectionError> {
        let tx = self.tx.take().ok_or(ConnectionError::NoTransaction)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), ConnectionError> {
        let tx = self.tx.take().ok_or(ConnectionError::NoTransaction)?;
        tx.rollback().await?;
        Ok(())
    }

    async fn introspect(&mut self, excluded: &ExclusionList) -> Result<SchemaStructure, ConnectionError> {
        introspect_public_schema(&self.pool, excluded)
            .await
            .map_err(|e| ConnectionError::Introspection(e.to_string()))
    }
}

async fn execute_raw(conn: &mut sqlx::PgConnection, stmt: &str) -> Result<(), sqlx::Error> {
    // Unbound `&str` runs over the simple-query protocol, same as `sqlx::raw_sql`.
    sqlx::Executor::execute(conn, stmt).await.map(|_| ())
}

async fn introspect_public_schema(
    pool: &PgPool,
    excluded: &ExclusionList,
) -> Result<SchemaStructure, sqlx::Error> {
    let mut tables: BTreeMap<String, TableDef> = BTreeMap::new();

    // --- Columns, in ordinal order ---
    let columns: Vec<(String, String, String, bool, Option<String>)> = sqlx::query_as(
        r#"SELECT cl.relname::TEXT, a.attname::TEXT, format_type(a.atttypid, a.atttypmod),
                  NOT a.attnotnull, pg_get_expr(d.adbin, d.adrelid)
           FROM pg_attribute a
           JOIN pg_class cl     ON cl.oid = a.attrelid
           JOIN pg_namespace n  ON n.oid = cl.relnamespace
           LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
           WHERE n.nspname = 'public' AND cl.relkind = 'r'
             AND a.attnum > 0 AND NOT a.attisdropped
           ORDER BY cl.relname, a.attnum"#,
    )
    .fetch_all(pool)
    .await?;

    for (table, name, data_type, nullable, default) in columns {
        if excluded.excludes(&table) {
            continue;
        }
        tables
            .entry(table.clone())
            .or_insert_with(|| empty_table(&table))
            .columns
            .push(ColumnDef { name, data_type, nullable, default });
    }

    // --- Indexes (primary key folded into the table) ---
    let indexes: Vec<(String, String, bool, bool, Vec<String>)> = sqlx::query_as(
        r#"SELECT t.relname::TEXT, i.relname::TEXT, ix.indisunique, ix.indisprimary,
                  ARRAY(SELECT a.attname::TEXT
                        FROM unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
                        JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
                        ORDER BY k.ord)
           FROM pg_index ix
           JOIN pg_class t     ON t.oid = ix.indrelid
           JOIN pg_class i     ON i.oid = ix.indexrelid
           JOIN pg_namespace n ON n.oid = t.relnamespace
           WHERE n.nspname = 'public' AND t.relkind = 'r'"#,
    )
    .fetch_all(pool)
    .await?;

    for (table, name, unique, primary, columns) in indexes {
        let Some(t) = tables.get_mut(&table) else { continue };
        if primary {
            t.primary_key = columns;
        } else {
            t.indexes.push(IndexDef { name, columns, unique });
        }
    }

    // --- Foreign keys ---
    let fks: Vec<(String, String, Vec<String>, String, Vec<String>, String)> = sqlx::query_as(
        r#"SELECT cl.relname::TEXT, con.conname::TEXT,
                  ARRAY(SELECT a.attname::TEXT
                        FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
                        JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
                        ORDER BY k.ord),
                  ref.relname::TEXT,
                  ARRAY(SELECT a.attname::TEXT
                        FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ord)
                        JOIN pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = k.attnum
                        ORDER BY k.ord),
                  con.confdeltype::TEXT
           FROM pg_constraint con
           JOIN pg_class cl    ON cl.oid = con.conrelid
           JOIN pg_class ref   ON ref.oid = con.confrelid
           JOIN pg_namespace n ON n.oid = cl.relnamespace
           WHERE con.contype = 'f' AND n.nspname = 'public'"#,
    )
    .fetch_all(pool)
    .await?;

    for (table, name, columns, ref_table, ref_columns, on_delete) in fks {
        let Some(t) = tables.get_mut(&table) else { continue };
        t.foreign_keys.push(ForeignKeyDef {
            name,
            columns,
            ref_table,
            ref_columns,
            on_delete: delete_action(&on_delete),
        });
    }

    Ok(SchemaStructure { tables })
}

fn empty_table(name: &str) -> TableDef {
    TableDef {
        name: name.to_string(),
        columns: Vec::new(),
        primary_key: Vec::new(),
        indexes: Vec::new(),
        foreign_keys: Vec::new(),
    }
}

/// `pg_constraint.confdeltype` code to its SQL spelling. NO ACTION is the default.
fn delete_action(code: &str) -> Option<String> {
    match code {
        "r" => Some("RESTRICT".into()),
        "c" => Some("CASCADE".into()),
        "n" => Some("SET NULL".into()),
        "d" => Some("SET DEFAULT".into()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_template_uses_database_name() {
        let t = TenantId::parse("Party-One").unwrap();
        assert_eq!(
            tenant_database_url("postgres://u:p@db:5432/{tenant}", &t),
            "postgres://u:p@db:5432/tenant_party_one"
        );
    }

    #[test]
    fn delete_action_codes() {
        assert_eq!(delete_action("c").as_deref(), Some("CASCADE"));
        assert_eq!(delete_action("a"), None);
    }
}
