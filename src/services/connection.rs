//! Tenant Connection Provider seam.
//!
//! The engine never pools or routes connections itself. It asks the provider
//! for a scoped handle, uses it for one transaction, and drops it. Dropping a
//! handle with an open transaction must roll that transaction back.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::migration::Operation;
use crate::models::snapshot::SchemaStructure;
use crate::models::tenant::TenantId;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("statement failed: {0}")]
    Statement(String),
    #[error("no open transaction")]
    NoTransaction,
    #[error("transaction already open")]
    TransactionOpen,
    #[error("introspection failed: {0}")]
    Introspection(String),
}

impl From<sqlx::Error> for ConnectionError {
    fn from(e: sqlx::Error) -> Self {
        ConnectionError::Statement(e.to_string())
    }
}

/// Tables left out of snapshots. An entry ending in `*` is a prefix pattern.
#[derive(Debug, Clone, Default)]
pub struct ExclusionList {
    patterns: Vec<String>,
}

impl ExclusionList {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.into().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn excludes(&self, table: &str) -> bool {
        let table = table.to_lowercase();
        self.patterns.iter().any(|p| match p.strip_suffix('*') {
            Some(prefix) => table.starts_with(prefix),
            None => &table == p,
        })
    }
}

#[async_trait]
pub trait TenantConnection: Send {
    async fn begin(&mut self) -> Result<(), ConnectionError>;
    async fn execute(&mut self, op: &Operation) -> Result<(), ConnectionError>;
    async fn commit(&mut self) -> Result<(), ConnectionError>;
    async fn rollback(&mut self) -> Result<(), ConnectionError>;
    /// Reads the live structure, outside of any transaction.
    async fn introspect(&mut self, excluded: &ExclusionList) -> Result<SchemaStructure, ConnectionError>;
}

#[async_trait]
pub trait TenantConnectionProvider: Send + Sync {
    async fn connection_for(&self, tenant: &TenantId) -> Result<Box<dyn TenantConnection>, ConnectionError>;

    /// Makes sure the tenant database exists before its first use.
    async fn prepare(&self, _tenant: &TenantId) -> Result<(), ConnectionError> {
        Ok(())
    }
}

/// Runs `op` in its own transaction on a freshly acquired handle. The handle
/// is released on every path, including when the returned future is dropped.
pub async fn run_in_transaction(
    provider: &dyn TenantConnectionProvider,
    tenant: &TenantId,
    op: &Operation,
) -> Result<(), ConnectionError> {
    let mut conn = provider.connection_for(tenant).await?;
    conn.begin().await?;
    match conn.execute(op).await {
        Ok(()) => conn.commit().await,
        Err(e) => {
            if let Err(rb) = conn.rollback().await {
                tracing::warn!(tenant = %tenant, "rollback after failed statement also failed: {rb}");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusion_patterns() {
        let ex = ExclusionList::new(["_sqlx_migrations", "pg_*", " "]);
        assert!(ex.excludes("_sqlx_migrations"));
        assert!(ex.excludes("PG_STAT_THING"));
        assert!(!ex.excludes("members"));
        assert!(!ex.excludes("_sqlx_migrations_old"));
    }
}
