use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::connection::ExclusionList;
use crate::services::custom::{DestructivePolicy, DEFAULT_DESTRUCTIVE_KEYWORDS};
use crate::services::engine::{EngineSettings, DEFAULT_EXCLUDED_TABLES};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Tenant database URL with a `{tenant}` placeholder.
    pub tenant_database_url_template: String,
    pub tenant_pool_max_connections: u32,
    pub host: String,
    pub port: u16,
    pub admin_key: String,
    pub elevated_admin_key: String,
    pub redis_url: Option<String>,
    pub lock_ttl_secs: u64,
    pub definitions_dir: PathBuf,
    pub unit_timeout_secs: u64,
    pub excluded_tables: Vec<String>,
    pub destructive_keywords: Vec<String>,
    pub event_webhook_url: Option<String>,
    pub job_retention_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            tenant_database_url_template: required("TENANT_DATABASE_URL_TEMPLATE")?,
            tenant_pool_max_connections: env::var("TENANT_POOL_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "5".into())
                .parse()?,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".into())
                .parse()?,
            admin_key: required("ADMIN_KEY")?,
            elevated_admin_key: required("ELEVATED_ADMIN_KEY")?,
            redis_url: optional("REDIS_URL"),
            lock_ttl_secs: env::var("PROVISIONING_LOCK_TTL_SECS")
                .unwrap_or_else(|_| "3600".into())
                .parse()?,
            definitions_dir: env::var("DEFINITIONS_DIR")
                .unwrap_or_else(|_| "./definitions".into())
                .into(),
            unit_timeout_secs: env::var("UNIT_TIMEOUT_SECS")
                .unwrap_or_else(|_| "300".into())
                .parse()?,
            excluded_tables: list("SNAPSHOT_EXCLUDED_TABLES", DEFAULT_EXCLUDED_TABLES),
            destructive_keywords: list("DESTRUCTIVE_KEYWORDS", DEFAULT_DESTRUCTIVE_KEYWORDS),
            event_webhook_url: optional("EVENT_WEBHOOK_URL"),
            job_retention_secs: env::var("JOB_RETENTION_SECS")
                .unwrap_or_else(|_| "86400".into())
                .parse()?,
        })
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            unit_timeout: Duration::from_secs(self.unit_timeout_secs),
            excluded: ExclusionList::new(self.excluded_tables.iter().cloned()),
            policy: DestructivePolicy::new(&self.destructive_keywords),
            job_retention: Duration::from_secs(self.job_retention_secs),
        }
    }
}

fn required(key: &str) -> anyhow::Result<String> {
    env::var(key).map_err(|_| anyhow::anyhow!("Missing required env var: {}", key))
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Comma-separated list, or `default` when unset.
fn list(key: &str, default: &[&str]) -> Vec<String> {
    match optional(key) {
        Some(v) => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => default.iter().map(|s| s.to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_splits_and_trims() {
        env::set_var("TP_TEST_LIST", " DROP TABLE , TRUNCATE,, ");
        assert_eq!(list("TP_TEST_LIST", &["x"]), vec!["DROP TABLE", "TRUNCATE"]);
        assert_eq!(list("TP_TEST_LIST_UNSET", &["a", "b"]), vec!["a", "b"]);
    }

    #[test]
    fn empty_optional_is_unset() {
        env::set_var("TP_TEST_EMPTY", "");
        assert_eq!(optional("TP_TEST_EMPTY"), None);
        assert!(required("TP_TEST_MISSING").unwrap_err().to_string().contains("TP_TEST_MISSING"));
    }

    #[test]
    fn engine_settings_follow_the_lists() {
        let config = Config {
            database_url: String::new(),
            tenant_database_url_template: String::new(),
            tenant_pool_max_connections: 5,
            host: "0.0.0.0".into(),
            port: 8080,
            admin_key: "k".into(),
            elevated_admin_key: "e".into(),
            redis_url: None,
            lock_ttl_secs: 3600,
            definitions_dir: "./definitions".into(),
            unit_timeout_secs: 7,
            excluded_tables: vec!["audit_*".into()],
            destructive_keywords: vec!["drop   table".into()],
            event_webhook_url: None,
            job_retention_secs: 120,
        };
        let settings = config.engine_settings();
        assert_eq!(settings.unit_timeout, Duration::from_secs(7));
        assert_eq!(settings.job_retention, Duration::from_secs(120));
        assert!(settings.excluded.excludes("audit_trail"));
        assert!(!settings.excluded.excludes("members"));
        let drop = crate::models::migration::Operation::sql("DROP TABLE members");
        assert_eq!(settings.policy.matches(&drop), vec!["DROP TABLE"]);
    }
}
