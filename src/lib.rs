// Library exports for the API server, the operator CLI and tests
pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tracing::info;

use config::Config;
use db::{control::PgControlStore, tenant::PgTenantConnections};
use services::definitions::DefinitionSet;
use services::engine::Engine;
use services::events::{EventSink, TracingEventSink, WebhookEventSink};
use services::lock::{InProcessLock, ProvisioningLock, RedisLock};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<Config>,
    pub engine: Arc<Engine>,
}

/// Wires the engine over Postgres: control store on `pool`, one database per
/// tenant, Redis lock when configured, webhook events when configured.
pub async fn build_engine(config: &Config, pool: PgPool) -> anyhow::Result<Engine> {
    let definitions = DefinitionSet::load_dir(&config.definitions_dir).await?;

    let store = Arc::new(PgControlStore::new(pool.clone()));
    let connections = Arc::new(
        PgTenantConnections::new(
            config.tenant_database_url_template.clone(),
            config.tenant_pool_max_connections,
        )
        .with_admin_pool(pool),
    );

    let lock: Arc<dyn ProvisioningLock> = match &config.redis_url {
        Some(url) => {
            info!("Provisioning lock: Redis");
            Arc::new(RedisLock::new(
                redis::Client::open(url.as_str())?,
                Duration::from_secs(config.lock_ttl_secs),
            ))
        }
        None => {
            info!("Provisioning lock: in-process (single replica)");
            Arc::new(InProcessLock::new())
        }
    };

    let events: Arc<dyn EventSink> = match &config.event_webhook_url {
        Some(url) => Arc::new(WebhookEventSink::new(url.clone())),
        None => Arc::new(TracingEventSink),
    };

    Ok(Engine::new(
        definitions,
        store,
        connections,
        lock,
        events,
        config.engine_settings(),
    ))
}
