pub mod control;
pub mod memory;
pub mod tenant;

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

const CONTROL_POOL_MAX_CONNECTIONS: u32 = 10;
const CONTROL_POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pool for the control-plane database (tenant state, ledger, snapshots,
/// custom migration requests).
pub async fn create_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(CONTROL_POOL_MAX_CONNECTIONS)
        .acquire_timeout(CONTROL_POOL_ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Applies the control-plane schema embedded from ./migrations/
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
