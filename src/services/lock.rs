//! Per-tenant exclusive provisioning lock. A second caller fails fast with
//! `ProvisioningInProgress`, it never waits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::tenant::TenantId;
use crate::services::store::StoreError;

/// Held lock. Released when dropped, on every exit path.
pub struct LockGuard {
    tenant: TenantId,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    fn new(tenant: TenantId, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            tenant,
            release: Some(Box::new(release)),
        }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            tracing::debug!(tenant = %self.tenant, "Provisioning lock released");
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("tenant", &self.tenant).finish()
    }
}

#[async_trait]
pub trait ProvisioningLock: Send + Sync {
    async fn try_acquire(&self, tenant: &TenantId) -> EngineResult<LockGuard>;
}

/// Single-process lock.
#[derive(Default, Clone)]
pub struct InProcessLock {
    held: Arc<DashMap<TenantId, DateTime<Utc>>>,
}

impl InProcessLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, tenant: &TenantId) -> bool {
        self.held.contains_key(tenant)
    }
}

#[async_trait]
impl ProvisioningLock for InProcessLock {
    async fn try_acquire(&self, tenant: &TenantId) -> EngineResult<LockGuard> {
        match self.held.entry(tenant.clone()) {
            Entry::Occupied(_) => {
                tracing::warn!(tenant = %tenant, "Provisioning lock contention");
                return Err(EngineError::ProvisioningInProgress(tenant.clone()));
            }
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
            }
        }
        let held = self.held.clone();
        let key = tenant.clone();
        Ok(LockGuard::new(tenant.clone(), move || {
            held.remove(&key);
        }))
    }
}

// Deletes the key only if it still holds our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

// Extends the expiry only if the key still holds our token.
const RENEW_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(100);

/// Lock shared by every API replica, stored in Redis with an expiry so a
/// crashed holder cannot block a tenant forever.
///
/// While a guard lives, a lease task extends the expiry every third of the
/// TTL, so an apply may run longer than the TTL. Dropping the guard stops the
/// task, which then deletes the key. If that delete never reaches Redis the
/// key still expires one TTL later, because nothing renews it any more.
pub struct RedisLock {
    client: redis::Client,
    ttl: Duration,
}

impl RedisLock {
    pub fn new(client: redis::Client, ttl: Duration) -> Self {
        Self { client, ttl }
    }

    fn key(tenant: &TenantId) -> String {
        format!("provisioning_lock:{tenant}")
    }
}

fn unavailable(e: redis::RedisError) -> EngineError {
    EngineError::Storage(StoreError::Unavailable(format!("redis: {e}")))
}

/// How often a held lease is extended.
fn renew_interval(ttl: Duration) -> Duration {
    (ttl / 3).max(MIN_RENEW_INTERVAL)
}

/// Keeps `key` alive until `stop` fires, then releases it.
async fn hold_lease(
    mut conn: MultiplexedConnection,
    key: String,
    token: String,
    ttl: Duration,
    stop: CancellationToken,
) {
    let renew = redis::Script::new(RENEW_SCRIPT);
    let mut ticks = tokio::time::interval(renew_interval(ttl));
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticks.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticks.tick() => {
                let res: redis::RedisResult<i32> = renew
                    .key(&key)
                    .arg(&token)
                    .arg(ttl.as_millis() as u64)
                    .invoke_async(&mut conn)
                    .await;
                match res {
                    Ok(1) => tracing::trace!(key = %key, "Provisioning lock lease renewed"),
                    Ok(_) => {
                        tracing::error!(key = %key, "Provisioning lock lease lost; another holder may run");
                        return;
                    }
                    Err(e) => tracing::warn!(key = %key, "Failed to renew lease: {e}"),
                }
            }
        }
    }

    let release = redis::Script::new(RELEASE_SCRIPT);
    let res: redis::RedisResult<i32> = release.key(&key).arg(&token).invoke_async(&mut conn).await;
    if let Err(e) = res {
        tracing::warn!(key = %key, "Failed to release lock, it expires in {}s: {e}", ttl.as_secs());
    }
}

#[async_trait]
impl ProvisioningLock for RedisLock {
    async fn try_acquire(&self, tenant: &TenantId) -> EngineResult<LockGuard> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        let key = Self::key(tenant);
        let token = Uuid::new_v4().to_string();

        // SET NX PX: "OK" when newly set, nil when someone else holds it
        let acquired: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        if acquired.is_none() {
            tracing::warn!(tenant = %tenant, "Provisioning lock contention (redis)");
            return Err(EngineError::ProvisioningInProgress(tenant.clone()));
        }

        let stop = CancellationToken::new();
        tokio::spawn(hold_lease(conn, key, token, self.ttl, stop.clone()));
        Ok(LockGuard::new(tenant.clone(), move || stop.cancel()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_fails_until_released() {
        let lock = InProcessLock::new();
        let t1 = TenantId::parse("T1").unwrap();
        let t2 = TenantId::parse("T2").unwrap();

        let guard = lock.try_acquire(&t1).await.unwrap();
        assert!(matches!(
            lock.try_acquire(&t1).await,
            Err(EngineError::ProvisioningInProgress(t)) if t == t1
        ));
        // other tenants are independent
        let _other = lock.try_acquire(&t2).await.unwrap();

        drop(guard);
        assert!(!lock.is_held(&t1));
        assert!(lock.try_acquire(&t1).await.is_ok());
    }

    #[test]
    fn lease_is_renewed_well_before_it_expires() {
        assert_eq!(renew_interval(Duration::from_secs(3600)), Duration::from_secs(1200));
        assert_eq!(renew_interval(Duration::from_secs(60)), Duration::from_secs(20));
        assert_eq!(renew_interval(Duration::from_millis(90)), MIN_RENEW_INTERVAL);
    }

    #[tokio::test]
    async fn released_guard_cancels_its_lease() {
        let stop = CancellationToken::new();
        let t1 = TenantId::parse("T1").unwrap();
        let guard = LockGuard::new(t1, {
            let stop = stop.clone();
            move || stop.cancel()
        });
        assert!(!stop.is_cancelled());
        drop(guard);
        assert!(stop.is_cancelled());
    }
}
