//! Background execution of long applies. A request is validated and the
//! tenant lock taken before the job id is returned; the job then runs on the
//! runtime and owns the lock guard until it finishes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::models::tenant::TenantId;
use crate::services::lock::LockGuard;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobState {
    Running,
    Succeeded { result: Value },
    Failed { error: Value },
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub tenant: TenantId,
    pub kind: String,
    #[serde(flatten)]
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone)]
pub struct JobRunner {
    jobs: Arc<DashMap<Uuid, Job>>,
    // tenant -> (job id, token) of the job holding its lock
    running: Arc<DashMap<TenantId, (Uuid, CancellationToken)>>,
    retention: Duration,
}

impl Default for JobRunner {
    fn default() -> Self {
        Self::with_retention(DEFAULT_JOB_RETENTION)
    }
}

impl JobRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finished jobs are forgotten once they are older than `retention`.
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            running: Arc::new(DashMap::new()),
            retention,
        }
    }

    /// Drops finished jobs past the retention window. Running jobs stay.
    pub fn prune(&self) -> usize {
        let now = Utc::now();
        let before = self.jobs.len();
        self.jobs.retain(|_, job| match job.finished_at {
            None => true,
            Some(at) => (now - at).to_std().map_or(true, |age| age < self.retention),
        });
        let pruned = before.saturating_sub(self.jobs.len());
        if pruned > 0 {
            tracing::debug!(pruned = pruned, "Finished jobs pruned");
        }
        pruned
    }

    /// Spawns `work`. The guard is released when the work finishes, before
    /// the job is marked done.
    pub fn spawn<F, Fut, T>(&self, guard: LockGuard, kind: &str, work: F) -> Uuid
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = EngineResult<T>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        self.prune();
        let id = Uuid::new_v4();
        let tenant = guard.tenant().clone();
        let token = CancellationToken::new();

        self.jobs.insert(
            id,
            Job {
                id,
                tenant: tenant.clone(),
                kind: kind.to_string(),
                state: JobState::Running,
                started_at: Utc::now(),
                finished_at: None,
            },
        );
        self.running.insert(tenant.clone(), (id, token.clone()));
        tracing::info!(tenant = %tenant, job = %id, kind = kind, "Job started");

        let jobs = self.jobs.clone();
        let running = self.running.clone();
        tokio::spawn(async move {
            let outcome = work(token).await;
            drop(guard);
            running.remove_if(&tenant, |_, (job, _)| *job == id);

            let state = match outcome {
                Ok(value) => match serde_json::to_value(value) {
                    Ok(result) => JobState::Succeeded { result },
                    Err(e) => JobState::Failed { error: serde_json::json!({ "error": e.to_string() }) },
                },
                Err(e) => {
                    tracing::warn!(tenant = %tenant, job = %id, "Job failed: {e}");
                    JobState::Failed { error: e.to_json() }
                }
            };
            if let Some(mut job) = jobs.get_mut(&id) {
                job.state = state;
                job.finished_at = Some(Utc::now());
            }
            tracing::info!(tenant = %tenant, job = %id, "Job finished");
        });
        id
    }

    pub fn job(&self, id: Uuid) -> Option<Job> {
        self.jobs.get(&id).map(|j| j.clone())
    }

    /// Cancels the tenant's running job between units. Returns the job id.
    pub fn cancel(&self, tenant: &TenantId) -> Option<Uuid> {
        let entry = self.running.get(tenant)?;
        let (id, token) = entry.value();
        token.cancel();
        tracing::warn!(tenant = %tenant, job = %id, "Job cancellation requested");
        Some(*id)
    }

    pub fn running_job(&self, tenant: &TenantId) -> Option<Uuid> {
        self.running.get(tenant).map(|e| e.value().0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::services::lock::{InProcessLock, ProvisioningLock};
    use std::time::Duration;

    async fn wait_done(runner: &JobRunner, id: Uuid) -> Job {
        for _ in 0..100 {
            let job = runner.job(id).unwrap();
            if !matches!(job.state, JobState::Running) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not finish");
    }

    #[tokio::test]
    async fn job_holds_the_lock_until_done() {
        let lock = InProcessLock::new();
        let runner = JobRunner::new();
        let t = TenantId::parse("T1").unwrap();
        let guard = lock.try_acquire(&t).await.unwrap();

        let id = runner.spawn(guard, "test", |token| async move {
            token.cancelled().await;
            EngineResult::Ok(42)
        });
        assert!(lock.is_held(&t));
        assert_eq!(runner.cancel(&t), Some(id));

        let job = wait_done(&runner, id).await;
        assert!(matches!(job.state, JobState::Succeeded { ref result } if result == 42));
        assert!(!lock.is_held(&t));
        assert_eq!(runner.running_job(&t), None);
    }

    #[tokio::test]
    async fn failures_keep_the_error_body() {
        let lock = InProcessLock::new();
        let runner = JobRunner::new();
        let t = TenantId::parse("T1").unwrap();
        let guard = lock.try_acquire(&t).await.unwrap();
        let failing = t.clone();
        let id = runner.spawn(guard, "test", move |_| async move {
            EngineResult::<()>::Err(EngineError::UnknownTenant(failing))
        });
        let job = wait_done(&runner, id).await;
        assert!(matches!(job.state, JobState::Failed { ref error } if error["code"] == "unknown_tenant"));
    }

    #[tokio::test]
    async fn finished_jobs_are_pruned_after_retention() {
        let lock = InProcessLock::new();
        let runner = JobRunner::with_retention(Duration::ZERO);
        let t1 = TenantId::parse("T1").unwrap();
        let t2 = TenantId::parse("T2").unwrap();

        let done = runner.spawn(lock.try_acquire(&t1).await.unwrap(), "test", |_| async { EngineResult::Ok(1) });
        wait_done(&runner, done).await;
        let waiting = runner.spawn(lock.try_acquire(&t2).await.unwrap(), "test", |token| async move {
            token.cancelled().await;
            EngineResult::Ok(2)
        });

        // spawning pruned the finished job, the running one stays
        assert!(runner.job(done).is_none());
        assert!(runner.job(waiting).is_some());
        assert_eq!(runner.prune(), 0);

        runner.cancel(&t2);
        wait_done(&runner, waiting).await;
        assert_eq!(runner.prune(), 1);
        assert!(runner.job(waiting).is_none());
    }

    #[tokio::test]
    async fn finished_jobs_stay_readable_within_retention() {
        let lock = InProcessLock::new();
        let runner = JobRunner::new();
        let t = TenantId::parse("T1").unwrap();
        let id = runner.spawn(lock.try_acquire(&t).await.unwrap(), "test", |_| async { EngineResult::Ok(1) });
        wait_done(&runner, id).await;
        assert_eq!(runner.prune(), 0);
        assert!(runner.job(id).is_some());
    }
}
