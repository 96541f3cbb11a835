use std::sync::Arc;
use std::time::Duration;

use crate::services::catalog::LayerCatalog;
use crate::services::connection::{ExclusionList, TenantConnectionProvider};
use crate::services::custom::{CustomWorkflow, DestructivePolicy};
use crate::services::definitions::DefinitionSet;
use crate::services::drift::DriftDetector;
use crate::services::events::EventSink;
use crate::services::jobs::{JobRunner, DEFAULT_JOB_RETENTION};
use crate::services::ledger::AuditLedger;
use crate::services::lock::ProvisioningLock;
use crate::services::orchestrator::{Orchestrator, DEFAULT_UNIT_TIMEOUT};
use crate::services::repair::DriftRepairer;
use crate::services::snapshot::SnapshotService;
use crate::services::store::ControlStore;

pub const DEFAULT_EXCLUDED_TABLES: &[&str] = &["_sqlx_migrations", "schema_migrations", "pg_*"];

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub unit_timeout: Duration,
    pub excluded: ExclusionList,
    pub policy: DestructivePolicy,
    /// How long a finished job stays readable.
    pub job_retention: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            unit_timeout: DEFAULT_UNIT_TIMEOUT,
            excluded: ExclusionList::new(DEFAULT_EXCLUDED_TABLES.iter().copied()),
            policy: DestructivePolicy::default(),
            job_retention: DEFAULT_JOB_RETENTION,
        }
    }
}

/// Every engine component, wired over the same collaborators.
pub struct Engine {
    pub catalog: Arc<LayerCatalog>,
    pub store: Arc<dyn ControlStore>,
    pub ledger: AuditLedger,
    pub snapshots: Arc<SnapshotService>,
    pub orchestrator: Arc<Orchestrator>,
    pub drift: Arc<DriftDetector>,
    pub custom: Arc<CustomWorkflow>,
    pub repair: Arc<DriftRepairer>,
    pub jobs: JobRunner,
}

impl Engine {
    pub fn new(
        definitions: DefinitionSet,
        store: Arc<dyn ControlStore>,
        connections: Arc<dyn TenantConnectionProvider>,
        lock: Arc<dyn ProvisioningLock>,
        events: Arc<dyn EventSink>,
        settings: EngineSettings,
    ) -> Self {
        let catalog = Arc::new(LayerCatalog::new(definitions, store.clone()));
        let ledger = AuditLedger::new(store.clone());
        let snapshots = Arc::new(SnapshotService::new(connections.clone(), store.clone(), settings.excluded));
        let orchestrator = Arc::new(Orchestrator::new(
            catalog.clone(),
            store.clone(),
            ledger.clone(),
            connections,
            snapshots.clone(),
            lock.clone(),
            events.clone(),
            settings.unit_timeout,
        ));
        let drift = Arc::new(DriftDetector::new(
            catalog.clone(),
            ledger.clone(),
            store.clone(),
            snapshots.clone(),
            lock,
            events,
        ));
        let custom = Arc::new(CustomWorkflow::new(store.clone(), settings.policy));
        let repair = Arc::new(DriftRepairer::new(orchestrator.clone(), custom.clone()));

        Self {
            catalog,
            store,
            ledger,
            snapshots,
            orchestrator,
            drift,
            custom,
            repair,
            jobs: JobRunner::with_retention(settings.job_retention),
        }
    }
}
