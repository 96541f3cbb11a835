//! Applies ordered migration units to one tenant database.
//!
//! Each unit runs in its own transaction. A failure stops the call, records a
//! `failed` entry and rolls back, in reverse order, the units this call had
//! already applied. Units applied by earlier calls are never touched.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult, ProvisioningFailure};
use crate::models::audit::{AuditOutcome, Direction, NewAuditEntry};
use crate::models::custom::{CustomMigrationRequest, CustomStatus};
use crate::models::definition::TemplateDef;
use crate::models::migration::{Layer, MigrationUnit, Operation, UnitId, Version};
use crate::models::provisioning::{
    ApplyResult, FailureCause, ProvisioningOutcome, RollbackReport, RollbackStatus, REVERSED_NOT_RECORDED,
};
use crate::models::tenant::{AppliedDefinition, TenantId, TenantState, TenantStatus};
use crate::services::catalog::{LayerCatalog, UnitQuery};
use crate::services::connection::{run_in_transaction, TenantConnectionProvider};
use crate::services::custom;
use crate::services::events::{EventSink, ProvisioningEvent};
use crate::services::ledger::AuditLedger;
use crate::services::lock::{LockGuard, ProvisioningLock};
use crate::services::metrics::{APPLY_COUNTER, UNITS_COUNTER, UNIT_DURATION};
use crate::services::resolver;
use crate::services::snapshot::SnapshotService;
use crate::services::store::ControlStore;

pub const DEFAULT_UNIT_TIMEOUT: Duration = Duration::from_secs(300);

/// A validated template request, ready to run under the tenant lock.
#[derive(Debug, Clone)]
pub struct TemplatePlan {
    pub tenant: TenantId,
    pub template: TemplateDef,
    /// Modules to apply after the template, in resolver order.
    pub modules: Vec<String>,
    /// The tenant already has this template: report, execute nothing.
    pub verify_only: bool,
}

#[derive(Debug, Clone)]
pub struct ModulePlan {
    pub tenant: TenantId,
    pub modules: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CustomPlan {
    pub tenant: TenantId,
    pub request: CustomMigrationRequest,
}

pub struct Orchestrator {
    catalog: Arc<LayerCatalog>,
    store: Arc<dyn ControlStore>,
    ledger: AuditLedger,
    connections: Arc<dyn TenantConnectionProvider>,
    snapshots: Arc<SnapshotService>,
    lock: Arc<dyn ProvisioningLock>,
    events: Arc<dyn EventSink>,
    unit_timeout: Duration,
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<LayerCatalog>,
        store: Arc<dyn ControlStore>,
        ledger: AuditLedger,
        connections: Arc<dyn TenantConnectionProvider>,
        snapshots: Arc<SnapshotService>,
        lock: Arc<dyn ProvisioningLock>,
        events: Arc<dyn EventSink>,
        unit_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            store,
            ledger,
            connections,
            snapshots,
            lock,
            events,
            unit_timeout,
        }
    }

    pub async fn tenant(&self, tenant: &TenantId) -> EngineResult<TenantState> {
        self.store
            .tenant(tenant)
            .await?
            .ok_or_else(|| EngineError::UnknownTenant(tenant.clone()))
    }

    pub async fn tenants(&self) -> EngineResult<Vec<TenantState>> {
        Ok(self.store.list_tenants().await?)
    }

    pub async fn lock(&self, tenant: &TenantId) -> EngineResult<LockGuard> {
        self.lock.try_acquire(tenant).await
    }

    /// Applies `units` in order under the tenant lock.
    pub async fn apply(
        &self,
        tenant: &TenantId,
        layer: Layer,
        units: &[MigrationUnit],
        actor: &str,
    ) -> EngineResult<ApplyResult> {
        let _guard = self.lock(tenant).await?;
        self.tenant(tenant).await?;
        self.apply_locked(tenant, layer, units, actor, &CancellationToken::new())
            .await
    }

    /// Same as [`Orchestrator::apply`]; the caller holds the tenant lock.
    pub async fn apply_locked(
        &self,
        tenant: &TenantId,
        layer: Layer,
        units: &[MigrationUnit],
        actor: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<ApplyResult> {
        let started = Instant::now();
        let already_applied = self.ledger.applied_hashes(tenant).await?;
        let mut result = ApplyResult::new(tenant.clone(), layer);

        let mut pending: Vec<&MigrationUnit> = Vec::new();
        for unit in units {
            if already_applied.contains(&unit.content_hash) {
                tracing::debug!(tenant = %tenant, layer = %layer, unit = %unit.id, "Unit already applied, skipping");
                UNITS_COUNTER.with_label_values(&[layer.as_str(), "skipped"]).inc();
                result.skipped.push(unit.unit_ref());
            } else {
                pending.push(unit);
            }
        }

        tracing::info!(
            tenant = %tenant,
            layer = %layer,
            pending = pending.len(),
            skipped = result.skipped.len(),
            actor = actor,
            "Applying units"
        );
        self.events
            .publish(ProvisioningEvent::ProvisioningStarted {
                tenant: tenant.clone(),
                layer,
                units: pending.len(),
                actor: actor.to_string(),
            })
            .await;

        let total = pending.len();
        let mut done: Vec<&MigrationUnit> = Vec::new();
        for (index, unit) in pending.into_iter().enumerate() {
            if cancel.is_cancelled() {
                let cause = FailureCause::Cancelled;
                let unrecorded = self.record_failure(tenant, unit, 0, &cause, actor).await;
                return Err(self.abort(tenant, layer, unit, cause, unrecorded, &done, actor).await);
            }

            let unit_started = Instant::now();
            let outcome = tokio::time::timeout(
                self.unit_timeout,
                run_in_transaction(self.connections.as_ref(), tenant, &unit.forward),
            )
            .await;
            let ms = elapsed_ms(unit_started);

            let cause = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(FailureCause::Execution { error: e.to_string() }),
                Err(_) => Some(FailureCause::Timeout { after_secs: self.unit_timeout.as_secs() }),
            };
            if let Some(cause) = cause {
                let unrecorded = self.record_failure(tenant, unit, ms, &cause, actor).await;
                return Err(self.abort(tenant, layer, unit, cause, unrecorded, &done, actor).await);
            }

            UNIT_DURATION
                .with_label_values(&[layer.as_str()])
                .observe(unit_started.elapsed().as_secs_f64());

            // Committed from here on, so it is part of what a rollback must undo.
            done.push(unit);
            let entry = NewAuditEntry::for_unit(tenant, unit, Direction::Forward, AuditOutcome::Applied, actor).took(ms);
            if let Err(e) = self.ledger.record(entry).await {
                let cause = FailureCause::AuditWrite { error: e.to_string() };
                return Err(self.abort(tenant, layer, unit, cause, None, &done, actor).await);
            }

            UNITS_COUNTER.with_label_values(&[layer.as_str(), "applied"]).inc();
            tracing::info!(tenant = %tenant, layer = %layer, unit = %unit.id, duration_ms = ms, "Unit applied");
            self.save_checkpoint(tenant, &unit.id).await;
            self.events
                .publish(ProvisioningEvent::ProvisioningProgress {
                    tenant: tenant.clone(),
                    layer,
                    unit: unit.id.to_string(),
                    index: index + 1,
                    total,
                })
                .await;
        }

        result.applied = done.iter().map(|u| u.unit_ref()).collect();
        if !done.is_empty() {
            let ops: Vec<&Operation> = done.iter().map(|u| &u.forward).collect();
            self.refresh_baseline(tenant, &ops).await;
        }
        result.duration_ms = elapsed_ms(started);

        APPLY_COUNTER.with_label_values(&[layer.as_str(), "succeeded"]).inc();
        tracing::info!(
            tenant = %tenant,
            layer = %layer,
            applied = result.applied.len(),
            skipped = result.skipped.len(),
            duration_ms = result.duration_ms,
            "Apply completed"
        );
        self.events
            .publish(ProvisioningEvent::ProvisioningCompleted {
                tenant: tenant.clone(),
                layer,
                applied: result.applied.len(),
                skipped: result.skipped.len(),
                duration_ms: result.duration_ms,
            })
            .await;
        Ok(result)
    }

    /// Returns the ledger error when the `failed` entry could not be written.
    async fn record_failure(
        &self,
        tenant: &TenantId,
        unit: &MigrationUnit,
        ms: u64,
        cause: &FailureCause,
        actor: &str,
    ) -> Option<String> {
        let entry = NewAuditEntry::for_unit(tenant, unit, Direction::Forward, AuditOutcome::Failed, actor)
            .took(ms)
            .with_error(cause.to_string());
        match self.ledger.record(entry).await {
            Ok(_) => None,
            Err(e) => {
                tracing::error!(tenant = %tenant, unit = %unit.id, "Failure of unit not recorded: {e}");
                Some(e.to_string())
            }
        }
    }

    /// Rolls back `done` and builds the error the call fails with.
    #[allow(clippy::too_many_arguments)]
    async fn abort(
        &self,
        tenant: &TenantId,
        layer: Layer,
        failed: &MigrationUnit,
        cause: FailureCause,
        unrecorded: Option<String>,
        done: &[&MigrationUnit],
        actor: &str,
    ) -> EngineError {
        tracing::error!(
            tenant = %tenant,
            layer = %layer,
            unit = %failed.id,
            cause = %cause,
            rolling_back = done.len(),
            "Unit failed"
        );
        let rollbacks = self.roll_back(tenant, done, actor).await;

        APPLY_COUNTER.with_label_values(&[layer.as_str(), "failed"]).inc();
        self.events
            .publish(ProvisioningEvent::ProvisioningFailed {
                tenant: tenant.clone(),
                layer,
                failed_unit: failed.id.to_string(),
                cause: cause.to_string(),
            })
            .await;

        EngineError::ProvisioningFailed(Box::new(ProvisioningFailure {
            tenant: tenant.clone(),
            layer,
            failed_unit: failed.unit_ref(),
            cause,
            rollbacks,
            unrecorded,
        }))
    }

    /// Best effort: every unit is attempted, newest first, and each outcome
    /// is reported and recorded.
    async fn roll_back(&self, tenant: &TenantId, done: &[&MigrationUnit], actor: &str) -> Vec<RollbackReport> {
        let mut reports = Vec::with_capacity(done.len());
        for unit in done.iter().rev() {
            let started = Instant::now();
            let mut status = match &unit.reverse {
                None => RollbackStatus::Failed { error: "no reverse operation".into() },
                Some(reverse) => self.run_reverse(tenant, reverse).await,
            };
            let ms = elapsed_ms(started);

            let entry = match &status {
                RollbackStatus::RolledBack => {
                    NewAuditEntry::for_unit(tenant, unit, Direction::Reverse, AuditOutcome::RolledBack, actor)
                }
                RollbackStatus::Failed { error } => {
                    NewAuditEntry::for_unit(tenant, unit, Direction::Reverse, AuditOutcome::Failed, actor)
                        .with_error(error.clone())
                }
            }
            .took(ms);
            if let Err(e) = self.ledger.record(entry).await {
                if status == RollbackStatus::RolledBack {
                    status = RollbackStatus::Failed { error: format!("{REVERSED_NOT_RECORDED}: {e}") };
                }
            }

            let layer = unit.id.layer.as_str();
            match &status {
                RollbackStatus::RolledBack => {
                    UNITS_COUNTER.with_label_values(&[layer, "rolled_back"]).inc();
                    tracing::info!(tenant = %tenant, layer = layer, unit = %unit.id, "Unit rolled back");
                }
                RollbackStatus::Failed { error } => {
                    UNITS_COUNTER.with_label_values(&[layer, "rollback_failed"]).inc();
                    tracing::error!(tenant = %tenant, layer = layer, unit = %unit.id, "Rollback failed: {error}");
                }
            }
            reports.push(RollbackReport { unit: unit.unit_ref(), status });
        }
        reports
    }

    async fn run_reverse(&self, tenant: &TenantId, reverse: &Operation) -> RollbackStatus {
        match tokio::time::timeout(
            self.unit_timeout,
            run_in_transaction(self.connections.as_ref(), tenant, reverse),
        )
        .await
        {
            Ok(Ok(())) => RollbackStatus::RolledBack,
            Ok(Err(e)) => RollbackStatus::Failed { error: e.to_string() },
            Err(_) => RollbackStatus::Failed {
                error: FailureCause::Timeout { after_secs: self.unit_timeout.as_secs() }.to_string(),
            },
        }
    }

    async fn save_checkpoint(&self, tenant: &TenantId, unit: &UnitId) {
        let saved = async {
            let mut state = self.tenant(tenant).await?;
            state.checkpoint = Some(unit.to_string());
            state.updated_at = Utc::now();
            self.store.save_tenant(&state).await?;
            EngineResult::Ok(())
        }
        .await;
        if let Err(e) = saved {
            tracing::warn!(tenant = %tenant, unit = %unit, "Checkpoint not saved: {e}");
        }
    }

    /// Records the expected structure after a successful call. Structured
    /// operations are replayed onto the previous baseline, anything else
    /// falls back to a fresh capture.
    async fn refresh_baseline(&self, tenant: &TenantId, ops: &[&Operation]) {
        if let Err(e) = self.try_refresh_baseline(tenant, ops).await {
            tracing::error!(tenant = %tenant, "Baseline not recorded: {e}");
        }
    }

    async fn try_refresh_baseline(&self, tenant: &TenantId, ops: &[&Operation]) -> EngineResult<()> {
        let previous = self.snapshots.latest_baseline(tenant).await?;
        let replayed = match previous {
            Some(baseline) if ops.iter().all(|op| op.is_structured()) => {
                let mut structure = baseline.structure;
                match ops.iter().try_for_each(|op| structure.apply_operation(op)) {
                    Ok(()) => Some(structure),
                    Err(e) => {
                        tracing::warn!(tenant = %tenant, "Baseline replay failed ({e}), capturing instead");
                        None
                    }
                }
            }
            _ => None,
        };
        let structure = match replayed {
            Some(structure) => structure,
            None => self.snapshots.capture(tenant).await?.structure,
        };
        let baseline = self.snapshots.record_baseline(tenant, structure).await?;

        let mut state = self.tenant(tenant).await?;
        state.fingerprint = Some(baseline.fingerprint.aggregate);
        state.updated_at = Utc::now();
        self.store.save_tenant(&state).await?;
        Ok(())
    }

    async fn transition(&self, tenant: &TenantId, to: TenantStatus) -> EngineResult<TenantState> {
        let mut state = self.tenant(tenant).await?;
        if !state.status.can_transition_to(to) {
            return Err(EngineError::tenant_transition(state.status, to));
        }
        let from = state.status;
        state.status = to;
        state.updated_at = Utc::now();
        self.store.save_tenant(&state).await?;
        tracing::info!(tenant = %tenant, from = %from, to = %to, "Tenant status changed");
        Ok(state)
    }

    // ── Basic ───────────────────────────────────────────────────────────────

    /// Registers the tenant and applies the Basic layer: `Draft -> Pending`.
    /// A tenant still in `Draft` (an earlier attempt failed) is resumed.
    pub async fn establish_tenant(
        &self,
        tenant: &TenantId,
        actor: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<ApplyResult> {
        let _guard = self.lock(tenant).await?;
        match self.store.tenant(tenant).await? {
            Some(state) if state.status != TenantStatus::Draft => {
                return Err(EngineError::TenantExists(tenant.clone()));
            }
            Some(_) => tracing::info!(tenant = %tenant, "Resuming tenant establishment"),
            None => {
                self.store.insert_tenant(&TenantState::new(tenant.clone())).await?;
                tracing::info!(tenant = %tenant, actor = actor, "Tenant registered");
            }
        }
        self.connections
            .prepare(tenant)
            .await
            .map_err(|source| EngineError::Connection { tenant: tenant.clone(), source })?;

        let units = self.catalog.units_for(UnitQuery::Basic).await?;
        let result = self.apply_locked(tenant, Layer::Basic, &units, actor, cancel).await?;
        self.transition(tenant, TenantStatus::Pending).await?;
        Ok(result)
    }

    // ── Template ────────────────────────────────────────────────────────────

    /// Validates a template request and takes the tenant lock. Nothing is
    /// changed yet.
    pub async fn prepare_template(
        &self,
        tenant: &TenantId,
        slug: &str,
        version: Option<&Version>,
        extra_modules: &[String],
    ) -> EngineResult<(LockGuard, TemplatePlan)> {
        let guard = self.lock(tenant).await?;
        let state = self.tenant(tenant).await?;

        let (template, verify_only) = match &state.template {
            Some(applied) => {
                if applied.slug != slug || version.is_some_and(|v| v != &applied.version) {
                    return Err(EngineError::TemplateLocked {
                        applied: format!("{}@{}", applied.slug, applied.version),
                        requested: match version {
                            Some(v) => format!("{slug}@{v}"),
                            None => slug.to_string(),
                        },
                    });
                }
                let template = self.catalog.recorded_template(&applied.slug, &applied.version)?;
                (template, state.status != TenantStatus::Pending)
            }
            None => {
                if state.status != TenantStatus::Pending {
                    return Err(EngineError::tenant_transition(state.status, TenantStatus::Provisioning));
                }
                (self.catalog.template(slug, version)?, false)
            }
        };

        let installed: BTreeSet<String> = state.modules.keys().cloned().collect();
        if verify_only {
            if let Some(m) = extra_modules.iter().find(|m| !installed.contains(*m)) {
                return Err(EngineError::InvalidRequest(format!(
                    "template '{slug}' is already applied; request module '{m}' through module provisioning"
                )));
            }
            return Ok((
                guard,
                TemplatePlan { tenant: tenant.clone(), template, modules: Vec::new(), verify_only },
            ));
        }

        let selected: BTreeSet<String> = template
            .required_modules
            .iter()
            .chain(extra_modules)
            .cloned()
            .collect();
        let modules = resolver::resolve(&self.catalog.definitions().modules, &selected, &installed)?;
        if let Some(m) = extra_modules.iter().find(|m| !template.allows_module(m)) {
            return Err(EngineError::IncompatibleModule {
                template: template.slug.clone(),
                module: m.clone(),
            });
        }

        tracing::info!(
            tenant = %tenant,
            template = %template.slug,
            version = %template.version,
            modules = ?modules,
            "Template plan ready"
        );
        Ok((guard, TemplatePlan { tenant: tenant.clone(), template, modules, verify_only }))
    }

    /// Runs a plan from [`Orchestrator::prepare_template`]. The caller keeps
    /// the guard alive until this returns.
    pub async fn run_template(
        &self,
        plan: &TemplatePlan,
        actor: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<ProvisioningOutcome> {
        let tenant = &plan.tenant;
        if plan.verify_only {
            return self.verify_template(plan).await;
        }

        self.transition(tenant, TenantStatus::Provisioning).await?;
        let mut calls = Vec::new();
        let run = async {
            let result = self
                .apply_locked(tenant, Layer::Template, &plan.template.units, actor, cancel)
                .await?;
            calls.push(result);

            let mut state = self.tenant(tenant).await?;
            state.template = Some(AppliedDefinition {
                slug: plan.template.slug.clone(),
                version: plan.template.version.clone(),
            });
            self.store.save_tenant(&state).await?;

            for slug in &plan.modules {
                calls.push(self.install_module(tenant, slug, actor, cancel).await?);
            }
            EngineResult::Ok(())
        }
        .await;

        if let Err(e) = run {
            if let Err(te) = self.transition(tenant, TenantStatus::Failed).await {
                tracing::error!(tenant = %tenant, "Could not mark tenant failed: {te}");
            }
            return Err(e);
        }
        let state = self.transition(tenant, TenantStatus::Active).await?;
        Ok(ProvisioningOutcome { tenant: tenant.clone(), calls, fingerprint: state.fingerprint })
    }

    /// Re-applying the recorded template executes nothing: it reports which
    /// of its units the ledger shows as applied.
    async fn verify_template(&self, plan: &TemplatePlan) -> EngineResult<ProvisioningOutcome> {
        let tenant = &plan.tenant;
        let applied = self.ledger.applied_hashes(tenant).await?;
        let mut result = ApplyResult::new(tenant.clone(), Layer::Template);
        for unit in &plan.template.units {
            if applied.contains(&unit.content_hash) {
                result.skipped.push(unit.unit_ref());
            } else {
                result.unverified.push(unit.unit_ref());
            }
        }
        if !result.unverified.is_empty() {
            tracing::warn!(
                tenant = %tenant,
                template = %plan.template.slug,
                unverified = result.unverified.len(),
                "Template units missing from the ledger"
            );
        }
        let state = self.tenant(tenant).await?;
        Ok(ProvisioningOutcome { tenant: tenant.clone(), calls: vec![result], fingerprint: state.fingerprint })
    }

    pub async fn apply_template(
        &self,
        tenant: &TenantId,
        slug: &str,
        version: Option<&Version>,
        extra_modules: &[String],
        actor: &str,
    ) -> EngineResult<ProvisioningOutcome> {
        let (_guard, plan) = self.prepare_template(tenant, slug, version, extra_modules).await?;
        self.run_template(&plan, actor, &CancellationToken::new()).await
    }

    // ── Modules ─────────────────────────────────────────────────────────────

    async fn install_module(
        &self,
        tenant: &TenantId,
        slug: &str,
        actor: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<ApplyResult> {
        let module = self.catalog.module(slug)?;
        let result = self
            .apply_locked(tenant, Layer::Module, &module.units, actor, cancel)
            .await?;
        let mut state = self.tenant(tenant).await?;
        state.modules.insert(module.slug.clone(), module.version.clone());
        self.store.save_tenant(&state).await?;
        Ok(result)
    }

    pub async fn prepare_modules(&self, tenant: &TenantId, slugs: &[String]) -> EngineResult<(LockGuard, ModulePlan)> {
        let guard = self.lock(tenant).await?;
        let state = self.tenant(tenant).await?;
        if state.status != TenantStatus::Active {
            return Err(EngineError::InvalidTransition {
                entity: "tenant",
                from: state.status.to_string(),
                to: "module provisioning (requires active)".into(),
            });
        }

        let selected: BTreeSet<String> = slugs.iter().cloned().collect();
        let installed: BTreeSet<String> = state.modules.keys().cloned().collect();
        let modules = resolver::resolve(&self.catalog.definitions().modules, &selected, &installed)?;

        if let Some(applied) = &state.template {
            let template = self.catalog.recorded_template(&applied.slug, &applied.version)?;
            if let Some(m) = slugs.iter().find(|m| !template.allows_module(m)) {
                return Err(EngineError::IncompatibleModule {
                    template: template.slug.clone(),
                    module: m.clone(),
                });
            }
        }
        Ok((guard, ModulePlan { tenant: tenant.clone(), modules }))
    }

    /// One `apply` call per module. A failure leaves modules installed by
    /// earlier calls in place.
    pub async fn run_modules(
        &self,
        plan: &ModulePlan,
        actor: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<ProvisioningOutcome> {
        let mut calls = Vec::new();
        for slug in &plan.modules {
            calls.push(self.install_module(&plan.tenant, slug, actor, cancel).await?);
        }
        let state = self.tenant(&plan.tenant).await?;
        Ok(ProvisioningOutcome { tenant: plan.tenant.clone(), calls, fingerprint: state.fingerprint })
    }

    pub async fn apply_modules(&self, tenant: &TenantId, slugs: &[String], actor: &str) -> EngineResult<ProvisioningOutcome> {
        let (_guard, plan) = self.prepare_modules(tenant, slugs).await?;
        self.run_modules(&plan, actor, &CancellationToken::new()).await
    }

    // ── Custom ──────────────────────────────────────────────────────────────

    /// Picks the named request, or the oldest approved one.
    pub async fn prepare_custom(&self, tenant: &TenantId, request: Option<Uuid>) -> EngineResult<(LockGuard, CustomPlan)> {
        let guard = self.lock(tenant).await?;
        let plan = self.custom_plan(tenant, request).await?;
        Ok((guard, plan))
    }

    pub(crate) async fn custom_plan(&self, tenant: &TenantId, request: Option<Uuid>) -> EngineResult<CustomPlan> {
        let state = self.tenant(tenant).await?;
        if state.status != TenantStatus::Active {
            return Err(EngineError::InvalidTransition {
                entity: "tenant",
                from: state.status.to_string(),
                to: "custom migration (requires active)".into(),
            });
        }
        let request = match request {
            Some(id) => {
                let request = self
                    .store
                    .custom_request(id)
                    .await?
                    .filter(|r| &r.tenant == tenant)
                    .ok_or(EngineError::UnknownRequest(id))?;
                custom::transition(&request, CustomStatus::Applied)?;
                request
            }
            None => self
                .store
                .custom_requests(tenant, Some(CustomStatus::Approved))
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| EngineError::InvalidRequest(format!("tenant '{tenant}' has no approved custom migration")))?,
        };
        Ok(CustomPlan { tenant: tenant.clone(), request })
    }

    pub async fn run_custom(&self, plan: &CustomPlan, actor: &str, cancel: &CancellationToken) -> EngineResult<ApplyResult> {
        let unit = plan.request.to_unit();
        let result = self
            .apply_locked(&plan.tenant, Layer::Custom, std::slice::from_ref(&unit), actor, cancel)
            .await?;

        let mut request = plan.request.clone();
        request.status = CustomStatus::Applied;
        request.applied_at = Some(Utc::now());
        self.store.save_custom_request(&request).await?;
        tracing::info!(tenant = %plan.tenant, request = %request.id, "Custom migration applied");
        Ok(result)
    }

    pub async fn apply_custom(&self, tenant: &TenantId, request: Option<Uuid>, actor: &str) -> EngineResult<ApplyResult> {
        let (_guard, plan) = self.prepare_custom(tenant, request).await?;
        self.run_custom(&plan, actor, &CancellationToken::new()).await
    }

    /// Runs the reverse operation of an applied request: `Applied -> RolledBack`.
    pub async fn rollback_custom(&self, id: Uuid, actor: &str) -> EngineResult<RollbackReport> {
        let request = self
            .store
            .custom_request(id)
            .await?
            .ok_or(EngineError::UnknownRequest(id))?;
        let tenant = request.tenant.clone();
        let _guard = self.lock(&tenant).await?;

        let mut request = self
            .store
            .custom_request(id)
            .await?
            .ok_or(EngineError::UnknownRequest(id))?;
        custom::transition(&request, CustomStatus::RolledBack)?;
        let reverse = request
            .reverse
            .clone()
            .ok_or_else(|| EngineError::InvalidRequest(format!("custom migration {id} has no reverse operation")))?;

        let unit = request.to_unit();
        let started = Instant::now();
        let status = self.run_reverse(&tenant, &reverse).await;
        let ms = elapsed_ms(started);

        if let RollbackStatus::Failed { error } = &status {
            let mut unrecorded = None;
            let entry = NewAuditEntry::for_unit(&tenant, &unit, Direction::Reverse, AuditOutcome::Failed, actor)
                .took(ms)
                .with_error(error.clone());
            if let Err(e) = self.ledger.record(entry).await {
                tracing::error!(tenant = %tenant, request = %id, "Failed rollback not recorded: {e}");
                unrecorded = Some(e.to_string());
            }
            UNITS_COUNTER.with_label_values(&[Layer::Custom.as_str(), "rollback_failed"]).inc();
            return Err(EngineError::ProvisioningFailed(Box::new(ProvisioningFailure {
                tenant: tenant.clone(),
                layer: Layer::Custom,
                failed_unit: unit.unit_ref(),
                cause: FailureCause::Execution { error: error.clone() },
                rollbacks: Vec::new(),
                unrecorded,
            })));
        }

        let entry = NewAuditEntry::for_unit(&tenant, &unit, Direction::Reverse, AuditOutcome::RolledBack, actor).took(ms);
        self.ledger.record(entry).await?;
        UNITS_COUNTER.with_label_values(&[Layer::Custom.as_str(), "rolled_back"]).inc();

        request.status = CustomStatus::RolledBack;
        request.rolled_back_at = Some(Utc::now());
        self.store.save_custom_request(&request).await?;
        self.refresh_baseline(&tenant, &[&reverse]).await;
        tracing::info!(tenant = %tenant, request = %id, actor = actor, "Custom migration rolled back");

        Ok(RollbackReport { unit: unit.unit_ref(), status })
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    async fn set_status(&self, tenant: &TenantId, from: Option<TenantStatus>, to: TenantStatus) -> EngineResult<TenantState> {
        let _guard = self.lock(tenant).await?;
        let state = self.tenant(tenant).await?;
        if from.is_some_and(|f| f != state.status) {
            return Err(EngineError::tenant_transition(state.status, to));
        }
        self.transition(tenant, to).await
    }

    /// `Failed -> Pending`, so the template can be applied again.
    pub async fn retry(&self, tenant: &TenantId) -> EngineResult<TenantState> {
        self.set_status(tenant, Some(TenantStatus::Failed), TenantStatus::Pending).await
    }

    pub async fn suspend(&self, tenant: &TenantId) -> EngineResult<TenantState> {
        self.set_status(tenant, Some(TenantStatus::Active), TenantStatus::Suspended).await
    }

    pub async fn resume(&self, tenant: &TenantId) -> EngineResult<TenantState> {
        self.set_status(tenant, Some(TenantStatus::Suspended), TenantStatus::Active).await
    }

    pub async fn archive(&self, tenant: &TenantId) -> EngineResult<TenantState> {
        self.set_status(tenant, None, TenantStatus::Archived).await
    }
}
