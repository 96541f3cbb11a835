use std::sync::Arc;

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, GaugeVec, HistogramVec,
};
use tracing::{info, warn};

use crate::models::tenant::TenantStatus;
use crate::services::store::ControlStore;

lazy_static! {
    // ── Provisioning ────────────────────────────────────────────────────────
    pub static ref UNITS_COUNTER: CounterVec = register_counter_vec!(
        "provisioning_units_total",
        "Migration units processed, by layer and outcome",
        &["layer", "outcome"]
    ).unwrap();

    pub static ref UNIT_DURATION: HistogramVec = register_histogram_vec!(
        "provisioning_unit_duration_seconds",
        "Forward execution time of a migration unit",
        &["layer"]
    ).unwrap();

    pub static ref APPLY_COUNTER: CounterVec = register_counter_vec!(
        "provisioning_apply_total",
        "apply calls by layer and result",
        &["layer", "result"]
    ).unwrap();

    // ── Tenants ─────────────────────────────────────────────────────────────
    pub static ref DRIFT_SCORE: GaugeVec = register_gauge_vec!(
        "tenant_drift_score",
        "Weighted drift score of the last check",
        &["tenant"]
    ).unwrap();

    pub static ref TENANTS_GAUGE: GaugeVec = register_gauge_vec!(
        "tenants_by_status",
        "Tenants per provisioning status",
        &["status"]
    ).unwrap();
}

/// Spawn the background collector (refreshes every 5 minutes).
pub fn start(store: Arc<dyn ControlStore>) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = collect(store.as_ref()).await {
                warn!("Metrics: collection failed: {}", e);
            }
            tokio::time::sleep(tokio::time::Duration::from_secs(300)).await;
        }
    });
}

async fn collect(store: &dyn ControlStore) -> anyhow::Result<()> {
    let tenants = store.list_tenants().await?;
    for status in TenantStatus::ALL {
        let count = tenants.iter().filter(|t| t.status == status).count();
        TENANTS_GAUGE.with_label_values(&[status.as_str()]).set(count as f64);
    }
    info!("Metrics: collected for {} tenant(s)", tenants.len());
    Ok(())
}
