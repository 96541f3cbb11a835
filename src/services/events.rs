use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;

use crate::models::drift::Severity;
use crate::models::migration::Layer;
use crate::models::tenant::TenantId;

/// Lifecycle events fired by the orchestrator and the drift detector.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvisioningEvent {
    ProvisioningStarted {
        tenant: TenantId,
        layer: Layer,
        units: usize,
        actor: String,
    },
    ProvisioningProgress {
        tenant: TenantId,
        layer: Layer,
        unit: String,
        index: usize,
        total: usize,
    },
    ProvisioningCompleted {
        tenant: TenantId,
        layer: Layer,
        applied: usize,
        skipped: usize,
        duration_ms: u64,
    },
    ProvisioningFailed {
        tenant: TenantId,
        layer: Layer,
        failed_unit: String,
        cause: String,
    },
    DriftDetected {
        tenant: TenantId,
        severity: Severity,
        score: u32,
        tables: usize,
    },
}

impl ProvisioningEvent {
    pub fn tenant(&self) -> &TenantId {
        match self {
            ProvisioningEvent::ProvisioningStarted { tenant, .. }
            | ProvisioningEvent::ProvisioningProgress { tenant, .. }
            | ProvisioningEvent::ProvisioningCompleted { tenant, .. }
            | ProvisioningEvent::ProvisioningFailed { tenant, .. }
            | ProvisioningEvent::DriftDetected { tenant, .. } => tenant,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProvisioningEvent::ProvisioningStarted { .. } => "provisioning_started",
            ProvisioningEvent::ProvisioningProgress { .. } => "provisioning_progress",
            ProvisioningEvent::ProvisioningCompleted { .. } => "provisioning_completed",
            ProvisioningEvent::ProvisioningFailed { .. } => "provisioning_failed",
            ProvisioningEvent::DriftDetected { .. } => "drift_detected",
        }
    }
}

/// Receives events. Delivery problems stay inside the sink.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: ProvisioningEvent);
}

pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn publish(&self, event: ProvisioningEvent) {
        tracing::info!(tenant = %event.tenant(), event = event.name(), "{event:?}");
    }
}

/// POSTs every event as JSON to a webhook. Fire-and-forget: a slow or failing
/// receiver never delays provisioning.
pub struct WebhookEventSink {
    client: Client,
    url: String,
}

impl WebhookEventSink {
    pub fn new(url: String) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }
}

#[async_trait]
impl EventSink for WebhookEventSink {
    async fn publish(&self, event: ProvisioningEvent) {
        tracing::info!(tenant = %event.tenant(), event = event.name(), "Publishing event");
        let client = self.client.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            match client.post(&url).json(&event).send().await {
                Ok(response) if !response.status().is_success() => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    tracing::warn!("Event webhook error {}: {}", status, text);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Event webhook unreachable: {e}"),
            }
        });
    }
}

/// Keeps events in memory, for dry runs and tests.
#[derive(Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<ProvisioningEvent>>,
}

impl CollectingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProvisioningEvent> {
        self.events.lock().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(ProvisioningEvent::name).collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn publish(&self, event: ProvisioningEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_a_tag() {
        let event = ProvisioningEvent::DriftDetected {
            tenant: TenantId::parse("T1").unwrap(),
            severity: Severity::Critical,
            score: 10,
            tables: 1,
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["event"], "drift_detected");
        assert_eq!(v["severity"], "critical");
        assert_eq!(v["tenant"], "t1");
    }
}
