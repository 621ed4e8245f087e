//! Audit trail
//!
//! Every state transition emits an [`AuditEvent`] to the configured sink.
//! Delivery failures are logged and never change the outcome of the
//! operation that produced the event.

pub mod sinks;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use openapi_client::AuditEventPayload;
use serde_json::Value;
use tracing::warn;

use crate::errors::FleetError;

pub use sinks::{HttpAuditSink, LogAuditSink, MemoryAuditSink};

/// Actor recorded for transitions fleetd performs on its own
pub const SYSTEM_ACTOR: &str = "system:fleetd";

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub actor: String,
    pub diff_summary: Option<String>,
    pub metadata: Value,
}

impl AuditEvent {
    pub fn new(action: &str, resource_type: &str, resource_id: &str) -> Self {
        Self {
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            actor: SYSTEM_ACTOR.to_string(),
            diff_summary: None,
            metadata: Value::Null,
        }
    }

    pub fn actor(mut self, actor: Option<&str>) -> Self {
        if let Some(actor) = actor {
            self.actor = actor.to_string();
        }
        self
    }

    pub fn diff(mut self, summary: impl Into<String>) -> Self {
        self.diff_summary = Some(summary.into());
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Wire form for the platform audit endpoint
    pub fn into_payload(self) -> AuditEventPayload {
        AuditEventPayload {
            id: crate::utils::generate_uuid(),
            action: self.action,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            actor: self.actor,
            diff_summary: self.diff_summary,
            metadata: self.metadata,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, event: AuditEventPayload) -> Result<(), FleetError>;
}

/// Front door used by the reconciler and rollout orchestrator
#[derive(Clone)]
pub struct Auditor {
    sink: Arc<dyn AuditSink>,
}

impl Auditor {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Deliver an event. Sink failures are logged, never returned
    pub async fn record(&self, event: AuditEvent) {
        let payload = event.into_payload();
        let action = payload.action.clone();
        let resource_id = payload.resource_id.clone();
        if let Err(e) = self.sink.write(payload).await {
            warn!(
                action = %action,
                resource_id = %resource_id,
                "Failed to deliver audit event: {}",
                e
            );
        }
    }
}
