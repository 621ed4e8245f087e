//! Audit sink implementations

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use openapi_client::AuditEventPayload;
use tracing::info;

use crate::audit::AuditSink;
use crate::errors::FleetError;
use crate::http::HttpClient;

/// Writes audit events to the log under the `audit` target
#[derive(Default)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn write(&self, event: AuditEventPayload) -> Result<(), FleetError> {
        info!(
            target: "audit",
            action = %event.action,
            resource_type = %event.resource_type,
            resource_id = %event.resource_id,
            actor = %event.actor,
            diff = event.diff_summary.as_deref().unwrap_or(""),
            "audit event"
        );
        Ok(())
    }
}

/// Keeps audit events in memory
#[derive(Default)]
pub struct MemoryAuditSink {
    events: RwLock<Vec<AuditEventPayload>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEventPayload> {
        self.events.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Events with the given action
    pub fn with_action(&self, action: &str) -> Vec<AuditEventPayload> {
        self.events()
            .into_iter()
            .filter(|e| e.action == action)
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn write(&self, event: AuditEventPayload) -> Result<(), FleetError> {
        self.events
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
        Ok(())
    }
}

/// Posts audit events to the platform audit API
pub struct HttpAuditSink {
    client: Arc<HttpClient>,
}

impl HttpAuditSink {
    pub fn new(client: Arc<HttpClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AuditSink for HttpAuditSink {
    async fn write(&self, event: AuditEventPayload) -> Result<(), FleetError> {
        self.client.send_audit_event(&event).await
    }
}
