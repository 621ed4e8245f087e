//! Audit API client

use openapi_client::AuditEventPayload;

use crate::errors::FleetError;
use crate::http::client::HttpClient;

impl HttpClient {
    /// Deliver one audit event
    pub async fn send_audit_event(&self, event: &AuditEventPayload) -> Result<(), FleetError> {
        let _: serde_json::Value = self.post("/audit/events", event).await?;
        Ok(())
    }
}
