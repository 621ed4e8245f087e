//! Platform API models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A row in the platform record store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordEnvelope {
    pub id: String,
    pub revision: u64,
    pub data: serde_json::Value,
}

/// Record list response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordListResponse {
    pub records: Vec<RecordEnvelope>,
}

/// Record write request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordWriteRequest {
    pub data: serde_json::Value,
}

/// Audit event delivered to the platform audit sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEventPayload {
    pub id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_summary: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}
