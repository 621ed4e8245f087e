//! fleetd API models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// User-visible failure. Never carries a raw provider exception.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

// ============================== PROVISIONING ================================ //

/// Status of a single provisioning step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Error,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Error | StepStatus::Skipped)
    }

    /// Whether a step may move from `self` to `next`
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (StepStatus::Pending, StepStatus::InProgress)
                | (StepStatus::Pending, StepStatus::Skipped)
                | (StepStatus::InProgress, StepStatus::Completed)
                | (StepStatus::InProgress, StepStatus::Error)
                | (StepStatus::InProgress, StepStatus::Skipped)
        )
    }
}

/// Overall provisioning status. `Unknown` is only used by the polling
/// endpoint when no record exists yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    InProgress,
    Completed,
    Error,
    Timeout,
    Unknown,
}

impl ProgressStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressStatus::Completed | ProgressStatus::Error | ProgressStatus::Timeout
        )
    }
}

/// A provisioning step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressStep {
    pub id: String,
    pub label: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressStep {
    pub fn pending(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            message: None,
        }
    }
}

/// Full provisioning snapshot for one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningProgress {
    pub instance_id: String,
    pub status: ProgressStatus,
    #[serde(default)]
    pub steps: Vec<ProgressStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProvisioningProgress {
    /// Sentinel returned when no record exists for the instance
    pub fn unknown(instance_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.into(),
            status: ProgressStatus::Unknown,
            steps: Vec::new(),
            current_step: None,
            error: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Terminal record synthesized by a consumer that lost its server
    pub fn lost_connection(instance_id: impl Into<String>) -> Self {
        let mut progress = Self::unknown(instance_id);
        progress.status = ProgressStatus::Error;
        progress.error = Some("Lost connection to provisioning server".to_string());
        progress.completed_at = Some(progress.updated_at);
        progress
    }
}

/// Output stream of a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One provisioning log line, tagged by the step that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningLogLine {
    pub instance_id: String,
    pub seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub stream: LogStream,
    pub line: String,
    pub timestamp: DateTime<Utc>,
}

/// Events sent by a push-channel client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    Subscribe {
        #[serde(rename = "instanceId")]
        instance_id: String,
    },
    Unsubscribe {
        #[serde(rename = "instanceId")]
        instance_id: String,
    },
}

/// Events sent by the push-channel server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Full snapshot
    Progress(ProvisioningProgress),
    /// Single live log line
    ProvisioningLog(ProvisioningLogLine),
    /// Backlog replayed on subscribe
    ProvisioningLogsBuffer {
        #[serde(rename = "instanceId")]
        instance_id: String,
        logs: Vec<ProvisioningLogLine>,
    },
    /// Subscription acknowledged
    Subscribed {
        #[serde(rename = "instanceId")]
        instance_id: String,
    },
    Error(ErrorResponse),
}

// ============================== INSTANCES =================================== //

/// Register an instance for deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceRequest {
    pub name: String,
    /// Defaults to the daemon's workspace
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub fleet_id: Option<String>,
    /// Desired manifest document
    pub manifest: serde_json::Value,
    /// LOCAL when absent
    #[serde(default)]
    pub deployment_type: Option<String>,
    #[serde(default)]
    pub deployment_target_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub actor: Option<String>,
}

/// Optional body of instance lifecycle requests
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActorRequest {
    #[serde(default)]
    pub actor: Option<String>,
}

/// Query of a workload log read
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogsQuery {
    /// Most recent lines to return
    #[serde(default)]
    pub tail: Option<usize>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
}

// ============================== RECONCILER ================================== //

/// Outcome of a bulk reconcile request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileAllResponse {
    pub queued: Vec<String>,
    pub skipped: Vec<String>,
}

/// Outcome of a single reconcile request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileDisposition {
    Queued,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResponse {
    pub instance_id: String,
    pub disposition: ReconcileDisposition,
}

/// Promotion request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoteRequest {
    pub target_environment: String,
    #[serde(default)]
    pub actor: Option<String>,
}

/// Promotion outcome
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionResponse {
    pub from_environment: String,
    pub to_environment: String,
    pub promoted: u32,
    pub reconciling: u32,
    pub skipped: u32,
    /// Instances whose record could not be written
    pub failed: u32,
}

// =============================== ROLLOUTS =================================== //

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChangeSetRequest {
    pub instance_id: String,
    /// Target manifest document
    pub to_manifest: serde_json::Value,
    #[serde(default = "default_strategy")]
    pub rollout_strategy: String,
    #[serde(default)]
    pub rollout_percentage: Option<u32>,
    #[serde(default)]
    pub canary_instances: Option<Vec<String>>,
    /// Overrides the instance count derived from the strategy
    #[serde(default)]
    pub total_instances: Option<u32>,
    #[serde(default)]
    pub actor: Option<String>,
}

fn default_strategy() -> String {
    "ALL".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdateRequest {
    #[serde(default)]
    pub updated: u32,
    #[serde(default)]
    pub failed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRequest {
    pub reason: String,
    #[serde(default)]
    pub actor: Option<String>,
}

/// Secret write request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretWriteRequest {
    pub value: String,
}

/// Secret descriptor (never includes the value)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretDescriptor {
    pub instance_id: String,
    pub key: String,
    pub backend: String,
}

/// Secret read response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretValueResponse {
    pub instance_id: String,
    pub key: String,
    pub value: String,
}
