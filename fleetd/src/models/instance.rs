//! Instance model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::manifest::Manifest;
use crate::errors::FleetError;

/// Provider backing an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentType {
    /// Docker on the control-plane host
    Local,
    /// Self-hosted Docker, possibly on a remote host
    Docker,
    /// Container service on EC2 capacity
    EcsEc2,
    /// Compute Engine VM running a container
    Gce,
    /// Azure virtual machine
    AzureVm,
}

impl DeploymentType {
    pub const ALL: [DeploymentType; 5] = [
        DeploymentType::Local,
        DeploymentType::Docker,
        DeploymentType::EcsEc2,
        DeploymentType::Gce,
        DeploymentType::AzureVm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentType::Local => "LOCAL",
            DeploymentType::Docker => "DOCKER",
            DeploymentType::EcsEc2 => "ECS_EC2",
            DeploymentType::Gce => "GCE",
            DeploymentType::AzureVm => "AZURE_VM",
        }
    }

    /// Resolve an optional type; absent means LOCAL
    pub fn or_default(value: Option<DeploymentType>) -> DeploymentType {
        value.unwrap_or(DeploymentType::Local)
    }
}

impl fmt::Display for DeploymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentType {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "LOCAL" => Ok(DeploymentType::Local),
            "DOCKER" => Ok(DeploymentType::Docker),
            "ECS_EC2" | "ECS" => Ok(DeploymentType::EcsEc2),
            "GCE" => Ok(DeploymentType::Gce),
            "AZURE_VM" | "AZURE" => Ok(DeploymentType::AzureVm),
            other => Err(FleetError::ValidationError(format!(
                "Unknown deployment type: {}",
                other
            ))),
        }
    }
}

/// Lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Creating,
    Pending,
    Running,
    Degraded,
    Paused,
    Draining,
    Reconciling,
    Error,
    Deleting,
}

impl InstanceStatus {
    /// States that block a new reconciliation from being queued
    pub fn is_guarded(&self) -> bool {
        matches!(self, InstanceStatus::Reconciling | InstanceStatus::Creating)
    }

    /// States in which the workload is expected to be up
    pub fn is_active(&self) -> bool {
        matches!(self, InstanceStatus::Running | InstanceStatus::Degraded)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Creating => "CREATING",
            InstanceStatus::Pending => "PENDING",
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Degraded => "DEGRADED",
            InstanceStatus::Paused => "PAUSED",
            InstanceStatus::Draining => "DRAINING",
            InstanceStatus::Reconciling => "RECONCILING",
            InstanceStatus::Error => "ERROR",
            InstanceStatus::Deleting => "DELETING",
        };
        f.write_str(s)
    }
}

/// Health, tracked independently of status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

/// A deployed bot workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub workspace_id: String,

    /// Instances sharing a fleet are promoted and rolled out together
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fleet_id: Option<String>,

    /// Raw desired manifest document
    pub desired_manifest: String,

    /// Incremented on every desired manifest change
    #[serde(default)]
    pub manifest_version: u64,

    /// Digest of the last manifest successfully applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_manifest_digest: Option<String>,

    pub status: InstanceStatus,

    #[serde(default)]
    pub health: HealthStatus,

    #[serde(default)]
    pub deployment_type: Option<DeploymentType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_target_id: Option<String>,

    /// Fallback source of cloud configuration
    #[serde(default)]
    pub metadata: serde_json::Value,

    /// Provider-side resource id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    pub status_changed_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    /// New instance created on first deploy request
    pub fn new(
        name: impl Into<String>,
        workspace_id: impl Into<String>,
        manifest: &Manifest,
        deployment_type: Option<DeploymentType>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: crate::utils::generate_uuid(),
            name: name.into(),
            workspace_id: workspace_id.into(),
            fleet_id: None,
            desired_manifest: manifest.to_json(),
            manifest_version: 1,
            applied_manifest_digest: None,
            status: InstanceStatus::Pending,
            health: HealthStatus::Unknown,
            deployment_type,
            deployment_target_id: None,
            metadata: serde_json::Value::Null,
            container_id: None,
            last_error: None,
            status_changed_at: now,
            last_reconciled_at: None,
            last_health_check_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn deployment_type(&self) -> DeploymentType {
        DeploymentType::or_default(self.deployment_type)
    }

    pub fn manifest(&self) -> Result<Manifest, FleetError> {
        Manifest::parse(&self.desired_manifest)
    }

    /// Replace the desired manifest and bump its version
    pub fn set_manifest(&mut self, manifest: &Manifest) {
        self.desired_manifest = manifest.to_json();
        self.manifest_version += 1;
        self.updated_at = Utc::now();
    }

    /// Set status and stamp the change time
    pub fn set_status(&mut self, status: InstanceStatus) {
        if self.status != status {
            self.status = status;
            self.status_changed_at = Utc::now();
        }
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployment_type_default_is_local() {
        assert_eq!(DeploymentType::or_default(None), DeploymentType::Local);
        let json = r#"{
            "id": "i-1", "name": "bot", "workspaceId": "ws",
            "desiredManifest": "{}", "status": "PENDING", "deploymentType": null,
            "statusChangedAt": "2026-01-01T00:00:00Z",
            "createdAt": "2026-01-01T00:00:00Z", "updatedAt": "2026-01-01T00:00:00Z"
        }"#;
        let instance: Instance = serde_json::from_str(json).unwrap();
        assert_eq!(instance.deployment_type(), DeploymentType::Local);
        assert_eq!(instance.health, HealthStatus::Unknown);
    }

    #[test]
    fn test_parse_deployment_type() {
        assert_eq!("ecs-ec2".parse::<DeploymentType>().unwrap(), DeploymentType::EcsEc2);
        assert!("mainframe".parse::<DeploymentType>().is_err());
    }
}
