//! Deployment targets and cloud configuration resolution

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::instance::{DeploymentType, Instance};

/// A named provider configuration an instance can reference. Read-only to
/// the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentTarget {
    pub id: String,
    pub name: String,
    pub provider: DeploymentType,
    /// Opaque provider-specific configuration
    #[serde(default)]
    pub config: Value,
    pub created_at: DateTime<Utc>,
}

/// Where a cloud configuration was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    Target,
    Metadata,
    Defaults,
}

pub const DEFAULT_AWS_REGION: &str = "us-east-1";
pub const DEFAULT_GCP_ZONE: &str = "us-central1-a";
pub const DEFAULT_AZURE_LOCATION: &str = "eastus";
pub const DEFAULT_AZURE_RESOURCE_GROUP: &str = "fleet-rg";
pub const DEFAULT_AZURE_VAULT: &str = "fleet-vault";

/// Provider placement and credential references for one instance. Every
/// field is optional; accessors fall back to provider defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CloudConfig {
    pub source: Option<ConfigSource>,
    pub region: Option<String>,
    pub project_id: Option<String>,
    pub zone: Option<String>,
    pub key_file: Option<String>,
    pub subscription_id: Option<String>,
    pub resource_group: Option<String>,
    pub vault_name: Option<String>,
    pub location: Option<String>,
    pub docker_host: Option<String>,
    pub cluster: Option<String>,
    pub machine_type: Option<String>,
}

/// First string value found under any of `keys`
fn read_str(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| value.get(*k))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

impl CloudConfig {
    /// Read fields defensively from an opaque blob. Unknown shapes yield an
    /// empty config rather than an error.
    pub fn from_value(value: &Value, source: ConfigSource) -> Self {
        // Metadata blobs sometimes nest the config under "cloud"
        let value = value.get("cloud").filter(|v| v.is_object()).unwrap_or(value);
        Self {
            source: Some(source),
            region: read_str(value, &["region", "awsRegion", "aws_region"]),
            project_id: read_str(value, &["projectId", "project_id", "gcpProjectId"]),
            zone: read_str(value, &["zone", "gcpZone"]),
            key_file: read_str(value, &["keyFile", "key_file", "keyPath", "key_path", "credentialsPath"]),
            subscription_id: read_str(value, &["subscriptionId", "subscription_id"]),
            resource_group: read_str(value, &["resourceGroup", "resource_group"]),
            vault_name: read_str(value, &["vaultName", "vault_name", "keyVaultName"]),
            location: read_str(value, &["location", "azureLocation"]),
            docker_host: read_str(value, &["dockerHost", "docker_host", "host"]),
            cluster: read_str(value, &["cluster", "clusterName"]),
            machine_type: read_str(value, &["machineType", "machine_type", "instanceType", "vmSize"]),
        }
    }

    /// The linked target wins; instance metadata is consulted only when no
    /// target is linked.
    pub fn resolve(instance: &Instance, target: Option<&DeploymentTarget>) -> Self {
        if let Some(target) = target {
            return Self::from_value(&target.config, ConfigSource::Target);
        }
        if instance.metadata.is_object() {
            return Self::from_value(&instance.metadata, ConfigSource::Metadata);
        }
        Self {
            source: Some(ConfigSource::Defaults),
            ..Default::default()
        }
    }

    pub fn region(&self) -> &str {
        self.region.as_deref().unwrap_or(DEFAULT_AWS_REGION)
    }

    pub fn zone(&self) -> &str {
        self.zone.as_deref().unwrap_or(DEFAULT_GCP_ZONE)
    }

    pub fn location(&self) -> &str {
        self.location.as_deref().unwrap_or(DEFAULT_AZURE_LOCATION)
    }

    pub fn resource_group(&self) -> &str {
        self.resource_group
            .as_deref()
            .unwrap_or(DEFAULT_AZURE_RESOURCE_GROUP)
    }

    pub fn vault_name(&self) -> &str {
        self.vault_name.as_deref().unwrap_or(DEFAULT_AZURE_VAULT)
    }
}
