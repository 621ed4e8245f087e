//! Provider contract and registry
//!
//! Every backend fleetd can deploy to implements [`Provider`]. The registry
//! maps an instance's deployment type to a fresh, uninitialized provider.

pub mod azure;
pub mod cli;
pub mod command;
pub mod docker;
pub mod ecs;
pub mod gce;
pub mod registry;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::errors::FleetError;
use crate::models::{CloudConfig, Instance, Manifest};
use crate::retry::naming::{INSTANCE_LABEL, MANAGED_BY_KEY, MANAGED_BY_VALUE, WORKSPACE_LABEL};
use crate::retry::{RetryOptions, StepTracker};

pub use command::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner, ScriptedRunner};
pub use registry::ProviderRegistry;

/// Binding of a provider to a workspace and placement
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub workspace: String,
    pub cloud: CloudConfig,
    pub retry: RetryOptions,
    /// Interval and deadline for waiting on remote state changes
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

impl ProviderConfig {
    pub fn new(workspace: impl Into<String>, cloud: CloudConfig) -> Self {
        Self {
            workspace: workspace.into(),
            cloud,
            retry: RetryOptions::default(),
            poll_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn from_checks(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapOptions {
    pub workspace: String,
    pub log_retention_days: u32,
}

/// Where a secret attached to a container comes from
#[derive(Debug)]
pub enum SecretSource {
    /// Plain value, injected without passing through argv
    Value(SecretString),
    /// Identifier in the provider's own secret store
    Reference(String),
}

impl Clone for SecretSource {
    fn clone(&self) -> Self {
        match self {
            SecretSource::Value(v) => SecretSource::Value(SecretString::from(v.expose_secret().to_string())),
            SecretSource::Reference(r) => SecretSource::Reference(r.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecretBinding {
    pub key: String,
    /// Environment variable exposed to the workload
    pub env_name: String,
    pub source: SecretSource,
}

impl SecretBinding {
    pub fn env_name_for(key: &str) -> String {
        key.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect()
    }
}

/// Everything a provider needs to create one workload
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub instance_id: String,
    pub instance_name: String,
    pub workspace: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub secrets: Vec<SecretBinding>,
    pub cpus: Option<f64>,
    pub memory_mb: Option<u64>,
    pub ports: Vec<u16>,
    pub labels: BTreeMap<String, String>,
}

impl ContainerConfig {
    /// Build from an instance and its preprocessed manifest. The manifest's
    /// `runtime.image` wins over `default_image`.
    pub fn from_manifest(
        instance: &Instance,
        manifest: &Manifest,
        workspace: &str,
        default_image: &str,
    ) -> Self {
        let resources = manifest.resources();
        let ports = manifest
            .get_path(&["runtime", "ports"])
            .and_then(|v| v.as_array())
            .map(|ports| {
                ports
                    .iter()
                    .filter_map(|p| p.as_u64())
                    .filter_map(|p| u16::try_from(p).ok())
                    .collect()
            })
            .unwrap_or_default();

        let mut env = manifest.env();
        env.insert("FLEET_INSTANCE_ID".to_string(), instance.id.clone());
        env.insert("FLEET_MANIFEST_DIGEST".to_string(), manifest.digest());
        if let Some(environment) = manifest.environment() {
            env.insert("FLEET_ENVIRONMENT".to_string(), environment.to_string());
        }

        Self {
            instance_id: instance.id.clone(),
            instance_name: instance.name.clone(),
            workspace: workspace.to_string(),
            image: manifest.image().unwrap_or(default_image).to_string(),
            env,
            secrets: Vec::new(),
            cpus: resources.cpus,
            memory_mb: resources.memory_mb,
            ports,
            labels: managed_labels(workspace, &instance.id),
        }
    }
}

/// Labels every fleetd-created resource carries
pub fn managed_labels(workspace: &str, instance_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_KEY.to_string(), MANAGED_BY_VALUE.to_string()),
        (WORKSPACE_LABEL.to_string(), workspace.to_string()),
        (INSTANCE_LABEL.to_string(), instance_id.to_string()),
    ])
}

/// Partial configuration for an update. Absent fields keep their current
/// value where the provider can read it back.
#[derive(Debug, Default)]
pub struct ContainerUpdate {
    pub image: Option<String>,
    pub env: Option<BTreeMap<String, String>>,
    pub secrets: Option<Vec<SecretBinding>>,
    pub cpus: Option<f64>,
    pub memory_mb: Option<u64>,
    pub ports: Option<Vec<u16>>,
}

impl ContainerUpdate {
    /// An update converging every field to `config`
    pub fn from_config(config: ContainerConfig) -> Self {
        Self {
            image: Some(config.image),
            env: Some(config.env),
            secrets: Some(config.secrets),
            cpus: config.cpus,
            memory_mb: config.memory_mb,
            ports: Some(config.ports),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Running,
    Starting,
    Stopped,
    Failed,
    Unknown,
}

/// Observed state of a provider resource
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerSnapshot {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub status: ContainerStatus,
    pub image: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
    pub address: Option<String>,
}

impl ContainerSnapshot {
    pub fn instance_id(&self) -> Option<&str> {
        self.labels.get(INSTANCE_LABEL).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilters {
    pub workspace: Option<String>,
    pub instance_id: Option<String>,
}

impl ContainerFilters {
    /// Label pairs every listed resource must carry
    pub fn label_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![(MANAGED_BY_KEY, MANAGED_BY_VALUE.to_string())];
        if let Some(workspace) = &self.workspace {
            pairs.push((WORKSPACE_LABEL, workspace.clone()));
        }
        if let Some(instance_id) = &self.instance_id {
            pairs.push((INSTANCE_LABEL, instance_id.clone()));
        }
        pairs
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.label_pairs()
            .iter()
            .all(|(key, value)| labels.get(*key) == Some(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub tail: usize,
    pub since: Option<DateTime<Utc>>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            tail: 200,
            since: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    pub timestamp: Option<DateTime<Utc>>,
    pub message: String,
}

/// Uniform lifecycle over one provider's SDK or CLI
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short provider name used in logs and errors
    fn name(&self) -> &'static str;

    /// Bind to a workspace and placement; no I/O
    fn initialize(&mut self, config: ProviderConfig);

    /// Check credentials and tooling without mutating remote state
    async fn validate(&self) -> ValidationResult;

    /// Provision shared prerequisites; safe to repeat
    async fn bootstrap(
        &self,
        options: &BootstrapOptions,
        tracker: &StepTracker,
    ) -> Result<(), FleetError>;

    async fn deploy_container(
        &self,
        config: &ContainerConfig,
        manifest: &Manifest,
    ) -> Result<ContainerSnapshot, FleetError>;

    async fn update_container(
        &self,
        id: &str,
        update: &ContainerUpdate,
    ) -> Result<ContainerSnapshot, FleetError>;

    async fn start_container(&self, id: &str) -> Result<(), FleetError>;

    /// Succeeds when the resource is already stopped or gone
    async fn stop_container(&self, id: &str) -> Result<(), FleetError>;

    /// Succeeds when the resource is already gone
    async fn delete_container(&self, id: &str) -> Result<(), FleetError>;

    async fn get_container(&self, id: &str) -> Result<Option<ContainerSnapshot>, FleetError>;

    async fn list_containers(
        &self,
        filters: &ContainerFilters,
    ) -> Result<Vec<ContainerSnapshot>, FleetError>;

    /// Log events in chronological order
    async fn get_logs(&self, id: &str, options: &LogOptions) -> Result<Vec<LogEvent>, FleetError>;

    /// Store or overwrite a secret; returns its reference
    async fn store_secret(
        &self,
        instance_id: &str,
        key: &str,
        value: &SecretString,
    ) -> Result<String, FleetError>;

    async fn get_secret(&self, instance_id: &str, key: &str)
        -> Result<Option<SecretString>, FleetError>;

    /// Succeeds when the secret is already gone
    async fn delete_secret(&self, instance_id: &str, key: &str) -> Result<(), FleetError>;

    /// Identifier a workload uses to read the secret from the provider's
    /// store, if the provider has one
    fn secret_reference(&self, instance_id: &str, key: &str) -> Option<String>;
}

/// Value of `--key=value` style label lists
pub(crate) fn join_labels(labels: &BTreeMap<String, String>, separator: &str) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(separator)
}
