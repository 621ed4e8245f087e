//! Compute Engine VMs running a container, driven through `gcloud`
//!
//! Each instance is one VM created with `create-with-container`; updates go
//! through `update-container`, which restarts the container in place.
//! Secrets live in Secret Manager and the workload receives their resource
//! names.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::errors::{FleetError, ProviderError, ProviderErrorKind};
use crate::models::Manifest;
use crate::providers::cli::{reference_only, Cli};
use crate::providers::command::CommandRunner;
use crate::providers::{
    join_labels, BootstrapOptions, ContainerConfig, ContainerFilters, ContainerSnapshot,
    ContainerStatus, ContainerUpdate, LogEvent, LogOptions, Provider, ProviderConfig,
    ValidationResult,
};
use crate::retry::naming::{gce_instance_name, gcp_label, gcp_secret_id};
use crate::retry::{create_or_update, poll_until, PollOutcome, StepTracker};
use crate::utils::short_id;

const PROVIDER: &str = "gcp";
const DEFAULT_MACHINE_TYPE: &str = "e2-small";

pub fn classify(provider: &str, stderr: &str) -> ProviderError {
    let has = |needle: &str| stderr.contains(needle);
    if has("RESOURCE_EXHAUSTED") || has("rateLimitExceeded") || has("Too Many Requests") {
        ProviderError::new(provider, ProviderErrorKind::QuotaExceeded, stderr)
            .with_code("RESOURCE_EXHAUSTED")
            .transient()
    } else if has("QUOTA_EXCEEDED") || has("Quota '") {
        ProviderError::new(provider, ProviderErrorKind::QuotaExceeded, stderr)
            .with_code("QUOTA_EXCEEDED")
            .with_suggestion("Request a quota increase in the Cloud console for the project and region")
    } else if has("NOT_FOUND") || has("was not found") || has("notFound") {
        ProviderError::new(provider, ProviderErrorKind::NotFound, stderr).with_code("NOT_FOUND")
    } else if has("ALREADY_EXISTS") || has("already exists") {
        ProviderError::new(provider, ProviderErrorKind::AlreadyExists, stderr).with_code("ALREADY_EXISTS")
    } else if has("PERMISSION_DENIED") || has("Required '") || has("forbidden") {
        ProviderError::new(provider, ProviderErrorKind::Authorization, stderr)
            .with_code("PERMISSION_DENIED")
            .with_suggestion("Grant the service account roles/compute.instanceAdmin.v1 and roles/secretmanager.admin")
    } else if has("UNAUTHENTICATED")
        || has("You do not currently have an active account")
        || has("Reauthentication required")
        || has("invalid_grant")
    {
        ProviderError::new(provider, ProviderErrorKind::Authentication, stderr)
            .with_code("UNAUTHENTICATED")
            .with_suggestion("Check the service account key file or run gcloud auth login")
    } else if has("UNAVAILABLE") || has("Unable to connect") || has("Connection reset") || has("timed out") {
        ProviderError::new(provider, ProviderErrorKind::Network, stderr).with_code("UNAVAILABLE")
    } else {
        ProviderError::new(provider, ProviderErrorKind::Unknown, stderr)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessConfig {
    #[serde(default, rename = "natIP")]
    nat_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterface {
    #[serde(default, rename = "networkIP")]
    network_ip: Option<String>,
    #[serde(default)]
    access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComputeInstance {
    name: String,
    status: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    creation_timestamp: Option<DateTime<chrono::FixedOffset>>,
    #[serde(default)]
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogEntry {
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    text_payload: Option<String>,
    #[serde(default)]
    json_payload: Option<Value>,
}

fn map_status(status: &str) -> ContainerStatus {
    match status {
        "RUNNING" => ContainerStatus::Running,
        "PROVISIONING" | "STAGING" | "REPAIRING" => ContainerStatus::Starting,
        "STOPPING" | "STOPPED" | "SUSPENDING" | "SUSPENDED" | "TERMINATED" => ContainerStatus::Stopped,
        _ => ContainerStatus::Unknown,
    }
}

pub struct GceProvider {
    cli: Cli,
    workspace: String,
    project: Option<String>,
    zone: String,
    machine_type: String,
    config: Option<ProviderConfig>,
}

impl GceProvider {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            cli: Cli::new(runner, PROVIDER, "gcloud", classify),
            workspace: String::new(),
            project: None,
            zone: String::new(),
            machine_type: DEFAULT_MACHINE_TYPE.to_string(),
            config: None,
        }
    }

    fn vm_name(config: &ContainerConfig) -> String {
        gce_instance_name(&format!("fleet-{}-{}", config.instance_name, short_id(&config.instance_id)))
    }

    fn project(&self) -> &str {
        self.project.as_deref().unwrap_or_default()
    }

    fn args<'a>(&'a self, args: &[&'a str]) -> Vec<&'a str> {
        let mut all = args.to_vec();
        all.extend(["--project", self.project(), "--format", "json"]);
        all
    }

    fn compute<'a>(&'a self, args: &[&'a str]) -> Vec<&'a str> {
        let mut all = vec!["compute", "instances"];
        all.extend_from_slice(args);
        all.extend(["--zone", self.zone.as_str()]);
        self.args(&all)
    }

    fn snapshot(&self, vm: ComputeInstance) -> ContainerSnapshot {
        let address = vm.network_interfaces.first().and_then(|nic| {
            nic.access_configs
                .iter()
                .find_map(|ac| ac.nat_ip.clone())
                .or_else(|| nic.network_ip.clone())
        });
        ContainerSnapshot {
            id: vm.name.clone(),
            name: vm.name,
            provider: PROVIDER.to_string(),
            status: map_status(&vm.status),
            image: None,
            labels: vm.labels,
            created_at: vm.creation_timestamp.map(|t| t.with_timezone(&Utc)),
            address,
        }
    }

    fn container_env_args(env: &BTreeMap<String, String>, secrets: &[(&str, &str)]) -> Vec<String> {
        let mut args = Vec::new();
        for (key, value) in env {
            args.push("--container-env".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (env_name, reference) in secrets {
            args.push("--container-env".to_string());
            args.push(format!("{}={}", env_name, reference));
        }
        args
    }

    async fn create_vm(&self, name: &str, config: &ContainerConfig, manifest: &Manifest) -> Result<(), FleetError> {
        let secrets = reference_only(PROVIDER, &config.secrets)?;
        let labels: BTreeMap<String, String> = config
            .labels
            .iter()
            .map(|(k, v)| (gcp_label(k), gcp_label(v)))
            .collect();
        let machine_type = manifest
            .get_path(&["runtime", "machineType"])
            .and_then(Value::as_str)
            .unwrap_or(&self.machine_type)
            .to_string();

        let mut owned = vec![
            "create-with-container".to_string(),
            name.to_string(),
            "--machine-type".to_string(),
            machine_type,
            "--container-image".to_string(),
            config.image.clone(),
            "--container-restart-policy".to_string(),
            "always".to_string(),
            "--labels".to_string(),
            join_labels(&labels, ","),
            "--scopes".to_string(),
            "cloud-platform".to_string(),
        ];
        owned.extend(Self::container_env_args(&config.env, &secrets));

        let refs: Vec<&str> = owned.iter().map(String::as_str).collect();
        self.cli.run("compute instances create-with-container", &self.compute(&refs)).await?;
        info!("Created GCE instance {} in {}", name, self.zone);
        Ok(())
    }

    async fn describe(&self, name: &str) -> Result<Option<ComputeInstance>, FleetError> {
        self.cli
            .find_json("compute instances describe", &self.compute(&["describe", name]))
            .await
    }

    async fn wait_running(&self, name: &str) -> Result<ContainerSnapshot, FleetError> {
        let Some(config) = &self.config else {
            return Err(FleetError::InvalidState("GCE provider used before initialize".into()));
        };
        let outcome = poll_until(
            config.poll_interval,
            config.poll_timeout,
            || self.describe(name),
            |vm| vm.as_ref().map(|v| v.status == "RUNNING").unwrap_or(false),
        )
        .await?;
        let vm = match outcome {
            PollOutcome::Reached(vm) => vm,
            PollOutcome::TimedOut(vm) => {
                warn!("GCE instance {} not RUNNING before timeout", name);
                vm.flatten()
            }
        };
        vm.map(|v| self.snapshot(v)).ok_or_else(|| {
            FleetError::from(ProviderError::new(
                PROVIDER,
                ProviderErrorKind::NotFound,
                format!("instance {} disappeared", name),
            ))
        })
    }

    fn secret_id(&self, instance_id: &str, key: &str) -> String {
        gcp_secret_id(&format!("fleet-{}-{}-{}", self.workspace, instance_id, key))
    }
}

#[async_trait]
impl Provider for GceProvider {
    fn name(&self) -> &'static str {
        "gce"
    }

    fn initialize(&mut self, config: ProviderConfig) {
        self.workspace = config.workspace.clone();
        self.project = config.cloud.project_id.clone();
        self.zone = config.cloud.zone().to_string();
        if let Some(machine_type) = &config.cloud.machine_type {
            self.machine_type = machine_type.clone();
        }
        self.cli.retry = config.retry.clone();
        self.cli.env.clear();
        if let Some(key_file) = &config.cloud.key_file {
            self.cli
                .env
                .push(("CLOUDSDK_AUTH_CREDENTIAL_FILE_OVERRIDE".to_string(), key_file.clone()));
        }
        self.config = Some(config);
    }

    async fn validate(&self) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        if self.project.is_none() {
            errors.push("projectId is required for GCE deployments".to_string());
            return ValidationResult::from_checks(errors, warnings);
        }
        if !self.cli.env.iter().any(|(k, _)| k == "CLOUDSDK_AUTH_CREDENTIAL_FILE_OVERRIDE") {
            warnings.push("No keyFile configured; using the active gcloud account".to_string());
        }
        let project = self.project().to_string();
        if let Err(e) = self.cli.run("projects describe", &self.args(&["projects", "describe", &project])).await {
            errors.push(format!("Cannot access project {}: {}", project, e));
        }
        ValidationResult::from_checks(errors, warnings)
    }

    async fn bootstrap(&self, _options: &BootstrapOptions, tracker: &StepTracker) -> Result<(), FleetError> {
        tracker.start("services");
        let args = self.args(&[
            "services", "enable", "compute.googleapis.com", "secretmanager.googleapis.com",
            "logging.googleapis.com",
        ]);
        match self.cli.run("services enable", &args).await {
            Ok(_) => {
                tracker.complete("services", Some("compute, secretmanager and logging enabled".into()));
                Ok(())
            }
            Err(e) => {
                tracker.fail("services", e.to_string());
                Err(e)
            }
        }
    }

    async fn deploy_container(
        &self,
        config: &ContainerConfig,
        manifest: &Manifest,
    ) -> Result<ContainerSnapshot, FleetError> {
        let name = Self::vm_name(config);
        let name = name.as_str();

        create_or_update(
            || async { Ok::<_, FleetError>(self.describe(name).await?.map(|_| ())) },
            || self.create_vm(name, config, manifest),
            |_existing| async move {
                let update = ContainerUpdate::from_config(config.clone());
                self.update_container(name, &update).await.map(|_| ())
            },
        )
        .await?;

        let mut snapshot = self.wait_running(name).await?;
        snapshot.image = Some(config.image.clone());
        Ok(snapshot)
    }

    async fn update_container(&self, id: &str, update: &ContainerUpdate) -> Result<ContainerSnapshot, FleetError> {
        let mut owned = vec!["update-container".to_string(), id.to_string()];
        if let Some(image) = &update.image {
            owned.push("--container-image".to_string());
            owned.push(image.clone());
        }
        let secrets = match &update.secrets {
            Some(secrets) => reference_only(PROVIDER, secrets)?,
            None => Vec::new(),
        };
        let env = update.env.clone().unwrap_or_default();
        owned.extend(Self::container_env_args(&env, &secrets));
        if update.cpus.is_some() || update.memory_mb.is_some() {
            warn!("GCE update of {} ignores resource limits; machine type is fixed at creation", id);
        }

        let refs: Vec<&str> = owned.iter().map(String::as_str).collect();
        self.cli.run("compute instances update-container", &self.compute(&refs)).await?;

        let mut snapshot = self.wait_running(id).await?;
        snapshot.image = update.image.clone();
        Ok(snapshot)
    }

    async fn start_container(&self, id: &str) -> Result<(), FleetError> {
        self.cli.run("compute instances start", &self.compute(&["start", id])).await.map(|_| ())
    }

    async fn stop_container(&self, id: &str) -> Result<(), FleetError> {
        self.cli.run_absent_ok("compute instances stop", &self.compute(&["stop", id])).await
    }

    async fn delete_container(&self, id: &str) -> Result<(), FleetError> {
        self.cli
            .run_absent_ok("compute instances delete", &self.compute(&["delete", id, "--quiet"]))
            .await
    }

    async fn get_container(&self, id: &str) -> Result<Option<ContainerSnapshot>, FleetError> {
        Ok(self.describe(id).await?.map(|vm| self.snapshot(vm)))
    }

    async fn list_containers(&self, filters: &ContainerFilters) -> Result<Vec<ContainerSnapshot>, FleetError> {
        let filter = filters
            .label_pairs()
            .iter()
            .map(|(k, v)| format!("labels.{}={}", gcp_label(k), gcp_label(v)))
            .collect::<Vec<_>>()
            .join(" AND ");
        let args = self.args(&["compute", "instances", "list", "--filter", &filter]);
        let vms: Vec<ComputeInstance> = self.cli.run_json("compute instances list", &args).await?;
        Ok(vms.into_iter().map(|vm| self.snapshot(vm)).collect())
    }

    async fn get_logs(&self, id: &str, options: &LogOptions) -> Result<Vec<LogEvent>, FleetError> {
        let mut filter = format!(
            "resource.type=\"gce_instance\" AND labels.\"compute.googleapis.com/resource_name\"=\"{}\"",
            id
        );
        if let Some(since) = options.since {
            filter.push_str(&format!(" AND timestamp>=\"{}\"", since.to_rfc3339()));
        }
        let limit = options.tail.to_string();
        let args = self.args(&["logging", "read", &filter, "--limit", &limit, "--order", "desc"]);
        let entries: Vec<LogEntry> = self.cli.run_json("logging read", &args).await?;

        // Read newest first so the limit keeps the tail, then restore order
        let mut events: Vec<LogEvent> = entries
            .into_iter()
            .map(|entry| LogEvent {
                timestamp: entry.timestamp,
                message: entry
                    .text_payload
                    .or_else(|| {
                        entry
                            .json_payload
                            .as_ref()
                            .and_then(|p| p.get("message"))
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                    .unwrap_or_default(),
            })
            .collect();
        events.reverse();
        Ok(events)
    }

    async fn store_secret(&self, instance_id: &str, key: &str, value: &SecretString) -> Result<String, FleetError> {
        let id = self.secret_id(instance_id, key);
        let id = id.as_str();
        let instance_label = format!("fleet-instance={}", gcp_label(instance_id));
        let labels = format!("managed-by=fleetd,{}", instance_label);

        create_or_update(
            || async {
                let args = self.args(&["secrets", "describe", id]);
                self.cli.find_json::<Value>("secrets describe", &args).await
            },
            || async {
                let args = self.args(&[
                    "secrets", "create", id, "--replication-policy", "automatic",
                    "--labels", &labels, "--data-file", "-",
                ]);
                self.cli.run_with_stdin("secrets create", &args, value).await?;
                Ok::<_, FleetError>(Value::Null)
            },
            |_existing| async move {
                let args = self.args(&["secrets", "versions", "add", id, "--data-file", "-"]);
                self.cli.run_with_stdin("secrets versions add", &args, value).await?;
                Ok::<_, FleetError>(Value::Null)
            },
        )
        .await?;
        Ok(self.secret_reference(instance_id, key).unwrap_or_default())
    }

    async fn get_secret(&self, instance_id: &str, key: &str) -> Result<Option<SecretString>, FleetError> {
        let id = self.secret_id(instance_id, key);
        // Raw payload on stdout, so no --format json here
        let args = ["secrets", "versions", "access", "latest", "--secret", id.as_str(), "--project", self.project()];
        match self.cli.run("secrets versions access", &args).await {
            Ok(payload) => Ok(Some(SecretString::from(payload))),
            Err(e) if crate::providers::cli::is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete_secret(&self, instance_id: &str, key: &str) -> Result<(), FleetError> {
        let id = self.secret_id(instance_id, key);
        self.cli
            .run_absent_ok("secrets delete", &self.args(&["secrets", "delete", &id, "--quiet"]))
            .await
    }

    fn secret_reference(&self, instance_id: &str, key: &str) -> Option<String> {
        Some(format!(
            "projects/{}/secrets/{}/versions/latest",
            self.project(),
            self.secret_id(instance_id, key)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CloudConfig;
    use crate::providers::command::{CommandOutput, ScriptedRunner};
    use crate::retry::RetryOptions;
    use std::time::Duration;

    const RUNNING: &str = r#"{
        "name": "fleet-bot-12345678", "status": "RUNNING",
        "labels": {"managed-by": "fleetd"},
        "creationTimestamp": "2026-03-01T10:00:00.000-07:00",
        "networkInterfaces": [{"networkIP": "10.0.0.2", "accessConfigs": [{"natIP": "34.1.2.3"}]}]
    }"#;

    fn provider(runner: Arc<ScriptedRunner>) -> GceProvider {
        let mut provider = GceProvider::new(runner);
        let mut cloud = CloudConfig::default();
        cloud.project_id = Some("acme-prod".into());
        cloud.key_file = Some("/keys/sa.json".into());
        let mut config = ProviderConfig::new("ws", cloud);
        config.retry = RetryOptions::immediate(2);
        config.poll_interval = Duration::from_millis(1);
        config.poll_timeout = Duration::from_millis(50);
        provider.initialize(config);
        provider
    }

    #[tokio::test]
    async fn test_describe_and_address() {
        let runner = Arc::new(ScriptedRunner::new().on("instances describe", CommandOutput::ok(RUNNING)));
        let snapshot = provider(runner.clone())
            .get_container("fleet-bot-12345678")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.status, ContainerStatus::Running);
        assert_eq!(snapshot.address.as_deref(), Some("34.1.2.3"));

        let call = &runner.calls()[0];
        assert!(call.line().contains("--zone us-central1-a"));
        assert!(call.line().contains("--project acme-prod"));
    }

    #[tokio::test]
    async fn test_existing_vm_is_updated_in_place() {
        let runner = Arc::new(ScriptedRunner::new().on("instances describe", CommandOutput::ok(RUNNING)));
        let config = ContainerConfig {
            instance_id: "12345678-aaaa".into(),
            instance_name: "bot".into(),
            workspace: "ws".into(),
            image: "acme/bot:3".into(),
            env: BTreeMap::from([("MODE".to_string(), "fast".to_string())]),
            secrets: vec![],
            cpus: None,
            memory_mb: None,
            ports: vec![],
            labels: crate::providers::managed_labels("ws", "12345678-aaaa"),
        };
        provider(runner.clone()).deploy_container(&config, &Manifest::new()).await.unwrap();

        assert!(runner.calls_matching("create-with-container").is_empty());
        let update = runner.calls_matching("update-container")[0].line();
        assert!(update.contains("--container-image acme/bot:3"));
        assert!(update.contains("--container-env MODE=fast"));
    }

    #[tokio::test]
    async fn test_missing_secret_is_none() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "versions access",
            CommandOutput::failed(1, "ERROR: (gcloud.secrets.versions.access) NOT_FOUND: Secret [x] not found"),
        ));
        assert!(provider(runner).get_secret("i-1", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_validate_requires_project() {
        let runner = Arc::new(ScriptedRunner::new());
        let mut provider = GceProvider::new(runner.clone());
        provider.initialize(ProviderConfig::new("ws", CloudConfig::default()));
        let result = provider.validate().await;
        assert!(!result.valid);
        assert!(result.errors[0].contains("projectId"));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_validate_reports_inaccessible_project() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "projects describe",
            CommandOutput::failed(1, "ERROR: (gcloud.projects.describe) PERMISSION_DENIED: forbidden"),
        ));
        let result = provider(runner).validate().await;
        assert!(!result.valid);
        assert!(result.errors[0].starts_with("Cannot access project acme-prod"));
    }

    #[tokio::test]
    async fn test_bootstrap_enables_services() {
        let runner = Arc::new(ScriptedRunner::new());
        let tracker = StepTracker::silent(&["services"]);
        let options = BootstrapOptions {
            workspace: "ws".into(),
            log_retention_days: 30,
        };
        provider(runner.clone()).bootstrap(&options, &tracker).await.unwrap();
        let line = runner.calls_matching("services enable")[0].line();
        assert!(line.contains("compute.googleapis.com secretmanager.googleapis.com logging.googleapis.com"));
        assert_eq!(tracker.status("services"), Some(openapi_server::StepStatus::Completed));
    }

    #[tokio::test]
    async fn test_start_and_logs_newest_last() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "logging read",
            CommandOutput::ok(r#"[
                {"timestamp": "2026-03-01T10:00:02Z", "textPayload": "second"},
                {"timestamp": "2026-03-01T10:00:01Z", "jsonPayload": {"message": "first"}}
            ]"#),
        ));
        let provider = provider(runner.clone());
        provider.start_container("fleet-bot-12345678").await.unwrap();
        assert!(runner.calls()[0].line().contains("compute instances start fleet-bot-12345678"));

        let events = provider
            .get_logs("fleet-bot-12345678", &LogOptions { tail: 10, since: None })
            .await
            .unwrap();
        let messages: Vec<&str> = events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["first", "second"]);
        assert!(runner.calls_matching("logging read")[0].line().contains("--limit 10 --order desc"));
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify("gcp", "ERROR: (gcloud.compute.instances.create) PERMISSION_DENIED: Required 'compute.instances.create'").kind,
            ProviderErrorKind::Authorization
        );
        assert!(classify("gcp", "RESOURCE_EXHAUSTED: rateLimitExceeded").is_retryable());
        assert_eq!(
            classify("gcp", "ERROR: You do not currently have an active account selected.").kind,
            ProviderErrorKind::Authentication
        );
    }
}
