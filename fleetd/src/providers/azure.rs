//! Azure virtual machines, driven through the `az` CLI
//!
//! A VM per instance runs the workload under Docker via cloud-init. Azure
//! cannot swap a VM's boot payload in place, so updates recreate the VM.
//! Secrets live in Key Vault; the VM gets a managed identity and the
//! workload receives secret URIs.

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
use crate::providers::cli::{is_not_found, reference_only, Cli};
use crate::providers::command::CommandRunner;
use crate::providers::{
    BootstrapOptions, ContainerConfig, ContainerFilters, ContainerSnapshot, ContainerStatus,
    ContainerUpdate, LogEvent, LogOptions, Provider, ProviderConfig, ValidationResult,
};
use crate::retry::naming::{azure_secret_name, azure_vm_name, INSTANCE_LABEL};
use crate::retry::StepTracker;
use crate::utils::short_id;

const PROVIDER: &str = "azure";
const DEFAULT_VM_SIZE: &str = "Standard_B1s";
const VM_IMAGE: &str = "Ubuntu2204";
/// Tag carrying the container image so a recreate can reuse it
const IMAGE_TAG: &str = "fleet-image";

fn error_code(stderr: &str) -> Option<&str> {
    let start = stderr.find("(")? + 1;
    let end = stderr[start..].find(')')? + start;
    let code = &stderr[start..end];
    code.chars().all(|c| c.is_ascii_alphanumeric()).then_some(code)
}

pub fn classify(provider: &str, stderr: &str) -> ProviderError {
    let code = error_code(stderr);
    match code {
        Some(c @ ("ResourceNotFound" | "ResourceGroupNotFound" | "SecretNotFound" | "NotFound" | "VaultNotFound")) => {
            ProviderError::new(provider, ProviderErrorKind::NotFound, stderr).with_code(c)
        }
        Some(c @ ("AuthorizationFailed" | "Forbidden" | "LinkedAuthorizationFailed")) => {
            ProviderError::new(provider, ProviderErrorKind::Authorization, stderr)
                .with_code(c)
                .with_suggestion("Assign the Contributor role on the resource group and a Key Vault access policy")
        }
        Some(c @ ("InvalidAuthenticationToken" | "ExpiredAuthenticationToken" | "AuthenticationFailed")) => {
            ProviderError::new(provider, ProviderErrorKind::Authentication, stderr)
                .with_code(c)
                .with_suggestion("Run az login or refresh the service principal secret")
        }
        Some(c @ ("Conflict" | "VaultAlreadyExists" | "ResourceExists")) => {
            ProviderError::new(provider, ProviderErrorKind::AlreadyExists, stderr).with_code(c)
        }
        Some(c @ ("QuotaExceeded" | "OperationNotAllowed" | "SkuNotAvailable")) => {
            ProviderError::new(provider, ProviderErrorKind::QuotaExceeded, stderr)
                .with_code(c)
                .with_suggestion("Request a vCPU quota increase or choose another VM size or location")
        }
        Some(c @ ("TooManyRequests" | "RetryableError" | "ServerBusy")) => {
            ProviderError::new(provider, ProviderErrorKind::QuotaExceeded, stderr)
                .with_code(c)
                .transient()
        }
        _ => {
            if stderr.contains("az login") || stderr.contains("AADSTS") {
                ProviderError::new(provider, ProviderErrorKind::Authentication, stderr)
                    .with_suggestion("Run az login or refresh the service principal secret")
            } else if stderr.contains("was not found") || stderr.contains("could not be found") {
                ProviderError::new(provider, ProviderErrorKind::NotFound, stderr)
            } else if stderr.contains("Max retries exceeded") || stderr.contains("ConnectionError") {
                ProviderError::new(provider, ProviderErrorKind::Network, stderr)
            } else {
                ProviderError::new(provider, ProviderErrorKind::Unknown, stderr)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VirtualMachine {
    name: String,
    #[serde(default)]
    power_state: Option<String>,
    #[serde(default)]
    provisioning_state: Option<String>,
    #[serde(default)]
    tags: Option<BTreeMap<String, String>>,
    #[serde(default)]
    public_ips: Option<String>,
    #[serde(default)]
    private_ips: Option<String>,
    #[serde(default)]
    time_created: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct KeyVaultSecret {
    value: String,
}

fn map_power_state(vm: &VirtualMachine) -> ContainerStatus {
    if vm.provisioning_state.as_deref() == Some("Failed") {
        return ContainerStatus::Failed;
    }
    match vm.power_state.as_deref() {
        Some("VM running") => ContainerStatus::Running,
        Some("VM starting") => ContainerStatus::Starting,
        Some("VM stopped") | Some("VM stopping") | Some("VM deallocated") | Some("VM deallocating") => {
            ContainerStatus::Stopped
        }
        _ if vm.provisioning_state.as_deref() == Some("Creating") => ContainerStatus::Starting,
        _ => ContainerStatus::Unknown,
    }
}

/// Single-quote for a POSIX shell
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// cloud-init payload installing Docker and running the workload
fn cloud_init(name: &str, image: &str, env: &BTreeMap<String, String>, secrets: &[(&str, &str)]) -> String {
    let mut run = format!("docker run -d --name {} --restart unless-stopped", shell_quote(name));
    for (key, value) in env {
        run.push_str(&format!(" -e {}", shell_quote(&format!("{}={}", key, value))));
    }
    for (env_name, uri) in secrets {
        run.push_str(&format!(" -e {}", shell_quote(&format!("{}={}", env_name, uri))));
    }
    run.push(' ');
    run.push_str(&shell_quote(image));

    format!(
        "#cloud-config\npackages:\n  - docker.io\nruncmd:\n  - systemctl enable --now docker\n  - {}\n",
        run
    )
}

pub struct AzureVmProvider {
    cli: Cli,
    subscription: Option<String>,
    resource_group: String,
    location: String,
    vault: String,
    vm_size: String,
}

impl AzureVmProvider {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            cli: Cli::new(runner, PROVIDER, "az", classify),
            subscription: None,
            resource_group: String::new(),
            location: String::new(),
            vault: String::new(),
            vm_size: DEFAULT_VM_SIZE.to_string(),
        }
    }

    fn args<'a>(&'a self, args: &[&'a str]) -> Vec<&'a str> {
        let mut all = args.to_vec();
        if let Some(subscription) = &self.subscription {
            all.extend(["--subscription", subscription.as_str()]);
        }
        all.extend(["--output", "json"]);
        all
    }

    fn vm_args<'a>(&'a self, args: &[&'a str]) -> Vec<&'a str> {
        let mut all = vec!["vm"];
        all.extend_from_slice(args);
        all.extend(["--resource-group", self.resource_group.as_str()]);
        self.args(&all)
    }

    fn vm_name(config: &ContainerConfig) -> String {
        azure_vm_name(&format!("fleet-{}-{}", config.instance_name, short_id(&config.instance_id)))
    }

    fn snapshot(&self, vm: VirtualMachine) -> ContainerSnapshot {
        let status = map_power_state(&vm);
        let labels = vm.tags.unwrap_or_default();
        ContainerSnapshot {
            id: vm.name.clone(),
            name: vm.name,
            provider: PROVIDER.to_string(),
            status,
            image: labels.get(IMAGE_TAG).cloned(),
            labels,
            created_at: vm.time_created,
            address: vm
                .public_ips
                .filter(|ip| !ip.is_empty())
                .or(vm.private_ips.filter(|ip| !ip.is_empty())),
        }
    }

    async fn show(&self, name: &str) -> Result<Option<VirtualMachine>, FleetError> {
        self.cli
            .find_json("vm show", &self.vm_args(&["show", "--name", name, "--show-details"]))
            .await
    }

    async fn create_vm(&self, name: &str, config: &ContainerConfig, size: &str) -> Result<ContainerSnapshot, FleetError> {
        let secrets = reference_only(PROVIDER, &config.secrets)?;
        let custom_data = cloud_init(name, &config.image, &config.env, &secrets);

        let mut tags: Vec<String> = config.labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        tags.push(format!("{}={}", IMAGE_TAG, config.image));

        let mut args = vec![
            "create", "--name", name, "--image", VM_IMAGE, "--size", size,
            "--location", self.location.as_str(), "--custom-data", custom_data.as_str(),
            "--assign-identity", "--generate-ssh-keys", "--public-ip-sku", "Standard", "--tags",
        ];
        args.extend(tags.iter().map(String::as_str));
        self.cli.run("vm create", &self.vm_args(&args)).await?;
        info!("Created Azure VM {} in {}", name, self.resource_group);

        self.show(name).await?.map(|vm| self.snapshot(vm)).ok_or_else(|| {
            FleetError::from(ProviderError::new(
                PROVIDER,
                ProviderErrorKind::NotFound,
                format!("VM {} missing after create", name),
            ))
        })
    }

    async fn ensure_resource_group(&self) -> Result<bool, FleetError> {
        let shown: Option<Value> = self
            .cli
            .find_json("group show", &self.args(&["group", "show", "--name", &self.resource_group]))
            .await?;
        if shown.is_some() {
            return Ok(false);
        }
        let args = self.args(&[
            "group", "create", "--name", &self.resource_group, "--location", &self.location,
            "--tags", "managed-by=fleetd",
        ]);
        self.cli.run("group create", &args).await?;
        Ok(true)
    }

    async fn ensure_vault(&self) -> Result<bool, FleetError> {
        let shown: Option<Value> = self
            .cli
            .find_json("keyvault show", &self.args(&["keyvault", "show", "--name", &self.vault]))
            .await?;
        if shown.is_some() {
            return Ok(false);
        }
        let args = self.args(&[
            "keyvault", "create", "--name", &self.vault, "--resource-group", &self.resource_group,
            "--location", &self.location, "--tags", "managed-by=fleetd",
        ]);
        self.cli.run("keyvault create", &args).await?;
        Ok(true)
    }

    fn secret_name(instance_id: &str, key: &str) -> String {
        azure_secret_name(&format!("fleet-{}-{}", instance_id, key))
    }
}

#[async_trait]
impl Provider for AzureVmProvider {
    fn name(&self) -> &'static str {
        "azure-vm"
    }

    fn initialize(&mut self, config: ProviderConfig) {
        self.subscription = config.cloud.subscription_id.clone();
        self.resource_group = config.cloud.resource_group().to_string();
        self.location = config.cloud.location().to_string();
        self.vault = config.cloud.vault_name().to_string();
        if let Some(size) = &config.cloud.machine_type {
            self.vm_size = size.clone();
        }
        self.cli.retry = config.retry;
    }

    async fn validate(&self) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        if self.subscription.is_none() {
            warnings.push("No subscriptionId configured; using the CLI's default subscription".to_string());
        }
        if let Err(e) = self.cli.run("account show", &self.args(&["account", "show"])).await {
            errors.push(format!("Azure CLI not authenticated: {}", e));
        }
        ValidationResult::from_checks(errors, warnings)
    }

    async fn bootstrap(&self, _options: &BootstrapOptions, tracker: &StepTracker) -> Result<(), FleetError> {
        tracker.start("resource-group");
        match self.ensure_resource_group().await {
            Ok(created) => tracker.complete(
                "resource-group",
                Some(format!("{} {}", self.resource_group, if created { "created" } else { "exists" })),
            ),
            Err(e) => {
                tracker.fail("resource-group", e.to_string());
                return Err(e);
            }
        }

        tracker.start("key-vault");
        match self.ensure_vault().await {
            Ok(created) => tracker.complete(
                "key-vault",
                Some(format!("{} {}", self.vault, if created { "created" } else { "exists" })),
            ),
            Err(e) => {
                tracker.fail("key-vault", e.to_string());
                return Err(e);
            }
        }
        Ok(())
    }

    async fn deploy_container(
        &self,
        config: &ContainerConfig,
        manifest: &Manifest,
    ) -> Result<ContainerSnapshot, FleetError> {
        let name = Self::vm_name(config);
        let size = manifest
            .get_path(&["runtime", "vmSize"])
            .and_then(Value::as_str)
            .unwrap_or(&self.vm_size)
            .to_string();

        if self.show(&name).await?.is_some() {
            // Inspect before create: an existing VM converges through a recreate
            let update = ContainerUpdate::from_config(config.clone());
            return self.update_container(&name, &update).await;
        }
        self.create_vm(&name, config, &size).await
    }

    /// Recreates the VM; there is a window where no VM exists
    async fn update_container(&self, id: &str, update: &ContainerUpdate) -> Result<ContainerSnapshot, FleetError> {
        let current = self.show(id).await?.ok_or_else(|| {
            FleetError::from(ProviderError::new(PROVIDER, ProviderErrorKind::NotFound, format!("VM {} does not exist", id)))
        })?;
        let labels = current.tags.clone().unwrap_or_default();
        let image = update
            .image
            .clone()
            .or_else(|| labels.get(IMAGE_TAG).cloned())
            .ok_or_else(|| {
                FleetError::ValidationError(format!("no image known for VM {}; the update must name one", id))
            })?;
        if update.cpus.is_some() || update.memory_mb.is_some() {
            warn!("Azure VM {} keeps size {}; resource limits map to VM size only", id, self.vm_size);
        }

        let config = ContainerConfig {
            instance_id: labels.get(INSTANCE_LABEL).cloned().unwrap_or_default(),
            instance_name: id.to_string(),
            workspace: String::new(),
            image,
            env: update.env.clone().unwrap_or_default(),
            secrets: update.secrets.clone().unwrap_or_default(),
            cpus: update.cpus,
            memory_mb: update.memory_mb,
            ports: Vec::new(),
            labels: labels.into_iter().filter(|(k, _)| k != IMAGE_TAG).collect(),
        };

        self.delete_container(id).await?;
        self.create_vm(id, &config, &self.vm_size).await
    }

    async fn start_container(&self, id: &str) -> Result<(), FleetError> {
        self.cli.run("vm start", &self.vm_args(&["start", "--name", id])).await.map(|_| ())
    }

    /// Deallocates so the VM stops accruing compute charges
    async fn stop_container(&self, id: &str) -> Result<(), FleetError> {
        self.cli.run_absent_ok("vm deallocate", &self.vm_args(&["deallocate", "--name", id])).await
    }

    async fn delete_container(&self, id: &str) -> Result<(), FleetError> {
        self.cli
            .run_absent_ok("vm delete", &self.vm_args(&["delete", "--name", id, "--yes"]))
            .await
    }

    async fn get_container(&self, id: &str) -> Result<Option<ContainerSnapshot>, FleetError> {
        Ok(self.show(id).await?.map(|vm| self.snapshot(vm)))
    }

    async fn list_containers(&self, filters: &ContainerFilters) -> Result<Vec<ContainerSnapshot>, FleetError> {
        let vms: Vec<VirtualMachine> = match self
            .cli
            .run_json("vm list", &self.vm_args(&["list", "--show-details"]))
            .await
        {
            Ok(vms) => vms,
            Err(e) if is_not_found(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(vms
            .into_iter()
            .map(|vm| self.snapshot(vm))
            .filter(|s| filters.matches(&s.labels))
            .collect())
    }

    /// Serial console output; Azure does not timestamp it
    async fn get_logs(&self, id: &str, options: &LogOptions) -> Result<Vec<LogEvent>, FleetError> {
        let output = self
            .cli
            .run("vm boot-diagnostics get-boot-log", &self.vm_args(&["boot-diagnostics", "get-boot-log", "--name", id]))
            .await?;
        let text = match serde_json::from_str::<Value>(output.trim()) {
            Ok(Value::String(s)) => s,
            _ => output,
        };
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let skip = lines.len().saturating_sub(options.tail);
        Ok(lines[skip..]
            .iter()
            .map(|line| LogEvent {
                timestamp: None,
                message: line.to_string(),
            })
            .collect())
    }

    async fn store_secret(&self, instance_id: &str, key: &str, value: &SecretString) -> Result<String, FleetError> {
        let name = Self::secret_name(instance_id, key);
        let tags = format!("{}={}", INSTANCE_LABEL, instance_id);
        // `secret set` creates or adds a new version
        let args = self.args(&[
            "keyvault", "secret", "set", "--vault-name", &self.vault, "--name", &name,
            "--file", "/dev/stdin", "--encoding", "utf-8", "--tags", "managed-by=fleetd", &tags,
        ]);
        self.cli.run_with_stdin("keyvault secret set", &args, value).await?;
        Ok(self.secret_reference(instance_id, key).unwrap_or(name))
    }

    async fn get_secret(&self, instance_id: &str, key: &str) -> Result<Option<SecretString>, FleetError> {
        let name = Self::secret_name(instance_id, key);
        let args = self.args(&["keyvault", "secret", "show", "--vault-name", &self.vault, "--name", &name]);
        let secret: Option<KeyVaultSecret> = self.cli.find_json("keyvault secret show", &args).await?;
        Ok(secret.map(|s| SecretString::from(s.value)))
    }

    async fn delete_secret(&self, instance_id: &str, key: &str) -> Result<(), FleetError> {
        let name = Self::secret_name(instance_id, key);
        let args = self.args(&["keyvault", "secret", "delete", "--vault-name", &self.vault, "--name", &name]);
        self.cli.run_absent_ok("keyvault secret delete", &args).await
    }

    fn secret_reference(&self, instance_id: &str, key: &str) -> Option<String> {
        Some(format!(
            "https://{}.vault.azure.net/secrets/{}",
            self.vault,
            Self::secret_name(instance_id, key)
        ))
    }
}
