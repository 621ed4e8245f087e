//! Self-hosted Docker provider
//!
//! Serves both `LOCAL` (the daemon next to fleetd) and `DOCKER` (a daemon
//! reached through `DOCKER_HOST`). Docker has no secret store of its own, so
//! secrets live in the local encrypted vault and are injected as environment
//! variables through the CLI's process environment, never through argv.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info};

use crate::errors::{FleetError, ProviderError, ProviderErrorKind};
use crate::models::Manifest;
use crate::providers::cli::{is_already_exists, is_not_found, Cli};
use crate::providers::command::CommandRunner;
use crate::providers::{
    BootstrapOptions, ContainerConfig, ContainerFilters, ContainerSnapshot, ContainerStatus,
    ContainerUpdate, LogEvent, LogOptions, Provider, ProviderConfig, SecretBinding, SecretSource,
    ValidationResult,
};
use crate::retry::naming::{docker_container_name, MANAGED_BY_KEY, MANAGED_BY_VALUE};
use crate::retry::{create_or_update, StepTracker};
use crate::utils::short_id;
use crate::vault::SecretBackend;

const PROVIDER: &str = "docker";

pub fn classify(provider: &str, stderr: &str) -> ProviderError {
    let lower = stderr.to_lowercase();
    let kind = if lower.contains("no such container")
        || lower.contains("no such object")
        || lower.contains("no such network")
        || lower.contains("not found")
    {
        ProviderErrorKind::NotFound
    } else if lower.contains("already in use") || lower.contains("already exists") {
        ProviderErrorKind::AlreadyExists
    } else if lower.contains("toomanyrequests") {
        return ProviderError::new(provider, ProviderErrorKind::QuotaExceeded, stderr)
            .with_code("toomanyrequests")
            .with_suggestion("Authenticate to the registry to raise the pull rate limit");
    } else if lower.contains("unauthorized") || lower.contains("authentication required") {
        ProviderErrorKind::Authentication
    } else if lower.contains("permission denied") {
        return ProviderError::new(provider, ProviderErrorKind::Authorization, stderr)
            .with_suggestion("Add the fleetd user to the docker group or fix the socket permissions");
    } else if lower.contains("cannot connect to the docker daemon")
        || lower.contains("connection refused")
        || lower.contains("i/o timeout")
        || lower.contains("tls handshake timeout")
    {
        return ProviderError::new(provider, ProviderErrorKind::Network, stderr)
            .with_suggestion("Check that the Docker daemon is running and DOCKER_HOST is reachable");
    } else {
        ProviderErrorKind::Unknown
    };
    ProviderError::new(provider, kind, stderr)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
    #[serde(default)]
    restarting: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    env: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHostConfig {
    /// Keyed by `<port>/<proto>`
    #[serde(default)]
    port_bindings: Option<BTreeMap<String, serde_json::Value>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    #[serde(default, rename = "IPAddress")]
    ip_address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Inspect {
    id: String,
    name: String,
    created: DateTime<Utc>,
    state: InspectState,
    config: InspectConfig,
    #[serde(default)]
    host_config: Option<InspectHostConfig>,
    #[serde(default)]
    network_settings: Option<InspectNetwork>,
}

impl Inspect {
    fn published_ports(&self) -> Vec<u16> {
        let Some(bindings) = self.host_config.as_ref().and_then(|h| h.port_bindings.as_ref()) else {
            return Vec::new();
        };
        let mut ports: Vec<u16> = bindings
            .keys()
            .filter_map(|key| key.split('/').next()?.parse().ok())
            .collect();
        ports.dedup();
        ports
    }

    /// Current environment carried as values so none of it lands in argv
    fn env_bindings(&self) -> Vec<SecretBinding> {
        self.config
            .env
            .iter()
            .flatten()
            .filter_map(|pair| pair.split_once('='))
            .map(|(name, value)| SecretBinding {
                key: name.to_string(),
                env_name: name.to_string(),
                source: SecretSource::Value(SecretString::from(value.to_string())),
            })
            .collect()
    }
}

/// One line of `docker ps --format '{{json .}}'`
#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "Labels", default)]
    labels: String,
}

fn map_state(state: &str, restarting: bool) -> ContainerStatus {
    if restarting {
        return ContainerStatus::Starting;
    }
    match state {
        "running" => ContainerStatus::Running,
        "created" | "restarting" => ContainerStatus::Starting,
        "exited" | "paused" => ContainerStatus::Stopped,
        "dead" | "removing" => ContainerStatus::Failed,
        _ => ContainerStatus::Unknown,
    }
}

fn parse_label_list(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Split a `docker logs --timestamps` line into its timestamp and message
fn parse_log_line(line: &str) -> LogEvent {
    match line.split_once(' ') {
        Some((ts, message)) => match DateTime::parse_from_rfc3339(ts) {
            Ok(timestamp) => LogEvent {
                timestamp: Some(timestamp.with_timezone(&Utc)),
                message: message.to_string(),
            },
            Err(_) => LogEvent {
                timestamp: None,
                message: line.to_string(),
            },
        },
        None => LogEvent {
            timestamp: None,
            message: line.to_string(),
        },
    }
}

pub struct DockerProvider {
    cli: Cli,
    /// Local daemon (LOCAL) or a configured host (DOCKER)
    remote: bool,
    workspace: String,
    secrets: Option<Arc<dyn SecretBackend>>,
}

impl DockerProvider {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        remote: bool,
        secrets: Option<Arc<dyn SecretBackend>>,
    ) -> Self {
        Self {
            cli: Cli::new(runner, PROVIDER, "docker", classify),
            remote,
            workspace: String::new(),
            secrets,
        }
    }

    fn network_name(&self) -> String {
        docker_container_name(&format!("fleet-{}", self.workspace))
    }

    fn container_name(config: &ContainerConfig) -> String {
        docker_container_name(&format!(
            "fleet-{}-{}",
            config.instance_name,
            short_id(&config.instance_id)
        ))
    }

    fn secret_backend(&self) -> Result<&Arc<dyn SecretBackend>, FleetError> {
        self.secrets.as_ref().ok_or_else(|| {
            ProviderError::new(PROVIDER, ProviderErrorKind::Unknown, "no local vault configured")
                .into()
        })
    }

    async fn run_container(&self, name: &str, config: &ContainerConfig) -> Result<String, FleetError> {
        let network = self.network_name();
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.to_string(),
            "--restart".into(),
            "unless-stopped".into(),
            "--network".into(),
            network,
        ];
        for (key, value) in &config.labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &config.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }

        // Secret values travel in the CLI's own environment; `-e NAME`
        // without a value tells docker to copy it from there
        let mut secret_env = Vec::new();
        for SecretBinding { env_name, source, .. } in &config.secrets {
            args.push("-e".into());
            match source {
                SecretSource::Value(value) => {
                    args.push(env_name.clone());
                    secret_env.push((env_name.clone(), value.expose_secret().to_string()));
                }
                SecretSource::Reference(reference) => {
                    args.push(format!("{}={}", env_name, reference));
                }
            }
        }
        if let Some(cpus) = config.cpus {
            args.push("--cpus".into());
            args.push(cpus.to_string());
        }
        if let Some(memory) = config.memory_mb {
            args.push("--memory".into());
            args.push(format!("{}m", memory));
        }
        for port in &config.ports {
            args.push("-p".into());
            args.push(format!("{}:{}", port, port));
        }
        args.push(config.image.clone());

        let cli = self.cli.with_extra_env(secret_env);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = cli.run("docker run", &arg_refs).await?;
        Ok(stdout.trim().to_string())
    }

    async fn inspect(&self, id: &str) -> Result<Option<Inspect>, FleetError> {
        let inspected: Option<Vec<Inspect>> = self
            .cli
            .find_json("docker inspect", &["inspect", "--type", "container", id])
            .await?;
        Ok(inspected.and_then(|mut v| v.pop()))
    }

    fn snapshot(&self, inspect: &Inspect) -> ContainerSnapshot {
        ContainerSnapshot {
            id: inspect.id.clone(),
            name: inspect.name.trim_start_matches('/').to_string(),
            provider: self.name().to_string(),
            status: map_state(&inspect.state.status, inspect.state.restarting),
            image: Some(inspect.config.image.clone()),
            labels: inspect.config.labels.clone().unwrap_or_default(),
            created_at: Some(inspect.created),
            address: inspect
                .network_settings
                .as_ref()
                .map(|n| n.ip_address.clone())
                .filter(|ip| !ip.is_empty()),
        }
    }

    async fn require_container(&self, id: &str) -> Result<ContainerSnapshot, FleetError> {
        self.get_container(id).await?.ok_or_else(|| {
            ProviderError::new(
                PROVIDER,
                ProviderErrorKind::NotFound,
                format!("container {} does not exist", id),
            )
            .into()
        })
    }
}

#[async_trait]
impl Provider for DockerProvider {
    fn name(&self) -> &'static str {
        if self.remote {
            "docker"
        } else {
            "local"
        }
    }

    fn initialize(&mut self, config: ProviderConfig) {
        self.workspace = config.workspace;
        self.cli.retry = config.retry;
        self.cli.env.clear();
        if self.remote {
            if let Some(host) = config.cloud.docker_host {
                self.cli.env.push(("DOCKER_HOST".to_string(), host));
            }
        }
    }

    async fn validate(&self) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if self.remote && !self.cli.env.iter().any(|(k, _)| k == "DOCKER_HOST") {
            warnings.push("No dockerHost configured; using the local Docker daemon".to_string());
        }
        if let Err(e) = self
            .cli
            .run("docker version", &["version", "--format", "{{json .Server.Version}}"])
            .await
        {
            errors.push(format!("Docker daemon unreachable: {}", e));
        }
        if self.secrets.is_none() {
            warnings.push("No local vault configured; secrets cannot be attached".to_string());
        }
        ValidationResult::from_checks(errors, warnings)
    }

    async fn bootstrap(&self, _options: &BootstrapOptions, tracker: &StepTracker) -> Result<(), FleetError> {
        let network = self.network_name();
        tracker.start("network");

        let exists = match self.cli.run("docker network inspect", &["network", "inspect", &network]).await {
            Ok(_) => true,
            Err(e) if is_not_found(&e) => false,
            Err(e) => {
                tracker.fail("network", e.to_string());
                return Err(e);
            }
        };

        if exists {
            tracker.complete("network", Some(format!("network {} already exists", network)));
            return Ok(());
        }

        let label = format!("{}={}", MANAGED_BY_KEY, MANAGED_BY_VALUE);
        match self
            .cli
            .run("docker network create", &["network", "create", "--label", &label, &network])
            .await
        {
            Ok(_) => {
                info!("Created docker network {}", network);
                tracker.complete("network", Some(format!("created network {}", network)));
                Ok(())
            }
            Err(e) if is_already_exists(&e) => {
                debug!("Docker network {} was created concurrently", network);
                tracker.complete("network", Some(format!("network {} already exists", network)));
                Ok(())
            }
            Err(e) => {
                tracker.fail("network", e.to_string());
                Err(e)
            }
        }
    }

    async fn deploy_container(
        &self,
        config: &ContainerConfig,
        _manifest: &Manifest,
    ) -> Result<ContainerSnapshot, FleetError> {
        let name = Self::container_name(config);
        let name = name.as_str();
        let upserted = create_or_update(
            || self.get_container(name),
            || async {
                let id = self.run_container(name, config).await?;
                self.require_container(&id).await
            },
            |existing| async move {
                debug!("Replacing existing container {}", existing.name);
                self.delete_container(&existing.id).await?;
                let id = self.run_container(name, config).await?;
                self.require_container(&id).await
            },
        )
        .await?;
        Ok(upserted.into_inner())
    }

    /// Docker containers are immutable; updating recreates the container
    async fn update_container(
        &self,
        id: &str,
        update: &ContainerUpdate,
    ) -> Result<ContainerSnapshot, FleetError> {
        let inspect = self.inspect(id).await?.ok_or_else(|| {
            FleetError::from(ProviderError::new(
                PROVIDER,
                ProviderErrorKind::NotFound,
                format!("container {} does not exist", id),
            ))
        })?;
        let current = self.snapshot(&inspect);
        let instance_id = current.instance_id().unwrap_or_default().to_string();

        // Absent fields are read back from the running container
        let (env, secrets) = match (&update.env, &update.secrets) {
            (Some(env), secrets) => (env.clone(), secrets.clone().unwrap_or_default()),
            (None, secrets) => {
                let replaced = secrets.clone().unwrap_or_default();
                let mut carried: Vec<SecretBinding> = inspect
                    .env_bindings()
                    .into_iter()
                    .filter(|b| !replaced.iter().any(|r| r.env_name == b.env_name))
                    .collect();
                carried.extend(replaced);
                (BTreeMap::new(), carried)
            }
        };

        let config = ContainerConfig {
            instance_id,
            instance_name: current.name.clone(),
            workspace: self.workspace.clone(),
            image: update
                .image
                .clone()
                .or_else(|| current.image.clone())
                .unwrap_or_default(),
            env,
            secrets,
            cpus: update.cpus,
            memory_mb: update.memory_mb,
            ports: update.ports.clone().unwrap_or_else(|| inspect.published_ports()),
            labels: current.labels.clone(),
        };

        self.delete_container(id).await?;
        let new_id = self.run_container(&current.name, &config).await?;
        self.require_container(&new_id).await
    }

    async fn start_container(&self, id: &str) -> Result<(), FleetError> {
        self.cli.run("docker start", &["start", id]).await.map(|_| ())
    }

    async fn stop_container(&self, id: &str) -> Result<(), FleetError> {
        self.cli.run_absent_ok("docker stop", &["stop", id]).await
    }

    async fn delete_container(&self, id: &str) -> Result<(), FleetError> {
        self.cli.run_absent_ok("docker rm", &["rm", "-f", id]).await
    }

    async fn get_container(&self, id: &str) -> Result<Option<ContainerSnapshot>, FleetError> {
        Ok(self.inspect(id).await?.map(|inspect| self.snapshot(&inspect)))
    }

    async fn list_containers(&self, filters: &ContainerFilters) -> Result<Vec<ContainerSnapshot>, FleetError> {
        let mut args: Vec<String> = vec!["ps".into(), "-a".into(), "--no-trunc".into()];
        for (key, value) in filters.label_pairs() {
            args.push("--filter".into());
            args.push(format!("label={}={}", key, value));
        }
        args.push("--format".into());
        args.push("{{json .}}".into());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = self.cli.run("docker ps", &arg_refs).await?;

        let mut snapshots = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            let ps: PsLine = serde_json::from_str(line)?;
            snapshots.push(ContainerSnapshot {
                id: ps.id,
                name: ps.names,
                provider: self.name().to_string(),
                status: map_state(&ps.state, false),
                image: Some(ps.image),
                labels: parse_label_list(&ps.labels),
                created_at: None,
                address: None,
            });
        }
        Ok(snapshots)
    }

    async fn get_logs(&self, id: &str, options: &LogOptions) -> Result<Vec<LogEvent>, FleetError> {
        let tail = options.tail.to_string();
        let mut args = vec!["logs", "--timestamps", "--tail", tail.as_str()];
        let since = options.since.map(|s| s.to_rfc3339());
        if let Some(since) = &since {
            args.push("--since");
            args.push(since.as_str());
        }
        args.push(id);

        let output = self.cli.run("docker logs", &args).await?;
        let mut events: Vec<LogEvent> = output
            .lines()
            .filter(|l| !l.is_empty())
            .map(parse_log_line)
            .collect();
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    async fn store_secret(&self, instance_id: &str, key: &str, value: &SecretString) -> Result<String, FleetError> {
        self.secret_backend()?.store_secret(instance_id, key, value).await?;
        Ok(format!("local:{}:{}", instance_id, key))
    }

    async fn get_secret(&self, instance_id: &str, key: &str) -> Result<Option<SecretString>, FleetError> {
        self.secret_backend()?.get_secret(instance_id, key).await
    }

    async fn delete_secret(&self, instance_id: &str, key: &str) -> Result<(), FleetError> {
        self.secret_backend()?.delete_secret(instance_id, key).await
    }

    fn secret_reference(&self, _instance_id: &str, _key: &str) -> Option<String> {
        None
    }
}
