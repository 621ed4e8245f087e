//! Container service on EC2 capacity, driven through the `aws` CLI
//!
//! One ECS service per instance, running a task definition family named
//! after the instance. Updates register a new task definition revision and
//! roll the service in place. Secrets live in Secrets Manager and are
//! attached to the task definition by name.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::errors::{FleetError, ProviderError, ProviderErrorKind};
use crate::models::Manifest;
use crate::providers::cli::{is_not_found, reference_only, Cli};
use crate::providers::command::CommandRunner;
use crate::providers::{
    BootstrapOptions, ContainerConfig, ContainerFilters, ContainerSnapshot, ContainerStatus,
    ContainerUpdate, LogEvent, LogOptions, Provider, ProviderConfig, ValidationResult,
};
use crate::retry::naming::{aws_secret_name, aws_tag_value, ecs_name, INSTANCE_LABEL};
use crate::retry::{create_or_update, poll_until, PollOutcome, StepTracker};
use crate::utils::short_id;

const PROVIDER: &str = "aws";

/// Parse `An error occurred (Code) when calling the Op operation: message`
fn error_code(stderr: &str) -> Option<&str> {
    let start = stderr.find("An error occurred (")? + "An error occurred (".len();
    let end = stderr[start..].find(')')? + start;
    Some(&stderr[start..end])
}

pub fn classify(provider: &str, stderr: &str) -> ProviderError {
    let code = error_code(stderr);
    let message = stderr
        .split_once("operation: ")
        .map(|(_, m)| m.trim())
        .unwrap_or(stderr);

    match code {
        Some(c @ ("ThrottlingException" | "Throttling" | "TooManyRequestsException" | "RequestLimitExceeded")) => {
            ProviderError::new(provider, ProviderErrorKind::QuotaExceeded, message)
                .with_code(c)
                .transient()
        }
        Some(c @ ("ServiceUnavailableException" | "ServerException" | "InternalFailure")) => {
            ProviderError::new(provider, ProviderErrorKind::Network, message).with_code(c).transient()
        }
        Some(c @ ("AccessDeniedException" | "AccessDenied" | "UnauthorizedOperation")) => {
            ProviderError::new(provider, ProviderErrorKind::Authorization, message)
                .with_code(c)
                .with_suggestion("Attach ecs:*, logs:* and secretsmanager:* permissions to the deploying role")
        }
        Some(c @ ("ExpiredToken" | "ExpiredTokenException" | "InvalidClientTokenId" | "UnrecognizedClientException" | "SignatureDoesNotMatch")) => {
            ProviderError::new(provider, ProviderErrorKind::Authentication, message)
                .with_code(c)
                .with_suggestion("Refresh the AWS session (aws sso login or new access keys)")
        }
        Some(c @ ("ResourceNotFoundException" | "ServiceNotFoundException" | "ClusterNotFoundException" | "ServiceNotActiveException")) => {
            ProviderError::new(provider, ProviderErrorKind::NotFound, message).with_code(c)
        }
        Some(c @ ("ResourceExistsException" | "ResourceAlreadyExistsException")) => {
            ProviderError::new(provider, ProviderErrorKind::AlreadyExists, message).with_code(c)
        }
        Some(c @ ("LimitExceededException" | "ServiceQuotaExceededException")) => {
            ProviderError::new(provider, ProviderErrorKind::QuotaExceeded, message)
                .with_code(c)
                .with_suggestion("Request a higher ECS or Secrets Manager quota for the region")
        }
        Some(c) => ProviderError::new(provider, ProviderErrorKind::Unknown, message).with_code(c),
        None if stderr.contains("Could not connect to the endpoint URL")
            || stderr.contains("Connect timeout") =>
        {
            ProviderError::new(provider, ProviderErrorKind::Network, stderr)
        }
        None if stderr.contains("Unable to locate credentials") => {
            ProviderError::new(provider, ProviderErrorKind::Authentication, stderr)
                .with_suggestion("Configure AWS credentials for the fleetd process")
        }
        None => ProviderError::new(provider, ProviderErrorKind::Unknown, stderr),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Tag {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Service {
    service_name: String,
    status: String,
    #[serde(default)]
    desired_count: u32,
    #[serde(default)]
    running_count: u32,
    #[serde(default)]
    pending_count: u32,
    task_definition: String,
    #[serde(default)]
    created_at: Option<f64>,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
struct DescribeServices {
    #[serde(default)]
    services: Vec<Service>,
}

#[derive(Debug, Deserialize)]
struct ListServices {
    #[serde(default, rename = "serviceArns")]
    service_arns: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Cluster {
    status: String,
}

#[derive(Debug, Deserialize)]
struct DescribeClusters {
    #[serde(default)]
    clusters: Vec<Cluster>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisteredTaskDefinition {
    task_definition_arn: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterTaskDefinition {
    task_definition: RegisteredTaskDefinition,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeTaskDefinition {
    task_definition: Value,
}

#[derive(Debug, Deserialize)]
struct LogGroups {
    #[serde(default, rename = "logGroups")]
    log_groups: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct FilteredEvent {
    timestamp: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct FilterLogEvents {
    #[serde(default)]
    events: Vec<FilteredEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SecretValue {
    secret_string: String,
}

pub struct EcsProvider {
    cli: Cli,
    workspace: String,
    region: String,
    cluster: String,
    config: Option<ProviderConfig>,
}

impl EcsProvider {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            cli: Cli::new(runner, PROVIDER, "aws", classify),
            workspace: String::new(),
            region: String::new(),
            cluster: String::new(),
            config: None,
        }
    }

    fn log_group(&self) -> String {
        format!("/fleet/{}", self.workspace)
    }

    fn service_name(config: &ContainerConfig) -> String {
        ecs_name(&format!("fleet-{}-{}", config.instance_name, short_id(&config.instance_id)))
    }

    /// Arguments shared by every call
    fn args<'a>(&'a self, args: &[&'a str]) -> Vec<&'a str> {
        let mut all = args.to_vec();
        all.extend(["--region", self.region.as_str(), "--output", "json"]);
        all
    }

    async fn describe_service(&self, name: &str) -> Result<Option<Service>, FleetError> {
        let args = self.args(&["ecs", "describe-services", "--cluster", &self.cluster, "--services", name, "--include", "TAGS"]);
        let described: Option<DescribeServices> = self.cli.find_json("ecs describe-services", &args).await?;
        // Deleted services linger as INACTIVE
        Ok(described
            .and_then(|d| d.services.into_iter().next())
            .filter(|s| s.status != "INACTIVE"))
    }

    fn snapshot(&self, service: Service, image: Option<String>) -> ContainerSnapshot {
        let status = match service.status.as_str() {
            "DRAINING" => ContainerStatus::Stopped,
            _ if service.desired_count == 0 => ContainerStatus::Stopped,
            _ if service.running_count >= service.desired_count => ContainerStatus::Running,
            _ if service.pending_count > 0 || service.running_count < service.desired_count => {
                ContainerStatus::Starting
            }
            _ => ContainerStatus::Unknown,
        };
        ContainerSnapshot {
            id: service.service_name.clone(),
            name: service.service_name,
            provider: PROVIDER.to_string(),
            status,
            image,
            labels: service.tags.into_iter().map(|t| (t.key, t.value)).collect(),
            created_at: service
                .created_at
                .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single()),
            address: None,
        }
    }

    fn container_definition(&self, name: &str, config: &ContainerConfig) -> Result<Value, FleetError> {
        let environment: Vec<Value> = config
            .env
            .iter()
            .map(|(k, v)| json!({"name": k, "value": v}))
            .collect();
        let secrets: Vec<Value> = reference_only(PROVIDER, &config.secrets)?
            .into_iter()
            .map(|(env_name, reference)| json!({"name": env_name, "valueFrom": reference}))
            .collect();

        let mut definition = json!({
            "name": name,
            "image": config.image,
            "essential": true,
            "environment": environment,
            "secrets": secrets,
            "portMappings": config.ports.iter().map(|p| json!({"containerPort": p})).collect::<Vec<_>>(),
            "logConfiguration": {
                "logDriver": "awslogs",
                "options": {
                    "awslogs-group": self.log_group(),
                    "awslogs-region": self.region,
                    "awslogs-stream-prefix": name,
                }
            }
        });
        if let Some(cpus) = config.cpus {
            definition["cpu"] = json!((cpus * 1024.0).round() as u64);
        }
        definition["memory"] = json!(config.memory_mb.unwrap_or(512));
        Ok(definition)
    }

    async fn register_task_definition(
        &self,
        family: &str,
        container: Value,
        labels: &BTreeMap<String, String>,
    ) -> Result<String, FleetError> {
        let tags: Vec<Value> = labels
            .iter()
            .map(|(k, v)| json!({"key": k, "value": aws_tag_value(v)}))
            .collect();
        let input = json!({
            "family": family,
            "requiresCompatibilities": ["EC2"],
            "networkMode": "bridge",
            "containerDefinitions": [container],
            "tags": tags,
        })
        .to_string();

        let args = self.args(&["ecs", "register-task-definition", "--cli-input-json", &input]);
        let registered: RegisterTaskDefinition = self.cli.run_json("ecs register-task-definition", &args).await?;
        Ok(registered.task_definition.task_definition_arn)
    }

    async fn wait_for_service(&self, name: &str) -> Result<ContainerSnapshot, FleetError> {
        let Some(config) = &self.config else {
            return Err(FleetError::InvalidState("ECS provider used before initialize".into()));
        };
        let outcome = poll_until(
            config.poll_interval,
            config.poll_timeout,
            || self.describe_service(name),
            |service| {
                service
                    .as_ref()
                    .map(|s| s.desired_count > 0 && s.running_count >= s.desired_count)
                    .unwrap_or(false)
            },
        )
        .await?;

        let service = match outcome {
            PollOutcome::Reached(service) => service,
            PollOutcome::TimedOut(service) => {
                warn!("ECS service {} not steady before timeout", name);
                service.flatten()
            }
        };
        service
            .map(|s| self.snapshot(s, None))
            .ok_or_else(|| {
                ProviderError::new(PROVIDER, ProviderErrorKind::NotFound, format!("service {} disappeared", name))
                    .into()
            })
    }

    async fn ensure_cluster(&self) -> Result<bool, FleetError> {
        let args = self.args(&["ecs", "describe-clusters", "--clusters", &self.cluster]);
        let described: DescribeClusters = self.cli.run_json("ecs describe-clusters", &args).await?;
        if described.clusters.iter().any(|c| c.status == "ACTIVE") {
            return Ok(false);
        }
        let args = self.args(&[
            "ecs", "create-cluster", "--cluster-name", &self.cluster,
            "--tags", "key=managed-by,value=fleetd",
        ]);
        self.cli.run("ecs create-cluster", &args).await?;
        Ok(true)
    }

    async fn ensure_log_group(&self, retention_days: u32) -> Result<bool, FleetError> {
        let group = self.log_group();
        let args = self.args(&["logs", "describe-log-groups", "--log-group-name-prefix", &group]);
        let groups: LogGroups = self.cli.run_json("logs describe-log-groups", &args).await?;
        if groups
            .log_groups
            .iter()
            .any(|g| g.get("logGroupName").and_then(Value::as_str) == Some(group.as_str()))
        {
            return Ok(false);
        }
        let args = self.args(&["logs", "create-log-group", "--log-group-name", &group]);
        self.cli.run("logs create-log-group", &args).await?;
        let retention = retention_days.to_string();
        let args = self.args(&[
            "logs", "put-retention-policy", "--log-group-name", &group,
            "--retention-in-days", &retention,
        ]);
        self.cli.run("logs put-retention-policy", &args).await?;
        Ok(true)
    }

    fn secret_name(&self, instance_id: &str, key: &str) -> String {
        aws_secret_name(&format!("fleet/{}/{}/{}", self.workspace, instance_id, key))
    }
}

#[async_trait]
impl Provider for EcsProvider {
    fn name(&self) -> &'static str {
        "ecs"
    }

    fn initialize(&mut self, config: ProviderConfig) {
        self.workspace = config.workspace.clone();
        self.region = config.cloud.region().to_string();
        self.cluster = config
            .cloud
            .cluster
            .clone()
            .unwrap_or_else(|| ecs_name(&format!("fleet-{}", config.workspace)));
        self.cli.retry = config.retry.clone();
        self.config = Some(config);
    }

    async fn validate(&self) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        if self.config.as_ref().and_then(|c| c.cloud.region.as_ref()).is_none() {
            warnings.push(format!("No region configured; defaulting to {}", self.region));
        }
        let args = self.args(&["sts", "get-caller-identity"]);
        if let Err(e) = self.cli.run("sts get-caller-identity", &args).await {
            errors.push(format!("AWS credentials check failed: {}", e));
        }
        ValidationResult::from_checks(errors, warnings)
    }

    async fn bootstrap(&self, options: &BootstrapOptions, tracker: &StepTracker) -> Result<(), FleetError> {
        tracker.start("cluster");
        match self.ensure_cluster().await {
            Ok(created) => tracker.complete(
                "cluster",
                Some(if created { "created" } else { "already active" }.to_string()),
            ),
            Err(e) => {
                tracker.fail("cluster", e.to_string());
                return Err(e);
            }
        }

        tracker.start("log-group");
        match self.ensure_log_group(options.log_retention_days).await {
            Ok(created) => tracker.complete(
                "log-group",
                Some(if created { "created" } else { "already exists" }.to_string()),
            ),
            Err(e) => {
                tracker.fail("log-group", e.to_string());
                return Err(e);
            }
        }
        Ok(())
    }

    async fn deploy_container(
        &self,
        config: &ContainerConfig,
        _manifest: &Manifest,
    ) -> Result<ContainerSnapshot, FleetError> {
        let name = Self::service_name(config);
        let name = name.as_str();
        let container = self.container_definition(name, config)?;
        let task_definition = self.register_task_definition(name, container, &config.labels).await?;
        let task_definition = task_definition.as_str();

        create_or_update(
            || async { Ok::<_, FleetError>(self.describe_service(name).await?.map(|_| ())) },
            || async {
                let tags = config
                    .labels
                    .iter()
                    .map(|(k, v)| format!("key={},value={}", k, aws_tag_value(v)))
                    .collect::<Vec<_>>();
                let mut args = vec![
                    "ecs", "create-service", "--cluster", self.cluster.as_str(),
                    "--service-name", name, "--task-definition", task_definition,
                    "--desired-count", "1", "--launch-type", "EC2", "--tags",
                ];
                args.extend(tags.iter().map(String::as_str));
                let args = self.args(&args);
                self.cli.run("ecs create-service", &args).await?;
                info!("Created ECS service {} in {}", name, self.cluster);
                Ok::<_, FleetError>(())
            },
            |_existing| async move {
                let args = self.args(&[
                    "ecs", "update-service", "--cluster", self.cluster.as_str(),
                    "--service", name, "--task-definition", task_definition,
                    "--desired-count", "1", "--force-new-deployment",
                ]);
                self.cli.run("ecs update-service", &args).await?;
                Ok::<_, FleetError>(())
            },
        )
        .await?;

        let mut snapshot = self.wait_for_service(name).await?;
        snapshot.image = Some(config.image.clone());
        Ok(snapshot)
    }

    async fn update_container(&self, id: &str, update: &ContainerUpdate) -> Result<ContainerSnapshot, FleetError> {
        let service = self.describe_service(id).await?.ok_or_else(|| {
            FleetError::from(ProviderError::new(
                PROVIDER,
                ProviderErrorKind::NotFound,
                format!("service {} does not exist", id),
            ))
        })?;

        let args = self.args(&["ecs", "describe-task-definition", "--task-definition", &service.task_definition]);
        let described: DescribeTaskDefinition = self.cli.run_json("ecs describe-task-definition", &args).await?;
        let mut container = described.task_definition["containerDefinitions"][0].clone();
        if !container.is_object() {
            return Err(ProviderError::new(
                PROVIDER,
                ProviderErrorKind::Unknown,
                format!("task definition {} has no container", service.task_definition),
            )
            .into());
        }

        if let Some(image) = &update.image {
            container["image"] = json!(image);
        }
        if let Some(env) = &update.env {
            container["environment"] = env
                .iter()
                .map(|(k, v)| json!({"name": k, "value": v}))
                .collect::<Value>();
        }
        if let Some(secrets) = &update.secrets {
            container["secrets"] = reference_only(PROVIDER, secrets)?
                .into_iter()
                .map(|(env_name, reference)| json!({"name": env_name, "valueFrom": reference}))
                .collect::<Value>();
        }
        if let Some(cpus) = update.cpus {
            container["cpu"] = json!((cpus * 1024.0).round() as u64);
        }
        if let Some(memory) = update.memory_mb {
            container["memory"] = json!(memory);
        }

        let labels: BTreeMap<String, String> = service.tags.iter().map(|t| (t.key.clone(), t.value.clone())).collect();
        let image = container["image"].as_str().map(str::to_string);
        let task_definition = self.register_task_definition(id, container, &labels).await?;
        let args = self.args(&[
            "ecs", "update-service", "--cluster", self.cluster.as_str(), "--service", id,
            "--task-definition", &task_definition,
        ]);
        self.cli.run("ecs update-service", &args).await?;

        let mut snapshot = self.wait_for_service(id).await?;
        snapshot.image = image;
        Ok(snapshot)
    }

    async fn start_container(&self, id: &str) -> Result<(), FleetError> {
        let args = self.args(&["ecs", "update-service", "--cluster", &self.cluster, "--service", id, "--desired-count", "1"]);
        self.cli.run("ecs update-service", &args).await.map(|_| ())
    }

    async fn stop_container(&self, id: &str) -> Result<(), FleetError> {
        let args = self.args(&["ecs", "update-service", "--cluster", &self.cluster, "--service", id, "--desired-count", "0"]);
        self.cli.run_absent_ok("ecs update-service", &args).await
    }

    async fn delete_container(&self, id: &str) -> Result<(), FleetError> {
        let args = self.args(&["ecs", "delete-service", "--cluster", &self.cluster, "--service", id, "--force"]);
        self.cli.run_absent_ok("ecs delete-service", &args).await
    }

    async fn get_container(&self, id: &str) -> Result<Option<ContainerSnapshot>, FleetError> {
        Ok(self.describe_service(id).await?.map(|s| self.snapshot(s, None)))
    }

    async fn list_containers(&self, filters: &ContainerFilters) -> Result<Vec<ContainerSnapshot>, FleetError> {
        let args = self.args(&["ecs", "list-services", "--cluster", &self.cluster]);
        let listed: ListServices = match self.cli.run_json("ecs list-services", &args).await {
            Ok(listed) => listed,
            Err(e) if is_not_found(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut snapshots = Vec::new();
        // describe-services accepts at most 10 services per call
        for chunk in listed.service_arns.chunks(10) {
            let mut args = vec!["ecs", "describe-services", "--cluster", self.cluster.as_str(), "--include", "TAGS", "--services"];
            args.extend(chunk.iter().map(String::as_str));
            let args = self.args(&args);
            let described: DescribeServices = self.cli.run_json("ecs describe-services", &args).await?;
            snapshots.extend(
                described
                    .services
                    .into_iter()
                    .filter(|s| s.status != "INACTIVE")
                    .map(|s| self.snapshot(s, None))
                    .filter(|s| filters.matches(&s.labels)),
            );
        }
        Ok(snapshots)
    }

    async fn get_logs(&self, id: &str, options: &LogOptions) -> Result<Vec<LogEvent>, FleetError> {
        let group = self.log_group();
        let limit = options.tail.to_string();
        let start = options.since.map(|s| s.timestamp_millis().to_string());
        let mut args = vec![
            "logs", "filter-log-events", "--log-group-name", group.as_str(),
            "--log-stream-name-prefix", id, "--limit", limit.as_str(),
        ];
        if let Some(start) = &start {
            args.extend(["--start-time", start.as_str()]);
        }
        let args = self.args(&args);
        let filtered: Option<FilterLogEvents> = self.cli.find_json("logs filter-log-events", &args).await?;

        let mut events: Vec<LogEvent> = filtered
            .map(|f| f.events)
            .unwrap_or_default()
            .into_iter()
            .map(|e| LogEvent {
                timestamp: DateTime::<Utc>::from_timestamp_millis(e.timestamp),
                message: e.message,
            })
            .collect();
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    async fn store_secret(&self, instance_id: &str, key: &str, value: &SecretString) -> Result<String, FleetError> {
        let name = self.secret_name(instance_id, key);
        let name = name.as_str();
        let instance_tag = format!("Key={},Value={}", INSTANCE_LABEL, aws_tag_value(instance_id));

        create_or_update(
            || async {
                let args = self.args(&["secretsmanager", "describe-secret", "--secret-id", name]);
                self.cli.find_json::<Value>("secretsmanager describe-secret", &args).await
            },
            || async {
                let args = self.args(&[
                    "secretsmanager", "create-secret", "--name", name,
                    "--secret-string", "file:///dev/stdin",
                    "--tags", "Key=managed-by,Value=fleetd", instance_tag.as_str(),
                ]);
                self.cli.run_with_stdin("secretsmanager create-secret", &args, value).await?;
                Ok::<_, FleetError>(Value::Null)
            },
            |_existing| async move {
                let args = self.args(&[
                    "secretsmanager", "put-secret-value", "--secret-id", name,
                    "--secret-string", "file:///dev/stdin",
                ]);
                self.cli.run_with_stdin("secretsmanager put-secret-value", &args, value).await?;
                Ok::<_, FleetError>(Value::Null)
            },
        )
        .await?;
        Ok(name.to_string())
    }

    async fn get_secret(&self, instance_id: &str, key: &str) -> Result<Option<SecretString>, FleetError> {
        let name = self.secret_name(instance_id, key);
        let args = self.args(&["secretsmanager", "get-secret-value", "--secret-id", &name]);
        let value: Option<SecretValue> = self.cli.find_json("secretsmanager get-secret-value", &args).await?;
        Ok(value.map(|v| SecretString::from(v.secret_string)))
    }

    async fn delete_secret(&self, instance_id: &str, key: &str) -> Result<(), FleetError> {
        let name = self.secret_name(instance_id, key);
        let args = self.args(&[
            "secretsmanager", "delete-secret", "--secret-id", &name,
            "--force-delete-without-recovery",
        ]);
        self.cli.run_absent_ok("secretsmanager delete-secret", &args).await
    }

    fn secret_reference(&self, instance_id: &str, key: &str) -> Option<String> {
        Some(self.secret_name(instance_id, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CloudConfig;
    use crate::providers::command::{CommandOutput, ScriptedRunner};
    use crate::providers::{SecretBinding, SecretSource};
    use crate::retry::RetryOptions;
    use std::time::Duration;

    const STEADY: &str = r#"{"services": [{
        "serviceName": "fleet-bot-12345678", "serviceArn": "arn:svc", "status": "ACTIVE",
        "desiredCount": 1, "runningCount": 1, "pendingCount": 0,
        "taskDefinition": "arn:td:1", "createdAt": 1767225600.0,
        "tags": [{"key": "managed-by", "value": "fleetd"}]
    }]}"#;

    fn provider(runner: Arc<ScriptedRunner>) -> EcsProvider {
        let mut provider = EcsProvider::new(runner);
        let mut cloud = CloudConfig::default();
        cloud.region = Some("eu-west-1".into());
        let mut config = ProviderConfig::new("ws", cloud);
        config.retry = RetryOptions::immediate(3);
        config.poll_interval = Duration::from_millis(1);
        config.poll_timeout = Duration::from_millis(50);
        provider.initialize(config);
        provider
    }

    fn config() -> ContainerConfig {
        ContainerConfig {
            instance_id: "12345678-aaaa".into(),
            instance_name: "bot".into(),
            workspace: "ws".into(),
            image: "acme/bot:2".into(),
            env: BTreeMap::new(),
            secrets: vec![SecretBinding {
                key: "token".into(),
                env_name: "TOKEN".into(),
                source: SecretSource::Reference("fleet/ws/12345678-aaaa/token".into()),
            }],
            cpus: Some(0.5),
            memory_mb: Some(1024),
            ports: vec![],
            labels: crate::providers::managed_labels("ws", "12345678-aaaa"),
        }
    }

    #[tokio::test]
    async fn test_deploy_creates_service_when_missing() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("register-task-definition", CommandOutput::ok(r#"{"taskDefinition": {"taskDefinitionArn": "arn:td:1"}}"#))
                .once("describe-services", CommandOutput::ok(r#"{"services": [], "failures": [{"reason": "MISSING"}]}"#))
                .on("describe-services", CommandOutput::ok(STEADY)),
        );
        let snapshot = provider(runner.clone())
            .deploy_container(&config(), &Manifest::new())
            .await
            .unwrap();

        assert_eq!(snapshot.id, "fleet-bot-12345678");
        assert_eq!(snapshot.status, ContainerStatus::Running);
        assert_eq!(runner.calls_matching("create-service").len(), 1);
        assert!(runner.calls_matching("update-service").is_empty());

        let register = runner.calls_matching("register-task-definition")[0].line();
        assert!(register.contains(r#""valueFrom":"fleet/ws/12345678-aaaa/token""#));
        assert!(register.contains(r#""cpu":512"#));
        assert!(register.contains("--region eu-west-1"));
    }

    #[tokio::test]
    async fn test_throttling_is_retried() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .once("describe-services", CommandOutput::failed(255, "An error occurred (ThrottlingException) when calling the DescribeServices operation: Rate exceeded"))
                .on("describe-services", CommandOutput::ok(STEADY)),
        );
        let snapshot = provider(runner.clone()).get_container("fleet-bot-12345678").await.unwrap();
        assert!(snapshot.is_some());
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_missing_service_succeeds() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "delete-service",
            CommandOutput::failed(255, "An error occurred (ServiceNotFoundException) when calling the DeleteService operation: Service not found."),
        ));
        provider(runner).delete_container("gone").await.unwrap();
    }

    #[tokio::test]
    async fn test_store_secret_uses_stdin() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "describe-secret",
            CommandOutput::failed(255, "An error occurred (ResourceNotFoundException) when calling the DescribeSecret operation: not found"),
        ));
        let reference = provider(runner.clone())
            .store_secret("i-1", "token", &SecretString::from("abc".to_string()))
            .await
            .unwrap();

        assert_eq!(reference, "fleet/ws/i-1/token");
        let create = &runner.calls_matching("create-secret")[0];
        assert_eq!(create.stdin.as_deref(), Some("abc"));
        assert!(!create.line().contains("abc "));
    }

    fn bootstrap_options() -> BootstrapOptions {
        BootstrapOptions {
            workspace: "ws".into(),
            log_retention_days: 14,
        }
    }

    #[tokio::test]
    async fn test_bootstrap_creates_cluster_and_log_group() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("describe-clusters", CommandOutput::ok(r#"{"clusters": []}"#))
                .on("describe-log-groups", CommandOutput::ok(r#"{"logGroups": []}"#)),
        );
        let tracker = StepTracker::silent(&["cluster", "log-group"]);
        provider(runner.clone()).bootstrap(&bootstrap_options(), &tracker).await.unwrap();

        assert!(runner.calls_matching("create-cluster")[0].line().contains("--cluster-name fleet-ws"));
        assert_eq!(runner.calls_matching("create-log-group").len(), 1);
        let retention = runner.calls_matching("put-retention-policy")[0].line();
        assert!(retention.contains("--log-group-name /fleet/ws --retention-in-days 14"));
    }

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("describe-clusters", CommandOutput::ok(r#"{"clusters": [{"status": "ACTIVE"}]}"#))
                .on("describe-log-groups", CommandOutput::ok(r#"{"logGroups": [{"logGroupName": "/fleet/ws"}]}"#)),
        );
        let tracker = StepTracker::silent(&["cluster", "log-group"]);
        provider(runner.clone()).bootstrap(&bootstrap_options(), &tracker).await.unwrap();
        assert!(runner.calls_matching("create-").is_empty());
        assert!(runner.calls_matching("put-retention-policy").is_empty());
    }

    #[tokio::test]
    async fn test_validate_checks_credentials() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "get-caller-identity",
            CommandOutput::failed(255, "An error occurred (ExpiredToken) when calling the GetCallerIdentity operation: expired"),
        ));
        let result = provider(runner).validate().await;
        assert!(!result.valid);
        assert!(result.errors[0].starts_with("AWS credentials check failed"));
        assert!(result.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_start_scales_service_up() {
        let runner = Arc::new(ScriptedRunner::new());
        provider(runner.clone()).start_container("fleet-bot-12345678").await.unwrap();
        let line = runner.calls_matching("update-service")[0].line();
        assert!(line.contains("--service fleet-bot-12345678 --desired-count 1"));
    }

    #[tokio::test]
    async fn test_logs_are_ordered_by_time() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "filter-log-events",
            CommandOutput::ok(r#"{"events": [
                {"timestamp": 1767225602000, "message": "later"},
                {"timestamp": 1767225601000, "message": "earlier"}
            ]}"#),
        ));
        let events = provider(runner.clone())
            .get_logs("fleet-bot-12345678", &LogOptions::default())
            .await
            .unwrap();
        let messages: Vec<&str> = events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["earlier", "later"]);
        let line = runner.calls_matching("filter-log-events")[0].line();
        assert!(line.contains("--log-group-name /fleet/ws --log-stream-name-prefix fleet-bot-12345678 --limit 200"));
    }

    #[test]
    fn test_classify_codes() {
        let err = classify("aws", "An error occurred (AccessDeniedException) when calling the CreateService operation: not allowed");
        assert_eq!(err.kind, ProviderErrorKind::Authorization);
        assert_eq!(err.code.as_deref(), Some("AccessDeniedException"));
        assert_eq!(err.message, "not allowed");
        assert!(!err.is_retryable());

        let err = classify("aws", "Could not connect to the endpoint URL: \"https://ecs.eu-west-1.amazonaws.com/\"");
        assert_eq!(err.kind, ProviderErrorKind::Network);
    }
}
