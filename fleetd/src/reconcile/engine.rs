//! Reconciliation engine
//!
//! Claims an instance through a conditional write (PENDING to CREATING or
//! RECONCILING), runs the preprocessor pipeline, drives the provider and
//! records the outcome. Distinct instances reconcile concurrently up to a
//! permit limit; the claim makes reconciliation of one instance exclusive.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use openapi_server::{
    LogStream, ProgressStatus, ReconcileAllResponse, ReconcileDisposition, ReconcileResponse,
};
use serde_json::json;
use tokio::sync::{Notify, OnceCell, Semaphore};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEvent, Auditor};
use crate::errors::FleetError;
use crate::models::{HealthStatus, Instance, InstanceStatus, Manifest};
use crate::preprocess::{Pipeline, PreprocessContext};
use crate::progress::ProgressHub;
use crate::providers::{
    BootstrapOptions, ContainerConfig, ContainerFilters, ContainerSnapshot, ContainerStatus,
    ContainerUpdate, LogEvent, LogOptions, Provider, ProviderRegistry, SecretBinding, SecretSource,
};
use crate::reconcile::fsm::{transition, InstanceEvent};
use crate::retry::{StepEvent, StepTracker};
use crate::store::{Query, Stores, Versioned};
use crate::vault::resolve_cloud_config;

const DEPLOY_STEPS: [(&str, &str); 6] = [
    ("preprocess", "Prepare manifest"),
    ("provider", "Resolve provider"),
    ("bootstrap", "Prepare provider"),
    ("secrets", "Attach secrets"),
    ("deploy", "Deploy workload"),
    ("record", "Record state"),
];

const TEARDOWN_STEPS: [(&str, &str); 3] = [
    ("teardown", "Remove workload"),
    ("secrets", "Remove secrets"),
    ("record", "Remove record"),
];

#[derive(Debug, Clone)]
pub struct Options {
    /// Image used when a manifest names none
    pub default_image: String,
    /// Instances reconciled at the same time
    pub max_concurrency: usize,
    /// Passed to providers that create log groups during bootstrap
    pub log_retention_days: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            default_image: "ghcr.io/fleetd/bot-runtime:latest".to_string(),
            max_concurrency: 8,
            log_retention_days: 30,
        }
    }
}

/// Result of one reconciliation pass over one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Running,
    Deleted,
    /// Recorded on the instance as `lastError`
    Failed(String),
    /// Not in a state this pass acts on, or claimed by someone else
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub checked: usize,
    pub healthy: usize,
    pub degraded: usize,
}

struct Applied {
    snapshot: ContainerSnapshot,
    digest: String,
    provider: &'static str,
    preprocessed_by: Vec<String>,
}

/// Run one tracked step, reporting start and outcome
async fn run_step<T, F>(tracker: &StepTracker, step: &str, work: F) -> Result<T, FleetError>
where
    F: Future<Output = Result<T, FleetError>>,
{
    tracker.start(step);
    match work.await {
        Ok(value) => {
            tracker.complete(step, None);
            Ok(value)
        }
        Err(e) => {
            tracker.fail(step, e.to_response().message);
            Err(e)
        }
    }
}

/// Human-readable failure kept on the instance
pub fn describe_failure(error: &FleetError) -> String {
    let response = error.to_response();
    match response.suggestions.first() {
        Some(hint) => format!("{}: {} ({})", response.error_type, response.message, hint),
        None => format!("{}: {}", response.error_type, response.message),
    }
}

pub struct ReconcileEngine {
    stores: Stores,
    registry: ProviderRegistry,
    pipeline: Pipeline,
    auditor: Auditor,
    progress: ProgressHub,
    options: Options,
    permits: Semaphore,
    wake: Notify,
    /// One cell per provider placement; set once validated and bootstrapped
    bootstrapped: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
}

impl ReconcileEngine {
    pub fn new(
        stores: Stores,
        registry: ProviderRegistry,
        pipeline: Pipeline,
        auditor: Auditor,
        progress: ProgressHub,
        options: Options,
    ) -> Self {
        let permits = Semaphore::new(options.max_concurrency.max(1));
        Self {
            stores,
            registry,
            pipeline,
            auditor,
            progress,
            options,
            permits,
            wake: Notify::new(),
            bootstrapped: Mutex::new(HashMap::new()),
        }
    }

    /// Record collections the engine reads and writes
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Audit trail shared with the rollout orchestrator
    pub fn auditor(&self) -> &Auditor {
        &self.auditor
    }

    /// Nudge the reconciler worker
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub async fn woken(&self) {
        self.wake.notified().await;
    }

    fn tracker(&self, instance_id: &str, steps: &[(&str, &str)]) -> StepTracker {
        self.progress.begin(instance_id, steps);
        let hub = self.progress.clone();
        let id = instance_id.to_string();
        let ids: Vec<&str> = steps.iter().map(|(id, _)| *id).collect();
        StepTracker::new(&ids, Some(Arc::new(move |event: &StepEvent| hub.forward(&id, event))))
    }

    // ============================== REQUESTS ================================ //

    /// Register a new instance; the reconciler deploys it on its next pass
    pub async fn create_instance(&self, instance: Instance, actor: Option<&str>) -> Result<Instance, FleetError> {
        instance.manifest()?;
        let created = self.stores.instances.insert(&instance).await?.value;
        self.auditor
            .record(
                AuditEvent::new("instance.create", "instance", &created.id)
                    .actor(actor)
                    .metadata(json!({
                        "deploymentType": created.deployment_type().as_str(),
                        "manifestVersion": created.manifest_version,
                    })),
            )
            .await;
        self.wake();
        Ok(created)
    }

    /// Apply `event` with a conditional write and audit the transition
    async fn apply_event(
        &self,
        id: &str,
        event: InstanceEvent,
        actor: Option<&str>,
    ) -> Result<(InstanceStatus, Versioned<Instance>), FleetError> {
        let (written, from) = self
            .stores
            .instances
            .modify(id, |instance| {
                let from = instance.status;
                let next = transition(from, &event)?;
                instance.set_status(next);
                if let InstanceEvent::Fault(message) = &event {
                    instance.last_error = Some(message.clone());
                }
                Ok(from)
            })
            .await?;
        info!(instance_id = %id, "Instance {} -> {} ({})", from, written.value.status, event.name());
        self.auditor
            .record(
                AuditEvent::new(&format!("instance.{}", event.name()), "instance", id)
                    .actor(actor)
                    .diff(format!("status: {} -> {}", from, written.value.status)),
            )
            .await;
        Ok((from, written))
    }

    /// Queue one instance for reconciliation
    pub async fn request_reconcile(&self, id: &str, actor: Option<&str>) -> Result<ReconcileResponse, FleetError> {
        let current = self.stores.instances.load(id).await?;
        if current.value.status.is_guarded() {
            return Ok(ReconcileResponse {
                instance_id: id.to_string(),
                disposition: ReconcileDisposition::Skipped,
            });
        }
        let disposition = match self.apply_event(id, InstanceEvent::Requeue, actor).await {
            Ok(_) => ReconcileDisposition::Queued,
            Err(FleetError::InvalidState(msg)) => {
                // Claimed by a concurrent pass between the read and the write
                if !self.is_guarded(id).await {
                    return Err(FleetError::InvalidState(msg));
                }
                ReconcileDisposition::Skipped
            }
            Err(e) => return Err(e),
        };
        self.wake();
        Ok(ReconcileResponse {
            instance_id: id.to_string(),
            disposition,
        })
    }

    async fn is_guarded(&self, id: &str) -> bool {
        matches!(
            self.stores.instances.get(id).await,
            Ok(Some(current)) if current.value.status.is_guarded()
        )
    }

    /// Queue every instance that can be reconciled. In-flight, paused,
    /// draining and deleting instances are reported as skipped.
    pub async fn reconcile_all(&self, actor: Option<&str>) -> Result<ReconcileAllResponse, FleetError> {
        let mut response = ReconcileAllResponse::default();
        for current in self.stores.instances.query(&Query::all()).await? {
            let instance = current.value;
            let requeued = self
                .stores
                .instances
                .modify(&instance.id, |i| {
                    let next = transition(i.status, &InstanceEvent::Requeue)?;
                    i.set_status(next);
                    Ok(())
                })
                .await;
            match requeued {
                Ok(_) => response.queued.push(instance.id),
                Err(FleetError::InvalidState(_)) | Err(FleetError::NotFound(_)) => response.skipped.push(instance.id),
                Err(e) => return Err(e),
            }
        }
        info!(
            "Bulk reconcile: {} queued, {} skipped",
            response.queued.len(),
            response.skipped.len()
        );
        self.auditor
            .record(
                AuditEvent::new("instance.reconcile_all", "instance", "*")
                    .actor(actor)
                    .metadata(json!({"queued": response.queued, "skipped": response.skipped})),
            )
            .await;
        self.wake();
        Ok(response)
    }

    /// Move an ERROR, RUNNING or DEGRADED instance back to PENDING
    pub async fn requeue(&self, id: &str, actor: Option<&str>) -> Result<Instance, FleetError> {
        let (_, written) = self.apply_event(id, InstanceEvent::Requeue, actor).await?;
        self.wake();
        Ok(written.value)
    }

    /// Requeue a PAUSED instance; a stopped workload with an unchanged
    /// manifest is started rather than recreated
    pub async fn resume(&self, id: &str, actor: Option<&str>) -> Result<Instance, FleetError> {
        let (_, written) = self.apply_event(id, InstanceEvent::Resume, actor).await?;
        self.wake();
        Ok(written.value)
    }

    /// Stop the workload and hold the instance out of reconciliation
    pub async fn pause(&self, id: &str, actor: Option<&str>) -> Result<Instance, FleetError> {
        self.stop_with(id, InstanceEvent::Pause, actor).await
    }

    /// Like [`ReconcileEngine::pause`], ahead of a planned deletion
    pub async fn drain(&self, id: &str, actor: Option<&str>) -> Result<Instance, FleetError> {
        self.stop_with(id, InstanceEvent::Drain, actor).await
    }

    /// Transition, then stop the workload. A failed stop moves the instance to ERROR.
    async fn stop_with(&self, id: &str, event: InstanceEvent, actor: Option<&str>) -> Result<Instance, FleetError> {
        let (_, written) = self.apply_event(id, event, actor).await?;
        let instance = written.value;
        let Some(container_id) = instance.container_id.clone() else {
            return Ok(instance);
        };

        let cloud = resolve_cloud_config(&self.stores, &instance).await?;
        let provider = self.registry.for_instance(&instance, cloud);
        match provider.stop_container(&container_id).await {
            Ok(()) => Ok(instance),
            Err(e) => {
                let message = describe_failure(&e);
                error!(instance_id = %id, "Failed to stop workload: {}", message);
                if let Err(write) = self.apply_event(id, InstanceEvent::Fault(message), actor).await {
                    error!(instance_id = %id, "Failed to record stop failure: {}", write);
                }
                Err(e)
            }
        }
    }

    /// Mark for deletion; refused while an active change-set targets the instance
    pub async fn delete(&self, id: &str, actor: Option<&str>) -> Result<Instance, FleetError> {
        if let Some(change_set) = self.active_change_set(id).await? {
            return Err(FleetError::InvalidState(format!(
                "instance {} is part of active change-set {}",
                id, change_set
            )));
        }
        let (_, written) = self.apply_event(id, InstanceEvent::Delete, actor).await?;
        self.wake();
        Ok(written.value)
    }

    async fn active_change_set(&self, instance_id: &str) -> Result<Option<String>, FleetError> {
        Ok(self
            .stores
            .change_sets
            .query(&Query::all())
            .await?
            .into_iter()
            .find(|c| c.value.is_active_for(instance_id))
            .map(|c| c.value.id))
    }

    /// Recent workload output; empty until a workload has been deployed
    pub async fn logs(&self, id: &str, options: &LogOptions) -> Result<Vec<LogEvent>, FleetError> {
        let instance = self.stores.instances.load(id).await?.value;
        let Some(container_id) = &instance.container_id else {
            return Ok(Vec::new());
        };
        let cloud = resolve_cloud_config(&self.stores, &instance).await?;
        let provider = self.registry.for_instance(&instance, cloud);
        provider.get_logs(container_id, options).await
    }

    // ============================ RECONCILIATION ============================ //

    /// Reconcile every PENDING and DELETING instance, bounded by the permit limit
    pub async fn reconcile_pending(&self) -> Result<Vec<(String, Outcome)>, FleetError> {
        let mut ids = Vec::new();
        for status in [InstanceStatus::Pending, InstanceStatus::Deleting] {
            let query = Query::all().eq("status", status.to_string());
            ids.extend(self.stores.instances.query(&query).await?.into_iter().map(|i| i.value.id));
        }
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Reconciling {} instances", ids.len());
        Ok(self.reconcile_many(ids).await)
    }

    /// Reconcile the given instances concurrently. Failures are per instance.
    pub async fn reconcile_many(&self, ids: Vec<String>) -> Vec<(String, Outcome)> {
        let passes = ids.into_iter().map(|id| async move {
            let outcome = self.reconcile_bounded(&id).await;
            (id, outcome)
        });
        join_all(passes).await
    }

    /// One pass under a concurrency permit; errors become a failed outcome
    pub async fn reconcile_bounded(&self, id: &str) -> Outcome {
        let _permit = self.permits.acquire().await;
        match self.reconcile_instance(id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(instance_id = %id, "Reconciliation aborted: {}", e);
                Outcome::Failed(describe_failure(&e))
            }
        }
    }

    /// One pass over one instance
    pub async fn reconcile_instance(&self, id: &str) -> Result<Outcome, FleetError> {
        let current = self.stores.instances.load(id).await?;
        match current.value.status {
            InstanceStatus::Pending => self.converge(id).await,
            InstanceStatus::Deleting => self.teardown(current.value).await,
            _ => Ok(Outcome::Skipped),
        }
    }

    async fn converge(&self, id: &str) -> Result<Outcome, FleetError> {
        let claimed = self
            .stores
            .instances
            .modify(id, |instance| {
                let event = InstanceEvent::BeginReconcile {
                    first: instance.container_id.is_none(),
                };
                let next = transition(instance.status, &event)?;
                instance.set_status(next);
                Ok(())
            })
            .await;
        let instance = match claimed {
            Ok((claimed, _)) => claimed.value,
            Err(FleetError::InvalidState(_)) => {
                debug!(instance_id = %id, "Already claimed, skipping");
                return Ok(Outcome::Skipped);
            }
            Err(e) => return Err(e),
        };
        info!(instance_id = %id, "Reconciling {} ({})", instance.name, instance.deployment_type());

        let tracker = self.tracker(id, &DEPLOY_STEPS);
        match self.deploy(&instance, &tracker).await {
            Ok(applied) => self.record_success(&instance, applied, &tracker).await,
            Err(e) => self.record_failure(&instance, &e, &tracker).await,
        }
    }

    async fn deploy(&self, instance: &Instance, tracker: &StepTracker) -> Result<Applied, FleetError> {
        let mut manifest = instance.manifest()?;
        let digest = manifest.digest();

        let report = run_step(tracker, "preprocess", async {
            if self.pipeline.is_empty() {
                return Ok(Default::default());
            }
            self.pipeline.run(&mut manifest, &PreprocessContext::new(instance))
        })
        .await?;

        let provider = run_step(tracker, "provider", async {
            let cloud = resolve_cloud_config(&self.stores, instance).await?;
            tracker.info(format!("Using {} provider", instance.deployment_type()));
            Ok(self.registry.for_instance(instance, cloud))
        })
        .await?;

        run_step(tracker, "bootstrap", self.prepare_provider(instance, provider.as_ref())).await?;

        let secrets = run_step(
            tracker,
            "secrets",
            self.secret_bindings(instance, provider.as_ref(), &manifest),
        )
        .await?;

        let snapshot = run_step(tracker, "deploy", async {
            let mut config = ContainerConfig::from_manifest(
                instance,
                &manifest,
                &instance.workspace_id,
                &self.options.default_image,
            );
            config.secrets = secrets;
            let existing = match &instance.container_id {
                Some(container_id) => provider.get_container(container_id).await?,
                None => None,
            };
            match existing {
                Some(existing)
                    if existing.status == ContainerStatus::Stopped
                        && instance.applied_manifest_digest.as_deref() == Some(digest.as_str()) =>
                {
                    tracker.info(format!("Starting stopped {}", existing.name));
                    provider.start_container(&existing.id).await?;
                    let started = provider.get_container(&existing.id).await?;
                    Ok(started.unwrap_or(existing))
                }
                Some(existing) => {
                    tracker.info(format!("Updating {} in place", existing.name));
                    provider
                        .update_container(&existing.id, &ContainerUpdate::from_config(config))
                        .await
                }
                None => {
                    tracker.info(format!("Deploying {}", config.image));
                    provider.deploy_container(&config, &manifest).await
                }
            }
        })
        .await?;

        Ok(Applied {
            snapshot,
            digest,
            provider: provider.name(),
            preprocessed_by: report.modified_by,
        })
    }

    /// Validate and bootstrap a provider the first time a placement is used.
    /// A failed bootstrap is retried on the next pass.
    async fn prepare_provider(&self, instance: &Instance, provider: &dyn Provider) -> Result<(), FleetError> {
        let key = format!(
            "{}/{}/{}",
            provider.name(),
            instance.workspace_id,
            instance.deployment_target_id.as_deref().unwrap_or("-")
        );
        let cell = self
            .bootstrapped
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.clone())
            .or_default()
            .clone();
        // Concurrent first deploys on one placement wait for a single bootstrap
        cell.get_or_try_init(|| self.bootstrap_provider(instance, provider, &key))
            .await?;
        Ok(())
    }

    async fn bootstrap_provider(&self, instance: &Instance, provider: &dyn Provider, key: &str) -> Result<(), FleetError> {
        let validation = provider.validate().await;
        for warning in &validation.warnings {
            warn!(instance_id = %instance.id, "{} provider: {}", provider.name(), warning);
        }
        if !validation.valid {
            return Err(FleetError::ValidationError(format!(
                "{} provider is not usable: {}",
                provider.name(),
                validation.errors.join("; ")
            )));
        }

        // Provider steps are reported as log lines of the bootstrap step
        let hub = self.progress.clone();
        let id = instance.id.clone();
        let steps = StepTracker::new(
            &[],
            Some(Arc::new(move |event: &StepEvent| {
                let line = match event {
                    StepEvent::Started { step_id } => format!("{}: started", step_id),
                    StepEvent::Completed { step_id, message } => {
                        format!("{}: {}", step_id, message.as_deref().unwrap_or("done"))
                    }
                    StepEvent::Failed { step_id, message } => format!("{}: {}", step_id, message),
                    StepEvent::Skipped { step_id, .. } => format!("{}: skipped", step_id),
                    StepEvent::Log { line, .. } => line.clone(),
                };
                hub.log(&id, Some("bootstrap"), LogStream::Stdout, line);
            })),
        );
        let options = BootstrapOptions {
            workspace: instance.workspace_id.clone(),
            log_retention_days: self.options.log_retention_days,
        };
        provider.bootstrap(&options, &steps).await?;
        info!(instance_id = %instance.id, "Bootstrapped {} provider for {}", provider.name(), key);
        Ok(())
    }

    /// Cloud providers get references into their own store; the rest get values
    async fn secret_bindings(
        &self,
        instance: &Instance,
        provider: &dyn Provider,
        manifest: &Manifest,
    ) -> Result<Vec<SecretBinding>, FleetError> {
        let mut bindings = Vec::new();
        for key in manifest.secret_keys() {
            let source = match provider.secret_reference(&instance.id, &key) {
                Some(reference) => SecretSource::Reference(reference),
                None => match provider.get_secret(&instance.id, &key).await? {
                    Some(value) => SecretSource::Value(value),
                    None => {
                        return Err(FleetError::ValidationError(format!(
                            "secret {} is not set for instance {}",
                            key, instance.name
                        )))
                    }
                },
            };
            bindings.push(SecretBinding {
                env_name: SecretBinding::env_name_for(&key),
                key,
                source,
            });
        }
        Ok(bindings)
    }

    async fn record_success(
        &self,
        instance: &Instance,
        applied: Applied,
        tracker: &StepTracker,
    ) -> Result<Outcome, FleetError> {
        let container_id = applied.snapshot.id.clone();
        let digest = applied.digest.clone();
        let written = run_step(tracker, "record", async {
            let (written, _) = self
                .stores
                .instances
                .modify(&instance.id, |current| {
                    // Keep the resource id even if a delete raced in
                    current.container_id = Some(container_id.clone());
                    if current.status == InstanceStatus::Deleting {
                        return Ok(());
                    }
                    let next = transition(current.status, &InstanceEvent::ReconcileSucceeded)?;
                    current.set_status(next);
                    current.applied_manifest_digest = Some(digest.clone());
                    current.health = HealthStatus::Unknown;
                    current.last_error = None;
                    current.last_reconciled_at = Some(Utc::now());
                    Ok(())
                })
                .await?;
            Ok(written)
        })
        .await;

        let written = match written {
            Ok(written) => written,
            Err(e) => {
                self.progress.finish(&instance.id, ProgressStatus::Error, Some(describe_failure(&e)));
                return Err(e);
            }
        };
        self.progress.finish(&instance.id, ProgressStatus::Completed, None);
        info!(
            instance_id = %instance.id,
            "Reconciled {} on {} as {}",
            instance.name, applied.provider, applied.snapshot.id
        );
        self.auditor
            .record(
                AuditEvent::new("instance.reconcile", "instance", &instance.id)
                    .diff(format!("status: {} -> {}", instance.status, written.value.status))
                    .metadata(json!({
                        "provider": applied.provider,
                        "containerId": applied.snapshot.id,
                        "manifestDigest": applied.digest,
                        "manifestVersion": instance.manifest_version,
                        "preprocessedBy": applied.preprocessed_by,
                    })),
            )
            .await;
        Ok(Outcome::Running)
    }

    async fn record_failure(
        &self,
        instance: &Instance,
        error: &FleetError,
        tracker: &StepTracker,
    ) -> Result<Outcome, FleetError> {
        let message = describe_failure(error);
        warn!(instance_id = %instance.id, "Reconciliation failed: {}", message);
        tracker.skip_remaining("previous step failed");
        tracker.log(LogStream::Stderr, message.clone());
        self.progress.finish(&instance.id, ProgressStatus::Error, Some(message.clone()));

        let written = self
            .stores
            .instances
            .modify(&instance.id, |current| {
                current.last_error = Some(message.clone());
                if current.status == InstanceStatus::Deleting {
                    return Ok(());
                }
                let next = transition(current.status, &InstanceEvent::ReconcileFailed(message.clone()))?;
                current.set_status(next);
                Ok(())
            })
            .await;
        if let Err(e) = written {
            error!(instance_id = %instance.id, "Failed to record reconciliation failure: {}", e);
            return Err(e);
        }

        self.auditor
            .record(
                AuditEvent::new("instance.reconcile_failed", "instance", &instance.id)
                    .diff(format!("status: {} -> {}", instance.status, InstanceStatus::Error))
                    .metadata(json!({"error": message, "type": error.error_type()})),
            )
            .await;
        Ok(Outcome::Failed(message))
    }

    /// Remove the workload, its secrets and finally the record
    async fn teardown(&self, instance: Instance) -> Result<Outcome, FleetError> {
        if let Some(change_set) = self.active_change_set(&instance.id).await? {
            debug!(instance_id = %instance.id, "Deletion waits for change-set {}", change_set);
            return Ok(Outcome::Skipped);
        }
        let tracker = self.tracker(&instance.id, &TEARDOWN_STEPS);
        let cloud = resolve_cloud_config(&self.stores, &instance).await?;
        let provider = self.registry.for_instance(&instance, cloud);

        let removed = async {
            run_step(&tracker, "teardown", async {
                let mut ids: Vec<String> = instance.container_id.iter().cloned().collect();
                if ids.is_empty() {
                    // Resources created by a pass that never recorded its id
                    let filters = ContainerFilters {
                        workspace: None,
                        instance_id: Some(instance.id.clone()),
                    };
                    ids = provider.list_containers(&filters).await?.into_iter().map(|c| c.id).collect();
                }
                for id in &ids {
                    tracker.info(format!("Deleting {}", id));
                    provider.delete_container(id).await?;
                }
                Ok(())
            })
            .await?;

            run_step(&tracker, "secrets", async {
                // An unparsable manifest has no secret keys to clean up
                let keys = instance.manifest().map(|m| m.secret_keys()).unwrap_or_default();
                for key in keys {
                    provider.delete_secret(&instance.id, &key).await?;
                }
                Ok(())
            })
            .await?;

            run_step(&tracker, "record", async {
                self.stores.instances.delete(&instance.id).await?;
                Ok(())
            })
            .await
        }
        .await;

        match removed {
            Ok(()) => {
                self.progress.finish(&instance.id, ProgressStatus::Completed, None);
                info!(instance_id = %instance.id, "Deleted instance {}", instance.name);
                self.auditor
                    .record(
                        AuditEvent::new("instance.deleted", "instance", &instance.id)
                            .metadata(json!({"provider": provider.name()})),
                    )
                    .await;
                Ok(Outcome::Deleted)
            }
            Err(e) => {
                let message = describe_failure(&e);
                warn!(instance_id = %instance.id, "Deletion failed: {}", message);
                tracker.skip_remaining("previous step failed");
                self.progress.finish(&instance.id, ProgressStatus::Error, Some(message.clone()));
                // Stays DELETING; the next pass retries
                let written = self
                    .stores
                    .instances
                    .modify(&instance.id, |current| {
                        current.last_error = Some(message.clone());
                        Ok(())
                    })
                    .await;
                if let Err(e) = written {
                    warn!(instance_id = %instance.id, "Failed to record deletion failure: {}", e);
                }
                Ok(Outcome::Failed(message))
            }
        }
    }

    // ========================= HEALTH AND SWEEPING ========================== //

    /// Check RUNNING and DEGRADED instances and move them between the two
    pub async fn check_health(&self) -> Result<HealthReport, FleetError> {
        let mut report = HealthReport::default();
        let mut active = Vec::new();
        for status in [InstanceStatus::Running, InstanceStatus::Degraded] {
            let query = Query::all().eq("status", status.to_string());
            active.extend(self.stores.instances.query(&query).await?.into_iter().map(|i| i.value));
        }

        for instance in active {
            report.checked += 1;
            let observed = match &instance.container_id {
                Some(container_id) => match resolve_cloud_config(&self.stores, &instance).await {
                    Ok(cloud) => {
                        let provider = self.registry.for_instance(&instance, cloud);
                        match provider.get_container(container_id).await {
                            Ok(snapshot) => Some(snapshot.map(|s| s.status)),
                            Err(e) => {
                                warn!(instance_id = %instance.id, "Health check failed: {}", e);
                                None
                            }
                        }
                    }
                    // Without its placement the workload cannot be observed
                    Err(e) => {
                        warn!(instance_id = %instance.id, "Cannot resolve deployment target: {}", e);
                        Some(None)
                    }
                },
                None => Some(None),
            };

            let (health, event) = match observed {
                Some(Some(ContainerStatus::Running)) => (HealthStatus::Healthy, Some(InstanceEvent::HealthPassed)),
                Some(Some(ContainerStatus::Starting)) => (HealthStatus::Degraded, Some(InstanceEvent::HealthFailed)),
                Some(Some(ContainerStatus::Stopped | ContainerStatus::Failed)) | Some(None) => {
                    (HealthStatus::Unhealthy, Some(InstanceEvent::HealthFailed))
                }
                Some(Some(ContainerStatus::Unknown)) | None => (HealthStatus::Unknown, None),
            };

            let written = self
                .stores
                .instances
                .modify(&instance.id, |current| {
                    if !current.status.is_active() {
                        return Ok(None);
                    }
                    let from = current.status;
                    if let Some(event) = &event {
                        let next = transition(from, event)?;
                        current.set_status(next);
                    }
                    current.health = health;
                    current.last_health_check_at = Some(Utc::now());
                    Ok(Some(from))
                })
                .await;
            match written {
                Ok((written, Some(from))) => {
                    match written.value.status {
                        InstanceStatus::Running => report.healthy += 1,
                        _ => report.degraded += 1,
                    }
                    if from != written.value.status {
                        info!(instance_id = %instance.id, "Health: {} -> {}", from, written.value.status);
                        self.auditor
                            .record(
                                AuditEvent::new("instance.health", "instance", &instance.id)
                                    .diff(format!("status: {} -> {}", from, written.value.status))
                                    .metadata(json!({"health": health})),
                            )
                            .await;
                    }
                }
                Ok((_, None)) | Err(FleetError::NotFound(_)) => {}
                Err(e) => warn!(instance_id = %instance.id, "Failed to record health: {}", e),
            }
        }
        Ok(report)
    }

    /// Requeue instances stuck in CREATING or RECONCILING longer than `threshold`
    pub async fn sweep_stuck(&self, threshold: Duration) -> Result<Vec<String>, FleetError> {
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| FleetError::ConfigError(format!("invalid stuck threshold: {}", e)))?;
        let cutoff = Utc::now() - threshold;
        let mut requeued = Vec::new();

        for status in [InstanceStatus::Reconciling, InstanceStatus::Creating] {
            let query = Query::all().eq("status", status.to_string());
            for stuck in self.stores.instances.query(&query).await? {
                let stuck = stuck.value;
                if stuck.status_changed_at > cutoff {
                    continue;
                }
                let message = format!(
                    "reconciliation did not finish within {}s; requeued",
                    threshold.num_seconds()
                );
                let written = self
                    .stores
                    .instances
                    .modify(&stuck.id, |current| {
                        // Someone else moved it on since the query
                        if current.status != stuck.status || current.status_changed_at > cutoff {
                            return Ok(false);
                        }
                        let next = transition(current.status, &InstanceEvent::TimedOut)?;
                        current.set_status(next);
                        current.last_error = Some(message.clone());
                        Ok(true)
                    })
                    .await;
                match written {
                    Ok((_, true)) => {
                        warn!(instance_id = %stuck.id, "Requeued instance stuck in {}", stuck.status);
                        self.progress.finish(&stuck.id, ProgressStatus::Timeout, Some(message.clone()));
                        self.auditor
                            .record(
                                AuditEvent::new("instance.timed_out", "instance", &stuck.id)
                                    .diff(format!("status: {} -> {}", stuck.status, InstanceStatus::Pending)),
                            )
                            .await;
                        requeued.push(stuck.id);
                    }
                    Ok((_, false)) | Err(FleetError::NotFound(_)) => {}
                    Err(e) => warn!(instance_id = %stuck.id, "Failed to requeue stuck instance: {}", e),
                }
            }
        }
        if !requeued.is_empty() {
            self.wake();
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeSet, RolloutStrategy};
    use crate::providers::command::{CommandOutput, ScriptedRunner};
    use crate::reconcile::fixtures::{docker_rules, docker_runner, harness, harness_with};
    use crate::store::{MemoryStore, Record, RecordStore};
    use async_trait::async_trait;
    use openapi_server::StepStatus;

    const EXITED: &str = r#"[{
        "Id": "stopped1",
        "Name": "/fleet-bot-12345678",
        "Created": "2026-03-01T10:00:00.000000000Z",
        "State": {"Status": "exited", "Restarting": false},
        "Config": {"Image": "fleet/bot:1", "Labels": {"managed-by": "fleetd"}}
    }]"#;

    /// Memory store with switchable outages
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        targets_down: bool,
        instance_writes_down: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl RecordStore for FlakyStore {
        async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>, FleetError> {
            if self.targets_down && collection == "deployment_targets" {
                return Err(FleetError::StoreError("connection refused".into()));
            }
            self.inner.get(collection, id).await
        }

        async fn put(
            &self,
            collection: &str,
            id: &str,
            data: serde_json::Value,
            expected_revision: Option<u64>,
        ) -> Result<Record, FleetError> {
            if collection == "instances" && self.instance_writes_down.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(FleetError::StoreError("read-only".into()));
            }
            self.inner.put(collection, id, data, expected_revision).await
        }

        async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Record>, FleetError> {
            self.inner.query(collection, query).await
        }

        async fn delete(&self, collection: &str, id: &str) -> Result<bool, FleetError> {
            self.inner.delete(collection, id).await
        }
    }

    fn bot(manifest: serde_json::Value) -> Instance {
        let manifest = Manifest::from_value(manifest).unwrap();
        Instance::new("bot", "ws", &manifest, None)
    }

    async fn status_of(stores: &Stores, id: &str) -> Instance {
        stores.instances.load(id).await.unwrap().value
    }

    #[tokio::test]
    async fn test_first_reconcile_deploys_and_runs() {
        let h = harness(docker_runner());
        let instance = h
            .engine
            .create_instance(bot(json!({"runtime": {"image": "fleet/bot:1"}})), Some("ops"))
            .await
            .unwrap();

        let outcome = h.engine.reconcile_instance(&instance.id).await.unwrap();
        assert_eq!(outcome, Outcome::Running);

        let stored = status_of(&h.stores, &instance.id).await;
        assert_eq!(stored.status, InstanceStatus::Running);
        assert_eq!(stored.health, HealthStatus::Unknown);
        assert_eq!(stored.container_id.as_deref(), Some("abc123"));
        assert!(stored.applied_manifest_digest.is_some());
        assert!(stored.last_error.is_none());

        // The workload sees the preprocessed manifest but the stored one is untouched
        assert!(!stored.desired_manifest.contains("fleet_runtime"));
        assert_eq!(h.runner.calls_matching("run -d").len(), 1);

        let progress = h.progress.status(&instance.id).await;
        assert_eq!(progress.status, ProgressStatus::Completed);
        assert!(progress.steps.iter().all(|s| s.status == StepStatus::Completed));
        assert_eq!(h.audit.with_action("instance.reconcile").len(), 1);
        assert_eq!(h.audit.with_action("instance.create")[0].actor, "ops");
    }

    #[tokio::test]
    async fn test_first_deploy_bootstraps_provider_once() {
        let runner = docker_rules(
            ScriptedRunner::new().once("network inspect", CommandOutput::failed(1, "Error: No such network: fleet-ws")),
        );
        let h = harness(runner);
        let first = h.engine.create_instance(bot(json!({})), None).await.unwrap();
        assert_eq!(h.engine.reconcile_instance(&first.id).await.unwrap(), Outcome::Running);

        let lines: Vec<String> = h.runner.calls().iter().map(|c| c.line()).collect();
        let position = |needle: &str| lines.iter().position(|l| l.contains(needle)).unwrap();
        assert!(position("docker version") < position("network create"));
        assert!(position("network create") < position("run -d"));
        assert!(lines[position("run -d")].contains("--network fleet-ws"));

        let progress = h.progress.status(&first.id).await;
        assert_eq!(progress.steps[2].status, StepStatus::Completed);

        // Same placement: no second validation or bootstrap
        let second = h.engine.create_instance(bot(json!({})), None).await.unwrap();
        assert_eq!(h.engine.reconcile_instance(&second.id).await.unwrap(), Outcome::Running);
        assert_eq!(h.runner.calls_matching("docker version").len(), 1);
        assert_eq!(h.runner.calls_matching("network inspect").len(), 1);
        assert_eq!(h.runner.calls_matching("network create").len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_deploys_share_one_bootstrap() {
        let runner = docker_rules(
            ScriptedRunner::new()
                .yielding()
                .on("network inspect", CommandOutput::failed(1, "Error: No such network: fleet-ws"))
                .once("network create", CommandOutput::ok("net-1\n"))
                .on(
                    "network create",
                    CommandOutput::failed(1, "Error response from daemon: network with name fleet-ws already exists"),
                ),
        );
        let h = harness(runner);
        let first = h.engine.create_instance(bot(json!({})), None).await.unwrap();
        let second = h.engine.create_instance(bot(json!({})), None).await.unwrap();

        let outcomes = h.engine.reconcile_many(vec![first.id.clone(), second.id.clone()]).await;
        for (id, outcome) in &outcomes {
            assert_eq!(outcome, &Outcome::Running, "instance {}", id);
        }
        assert_eq!(h.runner.calls_matching("docker version").len(), 1);
        assert_eq!(h.runner.calls_matching("network inspect").len(), 1);
        assert_eq!(h.runner.calls_matching("network create").len(), 1);
        assert_eq!(status_of(&h.stores, &second.id).await.status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn test_unusable_provider_fails_before_deploy() {
        let runner = docker_rules(
            ScriptedRunner::new().once("docker version", CommandOutput::failed(1, "Cannot connect to the Docker daemon")),
        );
        let h = harness(runner);
        let instance = h.engine.create_instance(bot(json!({})), None).await.unwrap();

        let outcome = h.engine.reconcile_instance(&instance.id).await.unwrap();
        assert!(matches!(&outcome, Outcome::Failed(m) if m.contains("not usable")));
        assert!(h.runner.calls_matching("run -d").is_empty());
        let progress = h.progress.status(&instance.id).await;
        assert_eq!(progress.steps[2].status, StepStatus::Error);

        // Not remembered as prepared, so the next pass validates again
        h.engine.requeue(&instance.id, None).await.unwrap();
        assert_eq!(h.engine.reconcile_instance(&instance.id).await.unwrap(), Outcome::Running);
        assert_eq!(h.runner.calls_matching("docker version").len(), 2);
    }

    #[tokio::test]
    async fn test_update_keeps_manifest_ports() {
        let h = harness(docker_runner());
        let instance = h
            .engine
            .create_instance(bot(json!({"runtime": {"image": "fleet/bot:1", "ports": [8080]}})), None)
            .await
            .unwrap();
        h.engine.reconcile_instance(&instance.id).await.unwrap();
        h.engine.requeue(&instance.id, None).await.unwrap();
        assert_eq!(h.engine.reconcile_instance(&instance.id).await.unwrap(), Outcome::Running);

        let runs = h.runner.calls_matching("run -d");
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.line().contains("-p 8080:8080")));
        assert_eq!(h.runner.calls_matching("rm -f abc123").len(), 1);
    }

    #[tokio::test]
    async fn test_resume_starts_stopped_workload() {
        let runner = docker_rules(
            ScriptedRunner::new().on("inspect --type container stopped1", CommandOutput::ok(EXITED)),
        );
        let h = harness(runner);
        let instance = h.engine.create_instance(bot(json!({})), None).await.unwrap();
        h.engine.reconcile_instance(&instance.id).await.unwrap();
        h.stores
            .instances
            .modify(&instance.id, |i| {
                i.container_id = Some("stopped1".into());
                Ok(())
            })
            .await
            .unwrap();

        h.engine.pause(&instance.id, None).await.unwrap();
        h.engine.resume(&instance.id, None).await.unwrap();
        assert_eq!(h.engine.reconcile_instance(&instance.id).await.unwrap(), Outcome::Running);

        assert_eq!(h.runner.calls_matching("docker start stopped1").len(), 1);
        assert_eq!(h.runner.calls_matching("run -d").len(), 1);
        assert!(h.runner.calls_matching("rm -f").is_empty());
        assert_eq!(status_of(&h.stores, &instance.id).await.container_id.as_deref(), Some("stopped1"));
    }

    #[tokio::test]
    async fn test_logs_read_from_provider() {
        let runner = docker_rules(ScriptedRunner::new().on(
            "logs --timestamps",
            CommandOutput::ok("2026-03-01T10:00:00Z ready\n"),
        ));
        let h = harness(runner);
        let instance = h.engine.create_instance(bot(json!({})), None).await.unwrap();
        assert!(h.engine.logs(&instance.id, &LogOptions::default()).await.unwrap().is_empty());

        h.engine.reconcile_instance(&instance.id).await.unwrap();
        let events = h.engine.logs(&instance.id, &LogOptions::default()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "ready");
        assert!(h.runner.calls_matching("logs --timestamps --tail 200 abc123").len() == 1);
    }

    #[tokio::test]
    async fn test_provider_failure_sets_error_with_message() {
        let runner = docker_rules(ScriptedRunner::new().once(
            "run -d",
            CommandOutput::failed(125, "docker: Cannot connect to the Docker daemon at unix:///var/run/docker.sock"),
        ));
        let h = harness(runner);
        let instance = h.engine.create_instance(bot(json!({})), None).await.unwrap();

        let outcome = h.engine.reconcile_instance(&instance.id).await.unwrap();
        let Outcome::Failed(message) = outcome else {
            panic!("expected failure");
        };
        assert!(message.starts_with("NETWORK"));

        let stored = status_of(&h.stores, &instance.id).await;
        assert_eq!(stored.status, InstanceStatus::Error);
        assert_eq!(stored.last_error.as_deref(), Some(message.as_str()));

        let progress = h.progress.status(&instance.id).await;
        assert_eq!(progress.status, ProgressStatus::Error);
        assert_eq!(progress.steps[4].status, StepStatus::Error);
        assert_eq!(progress.steps[5].status, StepStatus::Skipped);

        // ERROR waits for an explicit requeue
        assert!(h.engine.reconcile_pending().await.unwrap().is_empty());
        h.engine.requeue(&instance.id, None).await.unwrap();
        assert_eq!(h.engine.reconcile_pending().await.unwrap()[0].1, Outcome::Running);
    }

    #[tokio::test]
    async fn test_missing_secret_fails_validation() {
        let h = harness(docker_runner());
        let instance = h
            .engine
            .create_instance(bot(json!({"secrets": ["api-key"]})), None)
            .await
            .unwrap();
        let outcome = h.engine.reconcile_instance(&instance.id).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed(m) if m.contains("api-key")));
        assert!(h.runner.calls_matching("run -d").is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_all_skips_in_flight() {
        let h = harness(docker_runner());
        let busy = h.engine.create_instance(bot(json!({})), None).await.unwrap();
        let idle = h.engine.create_instance(bot(json!({})), None).await.unwrap();
        h.stores
            .instances
            .modify(&busy.id, |i| {
                i.set_status(InstanceStatus::Reconciling);
                Ok(())
            })
            .await
            .unwrap();

        let response = h.engine.reconcile_all(None).await.unwrap();
        assert_eq!(response.skipped, vec![busy.id.clone()]);
        assert_eq!(response.queued, vec![idle.id.clone()]);

        let single = h.engine.request_reconcile(&busy.id, None).await.unwrap();
        assert_eq!(single.disposition, ReconcileDisposition::Skipped);
        assert_eq!(status_of(&h.stores, &busy.id).await.status, InstanceStatus::Reconciling);

        // A claimed instance is not reconciled a second time
        assert_eq!(h.engine.reconcile_instance(&busy.id).await.unwrap(), Outcome::Skipped);
    }

    #[tokio::test]
    async fn test_pause_stops_workload_and_resume_requeues() {
        let h = harness(docker_runner());
        let instance = h.engine.create_instance(bot(json!({})), None).await.unwrap();
        h.engine.reconcile_instance(&instance.id).await.unwrap();

        let paused = h.engine.pause(&instance.id, Some("ops")).await.unwrap();
        assert_eq!(paused.status, InstanceStatus::Paused);
        assert_eq!(h.runner.calls_matching("stop abc123").len(), 1);

        let resumed = h.engine.resume(&instance.id, None).await.unwrap();
        assert_eq!(resumed.status, InstanceStatus::Pending);
        assert!(h.engine.resume(&instance.id, None).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_stop_faults_instance() {
        let runner = docker_runner().on("stop", CommandOutput::failed(1, "permission denied while trying to connect"));
        let h = harness(runner);
        let instance = h.engine.create_instance(bot(json!({})), None).await.unwrap();
        h.engine.reconcile_instance(&instance.id).await.unwrap();

        assert!(h.engine.drain(&instance.id, None).await.is_err());
        let stored = status_of(&h.stores, &instance.id).await;
        assert_eq!(stored.status, InstanceStatus::Error);
        assert!(stored.last_error.is_some());
    }

    #[tokio::test]
    async fn test_delete_tears_down_and_removes_record() {
        let h = harness(docker_runner());
        let instance = h.engine.create_instance(bot(json!({})), None).await.unwrap();
        h.engine.reconcile_instance(&instance.id).await.unwrap();

        h.engine.delete(&instance.id, None).await.unwrap();
        let outcomes = h.engine.reconcile_pending().await.unwrap();
        assert_eq!(outcomes, vec![(instance.id.clone(), Outcome::Deleted)]);
        assert!(h.stores.instances.get(&instance.id).await.unwrap().is_none());
        assert_eq!(h.runner.calls_matching("rm -f abc123").len(), 1);
        assert_eq!(h.audit.with_action("instance.deleted").len(), 1);
    }

    #[tokio::test]
    async fn test_delete_refused_during_active_change_set() {
        let h = harness(docker_runner());
        let instance = h.engine.create_instance(bot(json!({})), None).await.unwrap();
        let change_set = ChangeSet::new(
            &instance.id,
            None,
            json!({}),
            json!({"environment": "staging"}),
            RolloutStrategy::All,
            None,
            None,
            1,
            "ops",
        );
        h.stores.change_sets.insert(&change_set).await.unwrap();

        let err = h.engine.delete(&instance.id, None).await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidState(_)));
        assert_eq!(status_of(&h.stores, &instance.id).await.status, InstanceStatus::Pending);
    }

    #[tokio::test]
    async fn test_health_moves_between_running_and_degraded() {
        let runner = docker_rules(
            ScriptedRunner::new().on("inspect --type container gone", CommandOutput::failed(1, "Error: No such object: gone")),
        );
        let h = harness(runner);
        let instance = h.engine.create_instance(bot(json!({})), None).await.unwrap();
        h.engine.reconcile_instance(&instance.id).await.unwrap();

        let report = h.engine.check_health().await.unwrap();
        assert_eq!(report, HealthReport { checked: 1, healthy: 1, degraded: 0 });
        assert_eq!(status_of(&h.stores, &instance.id).await.health, HealthStatus::Healthy);

        // Container vanished
        h.stores
            .instances
            .modify(&instance.id, |i| {
                i.container_id = Some("gone".into());
                Ok(())
            })
            .await
            .unwrap();
        let report = h.engine.check_health().await.unwrap();
        assert_eq!(report.degraded, 1);
        let stored = status_of(&h.stores, &instance.id).await;
        assert_eq!(stored.status, InstanceStatus::Degraded);
        assert_eq!(stored.health, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_unresolvable_target_marks_only_that_instance_unhealthy() {
        let stores = Stores::new(Arc::new(FlakyStore {
            targets_down: true,
            ..Default::default()
        }));
        let h = harness_with(docker_runner(), stores);
        let mut placed = Vec::new();
        for target in [None, Some("t-1")] {
            let mut instance = bot(json!({}));
            instance.deployment_target_id = target.map(str::to_string);
            instance.container_id = Some("abc123".into());
            instance.set_status(InstanceStatus::Running);
            placed.push(h.stores.instances.insert(&instance).await.unwrap().value);
        }

        let report = h.engine.check_health().await.unwrap();
        assert_eq!(report, HealthReport { checked: 2, healthy: 1, degraded: 1 });

        let reachable = status_of(&h.stores, &placed[0].id).await;
        assert_eq!(reachable.health, HealthStatus::Healthy);
        let unresolved = status_of(&h.stores, &placed[1].id).await;
        assert_eq!(unresolved.status, InstanceStatus::Degraded);
        assert_eq!(unresolved.health, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_failed_teardown_survives_unwritable_record() {
        let flaky = Arc::new(FlakyStore::default());
        let runner = docker_runner().on("rm -f", CommandOutput::failed(1, "permission denied while trying to connect"));
        let h = harness_with(runner, Stores::new(flaky.clone()));
        let instance = h.engine.create_instance(bot(json!({})), None).await.unwrap();
        h.engine.reconcile_instance(&instance.id).await.unwrap();
        h.engine.delete(&instance.id, None).await.unwrap();

        flaky.instance_writes_down.store(true, std::sync::atomic::Ordering::SeqCst);
        let outcome = h.engine.reconcile_instance(&instance.id).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed(m) if m.contains("permission denied")));

        let stored = status_of(&h.stores, &instance.id).await;
        assert_eq!(stored.status, InstanceStatus::Deleting);
        assert!(stored.last_error.is_none());
    }

    #[tokio::test]
    async fn test_sweep_requeues_stuck_instances() {
        let h = harness(docker_runner());
        let stuck = h.engine.create_instance(bot(json!({})), None).await.unwrap();
        let fresh = h.engine.create_instance(bot(json!({})), None).await.unwrap();
        for (id, age) in [(&stuck.id, 3600), (&fresh.id, 5)] {
            h.stores
                .instances
                .modify(id, |i| {
                    i.set_status(InstanceStatus::Reconciling);
                    i.status_changed_at = Utc::now() - chrono::Duration::seconds(age);
                    Ok(())
                })
                .await
                .unwrap();
        }

        let requeued = h.engine.sweep_stuck(Duration::from_secs(900)).await.unwrap();
        assert_eq!(requeued, vec![stuck.id.clone()]);

        let swept = status_of(&h.stores, &stuck.id).await;
        assert_eq!(swept.status, InstanceStatus::Pending);
        assert!(swept.last_error.unwrap().contains("900s"));
        assert_eq!(status_of(&h.stores, &fresh.id).await.status, InstanceStatus::Reconciling);
    }
}
