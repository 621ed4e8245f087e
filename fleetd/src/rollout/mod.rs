//! Change-set rollouts and environment promotion
//!
//! Counters and status live on the change-set row and are only changed
//! through conditional writes, so progress reports from concurrent
//! per-instance reconciliations need no lock.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use openapi_server::{CreateChangeSetRequest, PromotionResponse};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, SYSTEM_ACTOR};
use crate::errors::FleetError;
use crate::models::changeset::select_targets;
use crate::models::{ChangeSet, Environment, Instance, InstanceStatus, Manifest, RolloutStrategy};
use crate::reconcile::{describe_failure, transition, InstanceEvent, Outcome, ReconcileEngine};
use crate::store::{Query, Stores};

/// How long `execute` waits on an instance whose pass was claimed elsewhere
#[derive(Debug, Clone)]
pub struct SettleOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for SettleOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(900),
        }
    }
}

pub struct RolloutOrchestrator {
    engine: Arc<ReconcileEngine>,
    settle: SettleOptions,
}

impl RolloutOrchestrator {
    /// Orchestrator driving rollouts through `engine`
    pub fn new(engine: Arc<ReconcileEngine>) -> Self {
        Self {
            engine,
            settle: SettleOptions::default(),
        }
    }

    pub fn with_settle(mut self, settle: SettleOptions) -> Self {
        self.settle = settle;
        self
    }

    fn stores(&self) -> &Stores {
        self.engine.stores()
    }

    async fn audit(&self, event: AuditEvent) {
        self.engine.auditor().record(event).await;
    }

    /// Instances of the instance's fleet sorted by id, or the instance alone
    async fn fleet_members(&self, instance: &Instance) -> Result<Vec<String>, FleetError> {
        let Some(fleet_id) = &instance.fleet_id else {
            return Ok(vec![instance.id.clone()]);
        };
        let mut ids: Vec<String> = self
            .stores()
            .instances
            .query(&Query::all().eq("fleetId", fleet_id.as_str()))
            .await?
            .into_iter()
            .map(|i| i.value.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Record a PENDING change-set. Targets are resolved now from the
    /// instance's fleet and the requested strategy.
    pub async fn create(&self, request: CreateChangeSetRequest) -> Result<ChangeSet, FleetError> {
        let instance = self.stores().instances.load(&request.instance_id).await?.value;
        let strategy: RolloutStrategy = request.rollout_strategy.parse()?;
        let to_manifest = Manifest::from_value(request.to_manifest)
            .map_err(|e| FleetError::ValidationError(format!("toManifest: {}", e)))?;
        // The current manifest may predate validation; keep it as stored
        let from_manifest = serde_json::from_str(&instance.desired_manifest)
            .unwrap_or_else(|_| serde_json::Value::String(instance.desired_manifest.clone()));

        let members = self.fleet_members(&instance).await?;
        let targets = select_targets(
            strategy,
            request.rollout_percentage,
            request.canary_instances.as_deref(),
            &members,
        )?;
        let total = request.total_instances.unwrap_or(targets.len() as u32);
        if total == 0 {
            return Err(FleetError::ValidationError("totalInstances must be at least 1".into()));
        }

        let actor = request.actor.as_deref().unwrap_or(SYSTEM_ACTOR);
        let mut change_set = ChangeSet::new(
            instance.id.clone(),
            instance.fleet_id.clone(),
            from_manifest,
            to_manifest.as_value(),
            strategy,
            request.rollout_percentage,
            request.canary_instances,
            total,
            actor,
        );
        change_set.target_instances = targets;

        let created = self.stores().change_sets.insert(&change_set).await?.value;
        info!(
            "Created change-set {} for {} ({} instances, {:?})",
            created.id, created.instance_id, created.total_instances, created.rollout_strategy
        );
        self.audit(
            AuditEvent::new("changeset.create", "change_set", &created.id)
                .actor(Some(actor))
                .metadata(json!({
                    "instanceId": created.instance_id,
                    "strategy": created.rollout_strategy,
                    "targets": created.target_instances,
                })),
        )
        .await;
        Ok(created)
    }

    /// Change-set by id
    pub async fn get(&self, id: &str) -> Result<ChangeSet, FleetError> {
        Ok(self.stores().change_sets.load(id).await?.value)
    }

    /// PENDING -> IN_PROGRESS
    pub async fn start(&self, id: &str, actor: Option<&str>) -> Result<ChangeSet, FleetError> {
        let (written, _) = self.stores().change_sets.modify(id, |cs| cs.start()).await?;
        self.audit(
            AuditEvent::new("changeset.start", "change_set", id)
                .actor(actor)
                .diff("status: PENDING -> IN_PROGRESS"),
        )
        .await;
        Ok(written.value)
    }

    /// Accumulate per-instance outcomes; the status turns terminal exactly once
    pub async fn update_progress(&self, id: &str, updated: u32, failed: u32) -> Result<ChangeSet, FleetError> {
        let (written, finished) = self
            .stores()
            .change_sets
            .modify(id, |cs| cs.apply_progress(updated, failed))
            .await?;
        let change_set = written.value;
        if finished {
            info!(
                "Change-set {} finished {} ({} updated, {} failed)",
                change_set.id, change_set.status, change_set.updated_instances, change_set.failed_instances
            );
            self.audit(
                AuditEvent::new("changeset.finish", "change_set", id)
                    .diff(format!("status: IN_PROGRESS -> {}", change_set.status))
                    .metadata(json!({
                        "updatedInstances": change_set.updated_instances,
                        "failedInstances": change_set.failed_instances,
                    })),
            )
            .await;
        }
        Ok(change_set)
    }

    /// Record a rollback as a new change-set with the manifests swapped, then
    /// mark the original. Returns the new change-set.
    pub async fn rollback(&self, id: &str, reason: &str, actor: Option<&str>) -> Result<ChangeSet, FleetError> {
        let actor = actor.unwrap_or(SYSTEM_ACTOR);
        let original = self.stores().change_sets.load(id).await?;
        original.value.check_rollback()?;

        // Claim the original first so two rollbacks cannot both succeed
        let (marked, _) = self
            .stores()
            .change_sets
            .modify(id, |cs| {
                cs.check_rollback()?;
                cs.mark_rolled_back(actor);
                Ok(())
            })
            .await?;

        let rollback = marked.value.rollback_change_set(reason, actor);
        let created = self.stores().change_sets.insert(&rollback).await?.value;
        warn!("Change-set {} rolled back as {}: {}", id, created.id, reason);
        self.audit(
            AuditEvent::new("changeset.rollback", "change_set", id)
                .actor(Some(actor))
                .diff(format!("rolled back by change-set {}", created.id))
                .metadata(json!({"reason": reason, "rollbackId": created.id})),
        )
        .await;
        Ok(created)
    }

    /// Start the change-set, apply its target manifest to every targeted
    /// instance and reconcile them concurrently. One instance failing never
    /// stops its siblings.
    ///
    /// Nothing is started unless the target manifest parses and the
    /// change-set expects exactly as many instances as it targets.
    pub async fn execute(&self, id: &str, actor: Option<&str>) -> Result<ChangeSet, FleetError> {
        let pending = self.get(id).await?;
        let to_manifest = Manifest::from_value(pending.to_manifest.clone())
            .map_err(|e| FleetError::ValidationError(format!("change-set {} toManifest: {}", id, e)))?;
        let targets = if pending.target_instances.is_empty() {
            vec![pending.instance_id.clone()]
        } else {
            pending.target_instances.clone()
        };
        if pending.total_instances as usize != targets.len() {
            return Err(FleetError::InvalidState(format!(
                "change-set {} expects {} instances but targets {}; report its progress instead",
                id,
                pending.total_instances,
                targets.len()
            )));
        }
        self.start(id, actor).await?;

        let passes = targets.iter().map(|instance_id| {
            let to_manifest = &to_manifest;
            async move {
                let outcome = match self.apply_manifest(instance_id, to_manifest).await {
                    Ok(()) => match self.engine.reconcile_bounded(instance_id).await {
                        Outcome::Skipped => self.settle(instance_id).await,
                        outcome => outcome,
                    },
                    Err(e) => Outcome::Failed(describe_failure(&e)),
                };
                let (updated, failed) = match &outcome {
                    Outcome::Running => (1, 0),
                    other => {
                        warn!(instance_id = %instance_id, "Rollout of change-set {} failed: {:?}", id, other);
                        (0, 1)
                    }
                };
                if let Err(e) = self.update_progress(id, updated, failed).await {
                    warn!("Failed to record progress for change-set {}: {}", id, e);
                }
            }
        });
        join_all(passes).await;

        self.get(id).await
    }

    /// Wait for an instance reconciled by another pass to come to rest,
    /// reconciling it here if it is left queued
    async fn settle(&self, instance_id: &str) -> Outcome {
        debug!(instance_id = %instance_id, "Pass claimed elsewhere; waiting for it to settle");
        let deadline = Instant::now() + self.settle.timeout;
        loop {
            let current = match self.stores().instances.get(instance_id).await {
                Ok(Some(current)) => current.value,
                Ok(None) => return Outcome::Failed("instance was deleted during the rollout".into()),
                Err(e) => return Outcome::Failed(describe_failure(&e)),
            };
            match current.status {
                InstanceStatus::Running | InstanceStatus::Degraded => return Outcome::Running,
                InstanceStatus::Error => {
                    return Outcome::Failed(current.last_error.unwrap_or_else(|| "reconciliation failed".into()))
                }
                InstanceStatus::Pending => match self.engine.reconcile_bounded(instance_id).await {
                    Outcome::Skipped => {}
                    outcome => return outcome,
                },
                InstanceStatus::Creating | InstanceStatus::Reconciling => {}
                other => return Outcome::Failed(format!("instance left the rollout as {}", other)),
            }
            if Instant::now() >= deadline {
                return Outcome::Failed(format!(
                    "instance did not settle within {}s",
                    self.settle.timeout.as_secs()
                ));
            }
            tokio::time::sleep(self.settle.interval).await;
        }
    }

    /// Write the manifest and requeue the instance
    async fn apply_manifest(&self, instance_id: &str, manifest: &Manifest) -> Result<(), FleetError> {
        self.stores()
            .instances
            .modify(instance_id, |instance| {
                let next = transition(instance.status, &InstanceEvent::Requeue)?;
                instance.set_manifest(manifest);
                instance.set_status(next);
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Promote the instance's fleet to the next environment.
    ///
    /// Each instance is written on its own, so an interrupted promotion
    /// leaves some instances promoted. Re-running it finishes the rest:
    /// instances already carrying the target environment, the anchor
    /// included, are counted as promoted and not requeued again. Members in
    /// any other environment are skipped; each moves one step at a time.
    pub async fn promote(
        &self,
        instance_id: &str,
        target: &str,
        actor: Option<&str>,
    ) -> Result<PromotionResponse, FleetError> {
        let anchor = self.stores().instances.load(instance_id).await?.value;
        let target: Environment = target.parse()?;
        let anchor_env: Environment = match anchor.manifest()?.environment() {
            Some(env) => env.parse()?,
            None => Environment::Dev,
        };
        if anchor_env.next().is_none() {
            return Err(FleetError::InvalidState(format!(
                "{} is the last environment and cannot be promoted",
                anchor_env
            )));
        }
        // The anchor went first in an earlier, interrupted run
        let current = if anchor_env == target {
            target.prev().ok_or_else(|| {
                FleetError::InvalidState(format!("{} is the first environment and cannot be promoted to", target))
            })?
        } else {
            anchor_env
        };
        match current.next() {
            None => {
                return Err(FleetError::InvalidState(format!(
                    "{} is the last environment and cannot be promoted",
                    current
                )))
            }
            Some(next) if next != target => {
                return Err(FleetError::InvalidState(format!(
                    "cannot promote from {} to {}; the next environment is {}",
                    current, target, next
                )))
            }
            Some(_) => {}
        }

        let mut response = PromotionResponse {
            from_environment: current.to_string(),
            to_environment: target.to_string(),
            ..Default::default()
        };

        for member in self.fleet_members(&anchor).await? {
            let written = self
                .stores()
                .instances
                .modify(&member, |instance| {
                    let Ok(mut manifest) = instance.manifest() else {
                        return Ok(PromoteStep::Unparsable);
                    };
                    let env = manifest.environment().unwrap_or(Environment::Dev.as_str());
                    if env == target.as_str() {
                        return Ok(PromoteStep::AlreadyPromoted);
                    }
                    if env != current.as_str() {
                        return Ok(PromoteStep::OffChain);
                    }
                    manifest.set_environment(target);
                    instance.set_manifest(&manifest);
                    if matches!(instance.status, InstanceStatus::Running | InstanceStatus::Degraded) {
                        let next = transition(instance.status, &InstanceEvent::Requeue)?;
                        instance.set_status(next);
                        return Ok(PromoteStep::Requeued);
                    }
                    Ok(PromoteStep::Rewritten)
                })
                .await;
            match written {
                Ok((_, PromoteStep::Unparsable)) => {
                    warn!(instance_id = %member, "Skipping promotion: manifest does not parse");
                    response.skipped += 1;
                }
                Ok((_, PromoteStep::OffChain)) => {
                    warn!(instance_id = %member, "Skipping promotion: not in {}", current);
                    response.skipped += 1;
                }
                Ok((_, PromoteStep::AlreadyPromoted)) | Ok((_, PromoteStep::Rewritten)) => response.promoted += 1,
                Ok((_, PromoteStep::Requeued)) => {
                    response.promoted += 1;
                    response.reconciling += 1;
                }
                Err(e) => {
                    warn!(instance_id = %member, "Promotion write failed: {}", e);
                    response.failed += 1;
                }
            }
        }

        info!(
            "Promoted {} from {} to {}: {} promoted, {} reconciling, {} skipped, {} failed",
            instance_id, current, target, response.promoted, response.reconciling, response.skipped, response.failed
        );
        self.audit(
            AuditEvent::new("instance.promote", "instance", instance_id)
                .actor(actor)
                .diff(format!("environment: {} -> {}", current, target))
                .metadata(json!(response)),
        )
        .await;
        if response.reconciling > 0 {
            self.engine.wake();
        }
        Ok(response)
    }
}

enum PromoteStep {
    Unparsable,
    /// In neither the source nor the target environment
    OffChain,
    AlreadyPromoted,
    Rewritten,
    Requeued,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChangeSetStatus;
    use crate::providers::command::{CommandOutput, ScriptedRunner};
    use crate::reconcile::fixtures::{docker_rules, docker_runner, harness, Harness};

    async fn member(h: &Harness, name: &str, fleet: &str, manifest: serde_json::Value) -> Instance {
        let manifest = Manifest::from_value(manifest).unwrap();
        let mut instance = Instance::new(name, "ws", &manifest, None);
        instance.fleet_id = Some(fleet.to_string());
        h.engine.create_instance(instance, None).await.unwrap()
    }

    async fn set_status(h: &Harness, id: &str, status: InstanceStatus) {
        h.stores
            .instances
            .modify(id, |i| {
                i.set_status(status);
                Ok(())
            })
            .await
            .unwrap();
    }

    fn request(instance_id: &str) -> CreateChangeSetRequest {
        CreateChangeSetRequest {
            instance_id: instance_id.to_string(),
            to_manifest: json!({"runtime": {"image": "fleet/bot:2"}}),
            rollout_strategy: "ALL".to_string(),
            rollout_percentage: None,
            canary_instances: None,
            total_instances: None,
            actor: Some("ops".to_string()),
        }
    }

    #[tokio::test]
    async fn test_progress_scenario_and_rollback() {
        let h = harness(docker_runner());
        let rollout = RolloutOrchestrator::new(h.engine.clone());
        let anchor = member(&h, "bot", "f-1", json!({})).await;

        let mut req = request(&anchor.id);
        req.total_instances = Some(10);
        let cs = rollout.create(req).await.unwrap();
        assert_eq!(cs.status, ChangeSetStatus::Pending);

        // Progress before start is rejected
        assert!(rollout.update_progress(&cs.id, 1, 0).await.is_err());
        rollout.start(&cs.id, None).await.unwrap();
        assert!(rollout.start(&cs.id, None).await.is_err());

        let cs6 = rollout.update_progress(&cs.id, 6, 0).await.unwrap();
        assert_eq!(cs6.status, ChangeSetStatus::InProgress);
        assert_eq!(cs6.remaining(), 4);

        let done = rollout.update_progress(&cs.id, 4, 0).await.unwrap();
        assert_eq!(done.status, ChangeSetStatus::Completed);
        assert!(done.can_rollback);

        let rollback = rollout.rollback(&cs.id, "regression", Some("ops")).await.unwrap();
        assert_ne!(rollback.id, cs.id);
        assert_eq!(rollback.from_manifest, done.to_manifest);
        assert_eq!(rollback.to_manifest, done.from_manifest);
        assert_eq!(rollback.status, ChangeSetStatus::Pending);

        let original = rollout.get(&cs.id).await.unwrap();
        assert!(original.rolled_back_at.is_some());
        assert_eq!(original.rolled_back_by.as_deref(), Some("ops"));
        assert!(rollout.rollback(&cs.id, "again", None).await.is_err());
        assert_eq!(h.audit.with_action("changeset.rollback").len(), 1);
    }

    #[tokio::test]
    async fn test_create_requires_existing_instance() {
        let h = harness(docker_runner());
        let rollout = RolloutOrchestrator::new(h.engine.clone());
        let err = rollout.create(request("missing")).await.unwrap_err();
        assert!(matches!(err, FleetError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_percentage_selects_first_instances_by_id() {
        let h = harness(docker_runner());
        let rollout = RolloutOrchestrator::new(h.engine.clone());
        let mut ids = Vec::new();
        for name in ["a", "b", "c", "d"] {
            ids.push(member(&h, name, "f-1", json!({})).await.id);
        }
        ids.sort();

        let mut req = request(&ids[3]);
        req.rollout_strategy = "percentage".to_string();
        req.rollout_percentage = Some(50);
        let cs = rollout.create(req).await.unwrap();
        assert_eq!(cs.target_instances, ids[..2].to_vec());
        assert_eq!(cs.total_instances, 2);
    }

    #[tokio::test]
    async fn test_execute_counts_partial_failure() {
        let runner = docker_rules(
            ScriptedRunner::new().on("run -d --name fleet-bad", CommandOutput::failed(1, "pull access denied, unauthorized")),
        );
        let h = harness(runner);
        let rollout = RolloutOrchestrator::new(h.engine.clone());
        let good = member(&h, "good", "f-1", json!({})).await;
        let bad = member(&h, "bad", "f-1", json!({})).await;

        let cs = rollout.create(request(&good.id)).await.unwrap();
        let finished = rollout.execute(&cs.id, Some("ops")).await.unwrap();

        assert_eq!(finished.status, ChangeSetStatus::Failed);
        assert_eq!(finished.updated_instances, 1);
        assert_eq!(finished.failed_instances, 1);
        assert!(!finished.can_rollback);

        let good = h.stores.instances.load(&good.id).await.unwrap().value;
        assert_eq!(good.status, InstanceStatus::Running);
        assert_eq!(good.manifest_version, 2);
        assert_eq!(good.manifest().unwrap().image(), Some("fleet/bot:2"));
        let bad = h.stores.instances.load(&bad.id).await.unwrap().value;
        assert_eq!(bad.status, InstanceStatus::Error);
    }

    #[tokio::test]
    async fn test_unparsable_rollback_stays_pending() {
        let h = harness(docker_runner());
        let rollout = RolloutOrchestrator::new(h.engine.clone());
        let anchor = member(&h, "bot", "f-1", json!({})).await;
        h.stores
            .instances
            .modify(&anchor.id, |i| {
                i.desired_manifest = "{not json".to_string();
                Ok(())
            })
            .await
            .unwrap();

        let cs = rollout.create(request(&anchor.id)).await.unwrap();
        rollout.start(&cs.id, None).await.unwrap();
        rollout.update_progress(&cs.id, 1, 0).await.unwrap();
        let rollback = rollout.rollback(&cs.id, "regression", None).await.unwrap();

        let err = rollout.execute(&rollback.id, None).await.unwrap_err();
        assert!(matches!(err, FleetError::ValidationError(_)));
        let rollback = rollout.get(&rollback.id).await.unwrap();
        assert_eq!(rollback.status, ChangeSetStatus::Pending);
        assert!(h.audit.with_action("changeset.start").len() == 1);
    }

    #[tokio::test]
    async fn test_execute_refuses_total_beyond_targets() {
        let h = harness(docker_runner());
        let rollout = RolloutOrchestrator::new(h.engine.clone());
        let anchor = member(&h, "bot", "f-1", json!({})).await;
        let mut req = request(&anchor.id);
        req.total_instances = Some(5);
        let cs = rollout.create(req).await.unwrap();

        let err = rollout.execute(&cs.id, None).await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidState(_)));
        assert_eq!(rollout.get(&cs.id).await.unwrap().status, ChangeSetStatus::Pending);
        let anchor = h.stores.instances.load(&anchor.id).await.unwrap().value;
        assert_eq!(anchor.manifest_version, 1);
        assert!(h.runner.calls_matching("run -d").is_empty());
    }

    fn quick_settle(timeout_ms: u64) -> SettleOptions {
        SettleOptions {
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test]
    async fn test_settle_waits_for_pass_claimed_elsewhere() {
        let h = harness(docker_runner());
        let rollout = RolloutOrchestrator::new(h.engine.clone()).with_settle(quick_settle(5_000));
        let claimed = member(&h, "bot", "f-1", json!({})).await;
        set_status(&h, &claimed.id, InstanceStatus::Reconciling).await;

        let finish = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            set_status(&h, &claimed.id, InstanceStatus::Running).await;
        };
        let (outcome, _) = tokio::join!(rollout.settle(&claimed.id), finish);
        assert_eq!(outcome, Outcome::Running);
        // The other pass did the work
        assert!(h.runner.calls_matching("run -d").is_empty());
    }

    #[tokio::test]
    async fn test_settle_reconciles_instance_left_pending() {
        let h = harness(docker_runner());
        let rollout = RolloutOrchestrator::new(h.engine.clone()).with_settle(quick_settle(5_000));
        let queued = member(&h, "bot", "f-1", json!({})).await;
        assert_eq!(rollout.settle(&queued.id).await, Outcome::Running);
        assert_eq!(h.runner.calls_matching("run -d").len(), 1);
    }

    #[tokio::test]
    async fn test_settle_gives_up_after_timeout() {
        let h = harness(docker_runner());
        let rollout = RolloutOrchestrator::new(h.engine.clone()).with_settle(quick_settle(20));
        let stuck = member(&h, "bot", "f-1", json!({})).await;
        set_status(&h, &stuck.id, InstanceStatus::Creating).await;
        let Outcome::Failed(message) = rollout.settle(&stuck.id).await else {
            panic!("expected failure");
        };
        assert!(message.contains("did not settle"));

        set_status(&h, &stuck.id, InstanceStatus::Paused).await;
        assert!(matches!(rollout.settle(&stuck.id).await, Outcome::Failed(m) if m.contains("PAUSED")));
    }

    #[tokio::test]
    async fn test_promote_requeues_running_and_skips_unparsable() {
        let h = harness(docker_runner());
        let rollout = RolloutOrchestrator::new(h.engine.clone());
        let running = member(&h, "running", "f-1", json!({"environment": "dev"})).await;
        let paused = member(&h, "paused", "f-1", json!({"environment": "dev"})).await;
        let broken = member(&h, "broken", "f-1", json!({})).await;
        set_status(&h, &running.id, InstanceStatus::Running).await;
        set_status(&h, &paused.id, InstanceStatus::Paused).await;
        h.stores
            .instances
            .modify(&broken.id, |i| {
                i.desired_manifest = "{not json".to_string();
                Ok(())
            })
            .await
            .unwrap();

        let response = rollout.promote(&running.id, "staging", Some("ops")).await.unwrap();
        assert_eq!(response.from_environment, "dev");
        assert_eq!(response.to_environment, "staging");
        assert_eq!(response.promoted, 2);
        assert_eq!(response.reconciling, 1);
        assert_eq!(response.skipped, 1);
        assert_eq!(response.failed, 0);

        let running = h.stores.instances.load(&running.id).await.unwrap().value;
        assert_eq!(running.status, InstanceStatus::Pending);
        assert_eq!(running.manifest().unwrap().environment(), Some("staging"));
        let paused = h.stores.instances.load(&paused.id).await.unwrap().value;
        assert_eq!(paused.status, InstanceStatus::Paused);
    }

    #[tokio::test]
    async fn test_promote_rejects_off_chain_without_mutation() {
        let h = harness(docker_runner());
        let rollout = RolloutOrchestrator::new(h.engine.clone());
        let dev = member(&h, "dev", "f-1", json!({"environment": "dev"})).await;
        let prod = member(&h, "prod", "f-2", json!({"environment": "prod"})).await;

        assert!(matches!(
            rollout.promote(&dev.id, "prod", None).await,
            Err(FleetError::InvalidState(_))
        ));
        assert!(matches!(
            rollout.promote(&prod.id, "staging", None).await,
            Err(FleetError::InvalidState(_))
        ));
        assert!(rollout.promote(&dev.id, "qa", None).await.is_err());

        for id in [&dev.id, &prod.id] {
            assert_eq!(h.stores.instances.load(id).await.unwrap().value.manifest_version, 1);
        }
        assert!(h.audit.with_action("instance.promote").is_empty());
    }

    #[tokio::test]
    async fn test_promote_resumes_after_partial_run() {
        let h = harness(docker_runner());
        let rollout = RolloutOrchestrator::new(h.engine.clone());
        let anchor = member(&h, "anchor", "f-1", json!({"environment": "dev"})).await;
        let done = member(&h, "done", "f-1", json!({"environment": "staging"})).await;
        set_status(&h, &anchor.id, InstanceStatus::Running).await;
        set_status(&h, &done.id, InstanceStatus::Running).await;

        let response = rollout.promote(&anchor.id, "staging", None).await.unwrap();
        assert_eq!(response.promoted, 2);
        assert_eq!(response.reconciling, 1);

        let done = h.stores.instances.load(&done.id).await.unwrap().value;
        assert_eq!(done.status, InstanceStatus::Running);
        assert_eq!(done.manifest_version, 1);
    }

    #[tokio::test]
    async fn test_promote_rerun_after_anchor_promoted() {
        let h = harness(docker_runner());
        let rollout = RolloutOrchestrator::new(h.engine.clone());
        let anchor = member(&h, "anchor", "f-1", json!({"environment": "staging"})).await;
        let behind = member(&h, "behind", "f-1", json!({"environment": "dev"})).await;
        set_status(&h, &anchor.id, InstanceStatus::Running).await;
        set_status(&h, &behind.id, InstanceStatus::Running).await;

        let response = rollout.promote(&anchor.id, "staging", None).await.unwrap();
        assert_eq!(response.from_environment, "dev");
        assert_eq!(response.promoted, 2);
        assert_eq!(response.reconciling, 1);

        let behind = h.stores.instances.load(&behind.id).await.unwrap().value;
        assert_eq!(behind.manifest().unwrap().environment(), Some("staging"));
        assert_eq!(behind.status, InstanceStatus::Pending);

        // dev has nothing before it
        let first = member(&h, "first", "f-2", json!({"environment": "dev"})).await;
        assert!(matches!(
            rollout.promote(&first.id, "dev", None).await,
            Err(FleetError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_promote_out_of_prod_is_rejected() {
        let h = harness(docker_runner());
        let rollout = RolloutOrchestrator::new(h.engine.clone());
        let anchor = member(&h, "anchor", "f-1", json!({"environment": "prod"})).await;
        let laggard = member(&h, "laggard", "f-1", json!({"environment": "dev"})).await;
        set_status(&h, &laggard.id, InstanceStatus::Running).await;

        assert!(matches!(
            rollout.promote(&anchor.id, "prod", None).await,
            Err(FleetError::InvalidState(_))
        ));

        let laggard = h.stores.instances.load(&laggard.id).await.unwrap().value;
        assert_eq!(laggard.manifest().unwrap().environment(), Some("dev"));
        assert_eq!(laggard.status, InstanceStatus::Running);
        assert_eq!(laggard.manifest_version, 1);
        assert!(h.audit.with_action("instance.promote").is_empty());
    }

    #[tokio::test]
    async fn test_promote_moves_members_one_step_only() {
        let h = harness(docker_runner());
        let rollout = RolloutOrchestrator::new(h.engine.clone());
        let anchor = member(&h, "anchor", "f-1", json!({"environment": "staging"})).await;
        let dev = member(&h, "dev", "f-1", json!({"environment": "dev"})).await;
        let staging = member(&h, "staging", "f-1", json!({"environment": "staging"})).await;
        set_status(&h, &dev.id, InstanceStatus::Running).await;
        set_status(&h, &staging.id, InstanceStatus::Running).await;

        let response = rollout.promote(&anchor.id, "prod", None).await.unwrap();
        assert_eq!(response.from_environment, "staging");
        assert_eq!(response.promoted, 2);
        assert_eq!(response.reconciling, 1);
        assert_eq!(response.skipped, 1);

        let dev = h.stores.instances.load(&dev.id).await.unwrap().value;
        assert_eq!(dev.manifest().unwrap().environment(), Some("dev"));
        assert_eq!(dev.status, InstanceStatus::Running);
        let staging = h.stores.instances.load(&staging.id).await.unwrap().value;
        assert_eq!(staging.manifest().unwrap().environment(), Some("prod"));
        assert_eq!(staging.status, InstanceStatus::Pending);
    }
}
