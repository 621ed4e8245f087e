//! Change-set model
//!
//! A change-set tracks moving a group of instances from one manifest to
//! another. The counter and status rules live here as pure methods; the
//! rollout orchestrator persists the results with conditional writes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::FleetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RolloutStrategy {
    All,
    Percentage,
    Canary,
}

impl FromStr for RolloutStrategy {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ALL" => Ok(RolloutStrategy::All),
            "PERCENTAGE" => Ok(RolloutStrategy::Percentage),
            "CANARY" => Ok(RolloutStrategy::Canary),
            other => Err(FleetError::ValidationError(format!(
                "Unknown rollout strategy: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeSetStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ChangeSetStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChangeSetStatus::Completed | ChangeSetStatus::Failed)
    }
}

impl fmt::Display for ChangeSetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeSetStatus::Pending => "PENDING",
            ChangeSetStatus::InProgress => "IN_PROGRESS",
            ChangeSetStatus::Completed => "COMPLETED",
            ChangeSetStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// A tracked manifest transition for one or more instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    pub id: String,
    /// Instance the change-set was initiated from
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fleet_id: Option<String>,
    pub from_manifest: Value,
    pub to_manifest: Value,
    pub rollout_strategy: RolloutStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_percentage: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary_instances: Option<Vec<String>>,
    /// Instances selected when the change-set was created
    #[serde(default)]
    pub target_instances: Vec<String>,
    pub status: ChangeSetStatus,
    pub total_instances: u32,
    #[serde(default)]
    pub updated_instances: u32,
    #[serde(default)]
    pub failed_instances: u32,
    #[serde(default)]
    pub can_rollback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolled_back_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolled_back_by: Option<String>,
    /// Set on a change-set produced by rolling back another one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_of: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_reason: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ChangeSet {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance_id: impl Into<String>,
        fleet_id: Option<String>,
        from_manifest: Value,
        to_manifest: Value,
        rollout_strategy: RolloutStrategy,
        rollout_percentage: Option<u32>,
        canary_instances: Option<Vec<String>>,
        total_instances: u32,
        created_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: crate::utils::generate_uuid(),
            instance_id: instance_id.into(),
            fleet_id,
            from_manifest,
            to_manifest,
            rollout_strategy,
            rollout_percentage,
            canary_instances,
            target_instances: Vec::new(),
            status: ChangeSetStatus::Pending,
            total_instances,
            updated_instances: 0,
            failed_instances: 0,
            can_rollback: false,
            rolled_back_at: None,
            rolled_back_by: None,
            rollback_of: None,
            rollback_reason: None,
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.total_instances
            .saturating_sub(self.updated_instances + self.failed_instances)
    }

    /// PENDING -> IN_PROGRESS; every other source state is rejected
    pub fn start(&mut self) -> Result<(), FleetError> {
        if self.status != ChangeSetStatus::Pending {
            return Err(FleetError::InvalidState(format!(
                "change-set {} cannot start from {}",
                self.id, self.status
            )));
        }
        self.status = ChangeSetStatus::InProgress;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Accumulate counters, clamped so the sum never exceeds the total.
    /// Returns true when this call made the change-set terminal.
    pub fn apply_progress(&mut self, updated: u32, failed: u32) -> Result<bool, FleetError> {
        if self.status != ChangeSetStatus::InProgress {
            return Err(FleetError::InvalidState(format!(
                "change-set {} is {}, progress only applies while IN_PROGRESS",
                self.id, self.status
            )));
        }

        let updated = updated.min(self.remaining());
        self.updated_instances += updated;
        let failed = failed.min(self.remaining());
        self.failed_instances += failed;
        self.updated_at = Utc::now();

        if self.remaining() > 0 {
            return Ok(false);
        }

        if self.failed_instances == 0 {
            self.status = ChangeSetStatus::Completed;
            self.can_rollback = true;
        } else {
            self.status = ChangeSetStatus::Failed;
            self.can_rollback = false;
        }
        self.completed_at = Some(self.updated_at);
        Ok(true)
    }

    pub fn check_rollback(&self) -> Result<(), FleetError> {
        if self.rolled_back_at.is_some() {
            return Err(FleetError::InvalidState(format!(
                "change-set {} was already rolled back",
                self.id
            )));
        }
        if !self.can_rollback || self.status != ChangeSetStatus::Completed {
            return Err(FleetError::InvalidState(format!(
                "change-set {} is {} and cannot be rolled back",
                self.id, self.status
            )));
        }
        Ok(())
    }

    /// New change-set re-applying the prior manifest to the same instances
    pub fn rollback_change_set(&self, reason: &str, actor: &str) -> ChangeSet {
        let mut rollback = ChangeSet::new(
            self.instance_id.clone(),
            self.fleet_id.clone(),
            self.to_manifest.clone(),
            self.from_manifest.clone(),
            RolloutStrategy::All,
            None,
            None,
            self.total_instances,
            actor,
        );
        rollback.target_instances = self.target_instances.clone();
        rollback.rollback_of = Some(self.id.clone());
        rollback.rollback_reason = Some(reason.to_string());
        rollback
    }

    /// Whether the change-set still applies to `instance_id`
    pub fn is_active_for(&self, instance_id: &str) -> bool {
        !self.status.is_terminal()
            && (self.instance_id == instance_id || self.target_instances.iter().any(|t| t == instance_id))
    }

    pub fn mark_rolled_back(&mut self, actor: &str) {
        let now = Utc::now();
        self.rolled_back_at = Some(now);
        self.rolled_back_by = Some(actor.to_string());
        self.can_rollback = false;
        self.updated_at = now;
    }
}

/// Pick the instances a rollout applies to. `candidates` must be sorted by id.
pub fn select_targets(
    strategy: RolloutStrategy,
    percentage: Option<u32>,
    canary: Option<&[String]>,
    candidates: &[String],
) -> Result<Vec<String>, FleetError> {
    match strategy {
        RolloutStrategy::All => Ok(candidates.to_vec()),
        RolloutStrategy::Percentage => {
            let pct = percentage.ok_or_else(|| {
                FleetError::ValidationError("PERCENTAGE rollout requires rolloutPercentage".into())
            })?;
            if pct == 0 || pct > 100 {
                return Err(FleetError::ValidationError(format!(
                    "rolloutPercentage must be within 1..=100, got {}",
                    pct
                )));
            }
            let n = candidates.len() as u64;
            let count = (n * pct as u64).div_ceil(100).max(1).min(n) as usize;
            Ok(candidates[..count].to_vec())
        }
        RolloutStrategy::Canary => {
            let canary = canary.filter(|c| !c.is_empty()).ok_or_else(|| {
                FleetError::ValidationError("CANARY rollout requires canaryInstances".into())
            })?;
            let selected: Vec<String> = candidates
                .iter()
                .filter(|id| canary.contains(id))
                .cloned()
                .collect();
            if selected.is_empty() {
                return Err(FleetError::ValidationError(
                    "none of the canary instances belong to the fleet".into(),
                ));
            }
            Ok(selected)
        }
    }
}
