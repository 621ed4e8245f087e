//! Instance lifecycle state machine
//!
//! Every status change of an instance goes through [`transition`]. Callers
//! apply it inside a conditional store write, so the state machine doubles
//! as the per-instance reconciliation guard.

use crate::errors::FleetError;
use crate::models::InstanceStatus;

/// Something that moves an instance between states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceEvent {
    /// Claim a pending instance; `first` when nothing has been deployed yet
    BeginReconcile { first: bool },
    ReconcileSucceeded,
    ReconcileFailed(String),
    /// A lifecycle call outside reconciliation failed
    Fault(String),
    HealthPassed,
    HealthFailed,
    Pause,
    Resume,
    Drain,
    /// Explicit re-trigger, also used by promotion
    Requeue,
    /// In-flight reconciliation exceeded the stuck threshold
    TimedOut,
    Delete,
}

impl InstanceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            InstanceEvent::BeginReconcile { .. } => "begin_reconcile",
            InstanceEvent::ReconcileSucceeded => "reconcile_succeeded",
            InstanceEvent::ReconcileFailed(_) => "reconcile_failed",
            InstanceEvent::Fault(_) => "fault",
            InstanceEvent::HealthPassed => "health_passed",
            InstanceEvent::HealthFailed => "health_failed",
            InstanceEvent::Pause => "pause",
            InstanceEvent::Resume => "resume",
            InstanceEvent::Drain => "drain",
            InstanceEvent::Requeue => "requeue",
            InstanceEvent::TimedOut => "timed_out",
            InstanceEvent::Delete => "delete",
        }
    }
}

/// Next status for `event` in `status`, or [`FleetError::InvalidState`]
pub fn transition(status: InstanceStatus, event: &InstanceEvent) -> Result<InstanceStatus, FleetError> {
    use InstanceStatus::*;

    let next = match (status, event) {
        (Pending, InstanceEvent::BeginReconcile { first: true }) => Creating,
        (Pending, InstanceEvent::BeginReconcile { first: false }) => Reconciling,

        (Creating | Reconciling, InstanceEvent::ReconcileSucceeded) => Running,
        (Creating | Reconciling, InstanceEvent::ReconcileFailed(_)) => Error,
        (Creating | Reconciling, InstanceEvent::TimedOut) => Pending,

        (Running | Degraded, InstanceEvent::HealthPassed) => Running,
        (Running | Degraded, InstanceEvent::HealthFailed) => Degraded,

        (Running | Degraded, InstanceEvent::Pause) => Paused,
        (Running | Degraded | Paused, InstanceEvent::Drain) => Draining,
        (Paused | Draining, InstanceEvent::Resume) => Pending,
        (Paused | Draining, InstanceEvent::Fault(_)) => Error,

        (Pending | Running | Degraded | Error, InstanceEvent::Requeue) => Pending,

        (_, InstanceEvent::Delete) => Deleting,

        (status, event) => {
            return Err(FleetError::InvalidState(format!(
                "cannot {} an instance in {}",
                event.name(),
                status
            )));
        }
    };
    Ok(next)
}

/// Whether `event` is accepted in `status`
pub fn can_apply(status: InstanceStatus, event: &InstanceEvent) -> bool {
    transition(status, event).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceStatus::*;

    #[test]
    fn test_happy_path() {
        let mut status = Pending;
        status = transition(status, &InstanceEvent::BeginReconcile { first: true }).unwrap();
        assert_eq!(status, Creating);
        status = transition(status, &InstanceEvent::ReconcileSucceeded).unwrap();
        assert_eq!(status, Running);
        status = transition(status, &InstanceEvent::HealthFailed).unwrap();
        assert_eq!(status, Degraded);
        status = transition(status, &InstanceEvent::HealthPassed).unwrap();
        assert_eq!(status, Running);
        status = transition(status, &InstanceEvent::Requeue).unwrap();
        assert_eq!(status, Pending);
        status = transition(status, &InstanceEvent::BeginReconcile { first: false }).unwrap();
        assert_eq!(status, Reconciling);
    }

    #[test]
    fn test_guarded_states_cannot_be_claimed_again() {
        for status in [Creating, Reconciling] {
            assert!(!can_apply(status, &InstanceEvent::BeginReconcile { first: false }));
            assert!(!can_apply(status, &InstanceEvent::Requeue));
        }
    }

    #[test]
    fn test_failure_needs_explicit_requeue() {
        let status = transition(Reconciling, &InstanceEvent::ReconcileFailed("boom".into())).unwrap();
        assert_eq!(status, Error);
        assert!(!can_apply(status, &InstanceEvent::BeginReconcile { first: false }));
        assert_eq!(transition(status, &InstanceEvent::Requeue).unwrap(), Pending);
    }

    #[test]
    fn test_pause_resume_drain() {
        assert_eq!(transition(Running, &InstanceEvent::Pause).unwrap(), Paused);
        assert_eq!(transition(Paused, &InstanceEvent::Resume).unwrap(), Pending);
        assert_eq!(transition(Paused, &InstanceEvent::Drain).unwrap(), Draining);
        assert!(transition(Pending, &InstanceEvent::Pause).is_err());
        assert!(transition(Running, &InstanceEvent::Resume).is_err());
    }

    #[test]
    fn test_stuck_instances_requeue() {
        assert_eq!(transition(Reconciling, &InstanceEvent::TimedOut).unwrap(), Pending);
        assert_eq!(transition(Creating, &InstanceEvent::TimedOut).unwrap(), Pending);
        assert!(transition(Running, &InstanceEvent::TimedOut).is_err());
    }

    #[test]
    fn test_delete_from_anywhere() {
        for status in [Creating, Pending, Running, Degraded, Paused, Draining, Reconciling, Error, Deleting] {
            assert_eq!(transition(status, &InstanceEvent::Delete).unwrap(), Deleting);
        }
        let err = transition(Deleting, &InstanceEvent::Requeue).unwrap_err();
        assert!(err.to_string().contains("cannot requeue an instance in DELETING"));
    }
}
