//! Step-progress tracker
//!
//! Providers and the reconciler report named steps through a tracker; the
//! callback decides where the events go (the progress hub, a log, nowhere).

use std::sync::{Arc, Mutex};

use openapi_server::{LogStream, StepStatus};
use tracing::warn;

/// A step transition or a log line emitted while a step runs
#[derive(Debug, Clone, PartialEq)]
pub enum StepEvent {
    Started { step_id: String },
    Completed { step_id: String, message: Option<String> },
    Failed { step_id: String, message: String },
    Skipped { step_id: String, reason: Option<String> },
    Log { step_id: Option<String>, stream: LogStream, line: String },
}

pub type ProgressCallback = Arc<dyn Fn(&StepEvent) + Send + Sync>;

/// Tracks the ordered steps of one operation
pub struct StepTracker {
    steps: Mutex<Vec<(String, StepStatus)>>,
    current: Mutex<Option<String>>,
    callback: Option<ProgressCallback>,
}

impl StepTracker {
    /// Track `step_ids` in order, reporting every transition to `callback`
    pub fn new(step_ids: &[&str], callback: Option<ProgressCallback>) -> Self {
        Self {
            steps: Mutex::new(
                step_ids
                    .iter()
                    .map(|id| (id.to_string(), StepStatus::Pending))
                    .collect(),
            ),
            current: Mutex::new(None),
            callback,
        }
    }

    /// A tracker that records state but reports nowhere
    pub fn silent(step_ids: &[&str]) -> Self {
        Self::new(step_ids, None)
    }

    pub fn status(&self, step_id: &str) -> Option<StepStatus> {
        let steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
        steps.iter().find(|(id, _)| id == step_id).map(|(_, s)| *s)
    }

    /// The step that is running, else the last one that started
    pub fn current_step(&self) -> Option<String> {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn transition(&self, step_id: &str, next: StepStatus) -> bool {
        let mut steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
        match steps.iter_mut().find(|(id, _)| id == step_id) {
            Some((_, status)) if status.can_transition_to(next) => {
                *status = next;
                true
            }
            Some((_, status)) => {
                warn!(step = step_id, from = ?status, to = ?next, "Ignoring invalid step transition");
                false
            }
            None => {
                // Unknown steps are appended so ad-hoc steps still get reported
                steps.push((step_id.to_string(), next));
                true
            }
        }
    }

    fn emit(&self, event: StepEvent) {
        if let Some(callback) = &self.callback {
            callback(&event);
        }
    }

    pub fn start(&self, step_id: &str) {
        if self.transition(step_id, StepStatus::InProgress) {
            *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(step_id.to_string());
            self.emit(StepEvent::Started {
                step_id: step_id.to_string(),
            });
        }
    }

    pub fn complete(&self, step_id: &str, message: Option<String>) {
        if self.transition(step_id, StepStatus::Completed) {
            self.emit(StepEvent::Completed {
                step_id: step_id.to_string(),
                message,
            });
        }
    }

    /// Mark a step failed. Steps after it are left pending
    pub fn fail(&self, step_id: &str, message: impl Into<String>) {
        if self.transition(step_id, StepStatus::Error) {
            self.emit(StepEvent::Failed {
                step_id: step_id.to_string(),
                message: message.into(),
            });
        }
    }

    pub fn skip(&self, step_id: &str, reason: Option<String>) {
        if self.transition(step_id, StepStatus::Skipped) {
            self.emit(StepEvent::Skipped {
                step_id: step_id.to_string(),
                reason,
            });
        }
    }

    /// Log a line against the current step
    pub fn log(&self, stream: LogStream, line: impl Into<String>) {
        self.emit(StepEvent::Log {
            step_id: self.current_step(),
            stream,
            line: line.into(),
        });
    }

    pub fn info(&self, line: impl Into<String>) {
        self.log(LogStream::Stdout, line);
    }

    /// Skip every step that never started
    pub fn skip_remaining(&self, reason: &str) {
        let pending: Vec<String> = {
            let steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
            steps
                .iter()
                .filter(|(_, s)| *s == StepStatus::Pending)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for step_id in pending {
            self.skip(&step_id, Some(reason.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_reports_in_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let tracker = StepTracker::new(
            &["network", "logs"],
            Some(Arc::new(move |e: &StepEvent| sink.lock().unwrap().push(e.clone()))),
        );

        tracker.start("network");
        tracker.info("creating network");
        tracker.complete("network", None);
        tracker.skip_remaining("not needed");

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[1], StepEvent::Log { step_id: Some(s), .. } if s == "network"));
        assert!(matches!(&events[3], StepEvent::Skipped { step_id, .. } if step_id == "logs"));
    }

    #[test]
    fn test_invalid_transition_ignored() {
        let tracker = StepTracker::silent(&["deploy"]);
        tracker.complete("deploy", None);
        assert_eq!(tracker.status("deploy"), Some(StepStatus::Pending));
        tracker.start("deploy");
        tracker.complete("deploy", None);
        assert_eq!(tracker.status("deploy"), Some(StepStatus::Completed));
    }
}
