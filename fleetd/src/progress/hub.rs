//! Provisioning progress hub
//!
//! A single task owns every instance's progress record and log ring. The
//! reconciler and providers send it commands without waiting; observers
//! subscribe and get the buffered backlog plus a broadcast receiver created
//! at the same point in the command stream, so no event is lost or repeated
//! between the two.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::Utc;
use openapi_server::{
    LogStream, ProgressStatus, ProgressStep, ProvisioningLogLine, ProvisioningProgress, ServerEvent,
    StepStatus,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::retry::StepEvent;

#[derive(Debug, Clone)]
pub struct Options {
    /// Log lines kept per instance; oldest are evicted first
    pub log_capacity: usize,
    /// How long terminal records stay queryable
    pub retention: Duration,
    pub gc_interval: Duration,
    /// Live events buffered per subscriber before it starts lagging
    pub subscriber_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            log_capacity: 500,
            retention: Duration::from_secs(300),
            gc_interval: Duration::from_secs(30),
            subscriber_capacity: 256,
        }
    }
}

/// What a new subscriber receives
#[derive(Debug)]
pub struct Subscription {
    pub snapshot: Option<ProvisioningProgress>,
    pub backlog: Vec<ProvisioningLogLine>,
    pub events: broadcast::Receiver<ServerEvent>,
}

enum Command {
    Begin {
        instance_id: String,
        steps: Vec<ProgressStep>,
    },
    Step {
        instance_id: String,
        step_id: String,
        status: StepStatus,
        message: Option<String>,
    },
    Log {
        instance_id: String,
        step_id: Option<String>,
        stream: LogStream,
        line: String,
    },
    Finish {
        instance_id: String,
        status: ProgressStatus,
        error: Option<String>,
    },
    Get {
        instance_id: String,
        reply: oneshot::Sender<Option<ProvisioningProgress>>,
    },
    Subscribe {
        instance_id: String,
        reply: oneshot::Sender<Subscription>,
    },
}

struct Entry {
    progress: Option<ProvisioningProgress>,
    logs: VecDeque<ProvisioningLogLine>,
    next_seq: u64,
    events: broadcast::Sender<ServerEvent>,
    finished_at: Option<Instant>,
}

impl Entry {
    fn new(subscriber_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(subscriber_capacity.max(1));
        Self {
            progress: None,
            logs: VecDeque::new(),
            next_seq: 0,
            events,
            finished_at: None,
        }
    }

    /// Lagging or absent receivers never block the sender
    fn publish(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    fn publish_progress(&self) {
        if let Some(progress) = &self.progress {
            self.publish(ServerEvent::Progress(progress.clone()));
        }
    }
}

struct Hub {
    options: Options,
    entries: HashMap<String, Entry>,
}

impl Hub {
    fn entry(&mut self, instance_id: &str) -> &mut Entry {
        let capacity = self.options.subscriber_capacity;
        self.entries
            .entry(instance_id.to_string())
            .or_insert_with(|| Entry::new(capacity))
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Begin { instance_id, steps } => self.begin(&instance_id, steps),
            Command::Step {
                instance_id,
                step_id,
                status,
                message,
            } => self.step(&instance_id, &step_id, status, message),
            Command::Log {
                instance_id,
                step_id,
                stream,
                line,
            } => self.log(&instance_id, step_id, stream, line),
            Command::Finish {
                instance_id,
                status,
                error,
            } => self.finish(&instance_id, status, error),
            Command::Get { instance_id, reply } => {
                let progress = self.entries.get(&instance_id).and_then(|e| e.progress.clone());
                let _ = reply.send(progress);
            }
            Command::Subscribe { instance_id, reply } => {
                let entry = self.entry(&instance_id);
                let subscription = Subscription {
                    snapshot: entry.progress.clone(),
                    backlog: entry.logs.iter().cloned().collect(),
                    events: entry.events.subscribe(),
                };
                let _ = reply.send(subscription);
            }
        }
    }

    /// A new operation replaces any previous record but keeps subscribers
    fn begin(&mut self, instance_id: &str, steps: Vec<ProgressStep>) {
        let entry = self.entry(instance_id);
        let now = Utc::now();
        entry.progress = Some(ProvisioningProgress {
            instance_id: instance_id.to_string(),
            status: ProgressStatus::InProgress,
            steps,
            current_step: None,
            error: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        });
        entry.logs.clear();
        entry.finished_at = None;
        entry.publish_progress();
    }

    fn step(&mut self, instance_id: &str, step_id: &str, status: StepStatus, message: Option<String>) {
        let entry = self.entry(instance_id);
        let Some(progress) = entry.progress.as_mut() else {
            debug!(instance_id = %instance_id, "Step {} reported without an active record", step_id);
            return;
        };
        if progress.status.is_terminal() {
            warn!(instance_id = %instance_id, "Ignoring step {} after completion", step_id);
            return;
        }

        let now = Utc::now();
        let index = match progress.steps.iter().position(|s| s.id == step_id) {
            Some(index) => index,
            None => {
                progress.steps.push(ProgressStep::pending(step_id, step_id));
                progress.steps.len() - 1
            }
        };
        let step = &mut progress.steps[index];
        if !step.status.can_transition_to(status) {
            warn!(
                instance_id = %instance_id,
                step = step_id,
                from = ?step.status,
                to = ?status,
                "Ignoring invalid step transition"
            );
            return;
        }
        step.status = status;
        if status == StepStatus::InProgress {
            step.started_at = Some(now);
            progress.current_step = Some(step_id.to_string());
        } else {
            step.completed_at = Some(now);
        }
        if message.is_some() {
            step.message = message;
        }
        progress.updated_at = now;
        entry.publish_progress();
    }

    fn log(&mut self, instance_id: &str, step_id: Option<String>, stream: LogStream, line: String) {
        let capacity = self.options.log_capacity;
        let entry = self.entry(instance_id);
        let log = ProvisioningLogLine {
            instance_id: instance_id.to_string(),
            seq: entry.next_seq,
            step_id,
            stream,
            line,
            timestamp: Utc::now(),
        };
        entry.next_seq += 1;
        while entry.logs.len() >= capacity {
            entry.logs.pop_front();
        }
        if capacity > 0 {
            entry.logs.push_back(log.clone());
        }
        entry.publish(ServerEvent::ProvisioningLog(log));
    }

    fn finish(&mut self, instance_id: &str, status: ProgressStatus, error: Option<String>) {
        let entry = self.entry(instance_id);
        let Some(progress) = entry.progress.as_mut() else {
            return;
        };
        let now = Utc::now();
        progress.status = status;
        progress.error = error;
        progress.updated_at = now;
        progress.completed_at = Some(now);
        progress.current_step = None;
        entry.finished_at = Some(Instant::now());
        entry.publish_progress();
    }

    /// Drop terminal records past retention, and idle entries nobody watches
    fn gc(&mut self, now: Instant) -> usize {
        let retention = self.options.retention;
        let before = self.entries.len();
        self.entries.retain(|_, entry| match entry.finished_at {
            Some(finished) => now.duration_since(finished) < retention,
            None => entry.progress.is_some() || entry.events.receiver_count() > 0,
        });
        before - self.entries.len()
    }
}

/// Handle to the progress hub task
#[derive(Clone)]
pub struct ProgressHub {
    tx: mpsc::UnboundedSender<Command>,
}

impl ProgressHub {
    /// Start the hub task; it stops when shutdown resolves or every handle is dropped
    pub fn spawn(
        options: Options,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            let mut gc_timer = tokio::time::interval(options.gc_interval);
            let mut hub = Hub {
                options,
                entries: HashMap::new(),
            };
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    _ = &mut shutdown => {
                        info!("Progress hub shutting down...");
                        return;
                    }
                    command = rx.recv() => match command {
                        Some(command) => hub.handle(command),
                        None => return,
                    },
                    _ = gc_timer.tick() => {
                        let evicted = hub.gc(Instant::now());
                        if evicted > 0 {
                            debug!("Evicted {} provisioning records", evicted);
                        }
                    }
                }
            }
        });
        (Self { tx }, handle)
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            debug!("Progress hub stopped; dropping update");
        }
    }

    pub fn begin(&self, instance_id: &str, steps: &[(&str, &str)]) {
        self.send(Command::Begin {
            instance_id: instance_id.to_string(),
            steps: steps
                .iter()
                .map(|(id, label)| ProgressStep::pending(*id, *label))
                .collect(),
        });
    }

    pub fn step(&self, instance_id: &str, step_id: &str, status: StepStatus, message: Option<String>) {
        self.send(Command::Step {
            instance_id: instance_id.to_string(),
            step_id: step_id.to_string(),
            status,
            message,
        });
    }

    pub fn log(&self, instance_id: &str, step_id: Option<&str>, stream: LogStream, line: impl Into<String>) {
        self.send(Command::Log {
            instance_id: instance_id.to_string(),
            step_id: step_id.map(str::to_string),
            stream,
            line: line.into(),
        });
    }

    pub fn finish(&self, instance_id: &str, status: ProgressStatus, error: Option<String>) {
        self.send(Command::Finish {
            instance_id: instance_id.to_string(),
            status,
            error,
        });
    }

    /// Forward a step tracker's events for one instance
    pub fn forward(&self, instance_id: &str, event: &StepEvent) {
        match event {
            StepEvent::Started { step_id } => self.step(instance_id, step_id, StepStatus::InProgress, None),
            StepEvent::Completed { step_id, message } => {
                self.step(instance_id, step_id, StepStatus::Completed, message.clone())
            }
            StepEvent::Failed { step_id, message } => {
                self.step(instance_id, step_id, StepStatus::Error, Some(message.clone()))
            }
            StepEvent::Skipped { step_id, reason } => {
                self.step(instance_id, step_id, StepStatus::Skipped, reason.clone())
            }
            StepEvent::Log { step_id, stream, line } => {
                self.log(instance_id, step_id.as_deref(), *stream, line.clone())
            }
        }
    }

    pub async fn get(&self, instance_id: &str) -> Option<ProvisioningProgress> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Get {
            instance_id: instance_id.to_string(),
            reply,
        });
        rx.await.ok().flatten()
    }

    /// Snapshot or the "unknown" sentinel
    pub async fn status(&self, instance_id: &str) -> ProvisioningProgress {
        match self.get(instance_id).await {
            Some(progress) => progress,
            None => ProvisioningProgress::unknown(instance_id),
        }
    }

    /// `None` only when the hub has stopped
    pub async fn subscribe(&self, instance_id: &str) -> Option<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe {
            instance_id: instance_id.to_string(),
            reply,
        });
        rx.await.ok()
    }
}
