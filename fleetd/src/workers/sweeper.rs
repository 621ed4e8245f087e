//! Stuck-instance sweeper
//!
//! Reconciliation is guarded by status rather than a lock, so a crash in the
//! middle of a pass leaves the instance CREATING or RECONCILING. The sweeper
//! requeues those once they exceed the threshold.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::reconcile::ReconcileEngine;

#[derive(Debug, Clone)]
pub struct Options {
    pub interval: Duration,
    pub stuck_threshold: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
            stuck_threshold: Duration::from_secs(900),
        }
    }
}

pub async fn run<S, F>(
    options: &Options,
    engine: &ReconcileEngine,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!(
        "Sweeper worker starting (threshold {:?})...",
        options.stuck_threshold
    );

    loop {
        // Sweep first: a restart is exactly when stuck instances exist
        match engine.sweep_stuck(options.stuck_threshold).await {
            Ok(requeued) if !requeued.is_empty() => {
                warn!("Requeued {} stuck instances", requeued.len())
            }
            Ok(_) => {}
            Err(e) => error!("Sweep failed: {}", e),
        }

        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Sweeper worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }
    }
}
