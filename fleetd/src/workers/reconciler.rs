//! Reconciler worker
//!
//! Reconciles PENDING and DELETING instances on a fixed interval, and
//! immediately whenever a request wakes the engine.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::reconcile::{Outcome, ReconcileEngine};

#[derive(Debug, Clone)]
pub struct Options {
    pub interval: Duration,
    /// Delay before the first pass
    pub initial_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            initial_delay: Duration::from_secs(1),
        }
    }
}

/// Run the reconciler worker
pub async fn run<S, F>(
    options: &Options,
    engine: &ReconcileEngine,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Reconciler worker starting...");

    tokio::select! {
        _ = &mut shutdown_signal => {
            info!("Reconciler worker shutting down...");
            return;
        }
        _ = sleep_fn(options.initial_delay) => {}
    }

    loop {
        match engine.reconcile_pending().await {
            Ok(outcomes) if !outcomes.is_empty() => {
                let failed = outcomes
                    .iter()
                    .filter(|(_, o)| matches!(o, Outcome::Failed(_)))
                    .count();
                info!("Reconcile pass: {} instances, {} failed", outcomes.len(), failed);
            }
            Ok(_) => debug!("Nothing to reconcile"),
            Err(e) => error!("Reconcile pass failed: {}", e),
        }

        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Reconciler worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
            _ = engine.woken() => debug!("Reconciler woken"),
        }
    }
}
