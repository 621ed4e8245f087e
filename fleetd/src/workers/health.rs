//! Health worker: checks running instances on a fixed interval

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::reconcile::ReconcileEngine;

#[derive(Debug, Clone)]
pub struct Options {
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
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
    info!("Health worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Health worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        match engine.check_health().await {
            Ok(report) => debug!(
                "Health pass: {} checked, {} healthy, {} degraded",
                report.checked, report.healthy, report.degraded
            ),
            Err(e) => error!("Health pass failed: {}", e),
        }
    }
}
