//! Instance lifecycle driven by the background workers

use std::sync::Arc;
use std::time::Duration;

use fleetd::models::{HealthStatus, Instance, InstanceStatus, Manifest};
use fleetd::providers::ScriptedRunner;
use fleetd::reconcile::ReconcileEngine;
use fleetd::workers::{health, reconciler};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::common::{docker_rules, test_app};

fn spawn_workers(engine: Arc<ReconcileEngine>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
    let mut rx = shutdown.subscribe();
    let reconciler_engine = engine.clone();
    let reconciler_handle = tokio::spawn(async move {
        let options = reconciler::Options {
            interval: Duration::from_millis(50),
            initial_delay: Duration::ZERO,
        };
        reconciler::run(
            &options,
            reconciler_engine.as_ref(),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = rx.recv().await;
            }),
        )
        .await;
    });

    let mut rx = shutdown.subscribe();
    let health_handle = tokio::spawn(async move {
        let options = health::Options {
            interval: Duration::from_millis(20),
        };
        health::run(
            &options,
            engine.as_ref(),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = rx.recv().await;
            }),
        )
        .await;
    });

    vec![reconciler_handle, health_handle]
}

/// Poll until `check` accepts the stored instance (or it is gone, for `None`)
async fn wait_for<F>(engine: &ReconcileEngine, id: &str, check: F) -> Option<Instance>
where
    F: Fn(Option<&Instance>) -> bool,
{
    for _ in 0..250 {
        let current = engine.stores().instances.get(id).await.unwrap().map(|v| v.value);
        if check(current.as_ref()) {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("instance {} never reached the expected state", id);
}

#[tokio::test]
async fn test_deploy_pause_resume_delete() {
    let t = test_app(docker_rules(ScriptedRunner::new()));
    let engine = t.app.engine.clone();
    let (shutdown_tx, _) = broadcast::channel(1);
    let workers = spawn_workers(engine.clone(), &shutdown_tx);

    let manifest = Manifest::from_value(json!({"runtime": {"image": "fleet/bot:1"}})).unwrap();
    let created = engine
        .create_instance(Instance::new("bot", "ws", &manifest, None), Some("ops"))
        .await
        .unwrap();

    let running = wait_for(&engine, &created.id, |i| {
        i.is_some_and(|i| i.status == InstanceStatus::Running && i.health == HealthStatus::Healthy)
    })
    .await
    .unwrap();
    assert_eq!(running.container_id.as_deref(), Some("abc123"));

    let paused = engine.pause(&created.id, Some("ops")).await.unwrap();
    assert_eq!(paused.status, InstanceStatus::Paused);
    assert_eq!(t.runner.calls_matching("stop abc123").len(), 1);

    engine.resume(&created.id, Some("ops")).await.unwrap();
    wait_for(&engine, &created.id, |i| i.is_some_and(|i| i.status == InstanceStatus::Running)).await;

    engine.delete(&created.id, Some("ops")).await.unwrap();
    wait_for(&engine, &created.id, |i| i.is_none()).await;
    assert!(!t.runner.calls_matching("rm -f abc123").is_empty());
    assert_eq!(t.audit.with_action("instance.deleted").len(), 1);

    let _ = shutdown_tx.send(());
    for worker in workers {
        worker.await.unwrap();
    }
}
