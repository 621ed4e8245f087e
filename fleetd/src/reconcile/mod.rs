//! Reconciliation: converging deployed state toward desired manifests

pub mod engine;
pub mod fsm;

pub use engine::{describe_failure, HealthReport, Options, Outcome, ReconcileEngine};
pub use fsm::{can_apply, transition, InstanceEvent};

#[cfg(test)]
pub(crate) mod fixtures {
    use std::sync::Arc;

    use crate::audit::{Auditor, MemoryAuditSink};
    use crate::preprocess::{Pipeline, ToolCapabilityPreprocessor};
    use crate::progress::{hub, ProgressHub};
    use crate::providers::command::{CommandOutput, ScriptedRunner};
    use crate::providers::ProviderRegistry;
    use crate::retry::RetryOptions;
    use crate::store::Stores;
    use crate::vault::local::{LocalEncryptedStore, StaticKeyStore};

    use super::{Options, ReconcileEngine};

    pub const INSPECT: &str = r#"[{
        "Id": "abc123",
        "Name": "/fleet-bot-12345678",
        "Created": "2026-03-01T10:00:00.000000000Z",
        "State": {"Status": "running", "Restarting": false},
        "Config": {"Image": "fleet/bot:1", "Labels": {"managed-by": "fleetd"}},
        "NetworkSettings": {"IPAddress": "172.17.0.2"}
    }]"#;

    /// Docker CLI answering a first deploy of any instance
    pub fn docker_runner() -> ScriptedRunner {
        docker_rules(ScriptedRunner::new())
    }

    /// Append the deploy answers after rules already on `runner`
    pub fn docker_rules(runner: ScriptedRunner) -> ScriptedRunner {
        runner
            .on("inspect --type container fleet-", CommandOutput::failed(1, "Error: No such object"))
            .on("run -d", CommandOutput::ok("abc123\n"))
            .on("inspect --type container abc123", CommandOutput::ok(INSPECT))
    }

    pub struct Harness {
        pub engine: Arc<ReconcileEngine>,
        pub stores: Stores,
        pub audit: Arc<MemoryAuditSink>,
        pub runner: Arc<ScriptedRunner>,
        pub progress: ProgressHub,
    }

    pub fn harness(runner: ScriptedRunner) -> Harness {
        harness_with(runner, Stores::in_memory())
    }

    pub fn harness_with(runner: ScriptedRunner, stores: Stores) -> Harness {
        let runner = Arc::new(runner);
        let local_vault = Arc::new(LocalEncryptedStore::new(
            stores.repo(),
            Arc::new(StaticKeyStore::generate()),
        ));
        let registry = ProviderRegistry::new(runner.clone(), local_vault)
            .with_retry(RetryOptions::immediate(1));
        let audit = Arc::new(MemoryAuditSink::new());
        let (progress, _) = ProgressHub::spawn(hub::Options::default(), std::future::pending());
        let pipeline = Pipeline::new(vec![Arc::new(ToolCapabilityPreprocessor::default())]);
        let engine = Arc::new(ReconcileEngine::new(
            stores.clone(),
            registry,
            pipeline,
            Auditor::new(audit.clone()),
            progress.clone(),
            Options::default(),
        ));
        Harness {
            engine,
            stores,
            audit,
            runner,
            progress,
        }
    }
}
