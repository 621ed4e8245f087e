//! Application state management

use std::future::Future;
use std::sync::Arc;

use secrecy::SecretString;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::audit::{AuditSink, Auditor, HttpAuditSink, LogAuditSink, MemoryAuditSink};
use crate::errors::FleetError;
use crate::http::client::HttpClient;
use crate::preprocess::{Pipeline, Preprocessor, SkillDirsPreprocessor, ToolCapabilityPreprocessor};
use crate::progress::ProgressHub;
use crate::providers::{CommandRunner, ProcessRunner, ProviderRegistry};
use crate::reconcile::ReconcileEngine;
use crate::retry::RetryOptions;
use crate::rollout::RolloutOrchestrator;
use crate::storage::settings::{AuditKind, StoreKind};
use crate::store::{HttpRecordStore, MemoryStore, RecordStore, Stores};
use crate::vault::{KeyStore, LocalEncryptedStore, StaticKeyStore, VaultRouter};

/// Main application state
pub struct AppState {
    pub stores: Stores,
    pub engine: Arc<ReconcileEngine>,
    pub rollout: Arc<RolloutOrchestrator>,
    pub vault: VaultRouter,
    pub progress: ProgressHub,
    /// Default workspace for new instances
    pub workspace: String,
}

impl AppState {
    /// Wire the core components. The returned handle is the progress hub
    /// task, which stops when `shutdown` resolves.
    pub async fn init(
        options: &AppOptions,
        runner: Arc<dyn CommandRunner>,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(Self, JoinHandle<()>), FleetError> {
        info!("Initializing application state...");

        let platform = match &options.store.base_url {
            Some(base_url) => Some(Arc::new(platform_client(base_url, options.store.token_env.as_deref())?)),
            None => None,
        };

        let raw: Arc<dyn RecordStore> = match (options.store.kind, &platform) {
            (StoreKind::Http, Some(client)) => Arc::new(HttpRecordStore::new(client.clone())),
            (StoreKind::Http, None) => {
                return Err(FleetError::ConfigError("http store requires a base url".into()))
            }
            (StoreKind::Memory, _) => {
                warn!("Using the in-memory record store; state is lost on restart");
                Arc::new(MemoryStore::new())
            }
        };
        let stores = Stores::new(raw);

        let sink: Arc<dyn AuditSink> = match (options.audit, &platform) {
            (AuditKind::Http, Some(client)) => Arc::new(HttpAuditSink::new(client.clone())),
            (AuditKind::Http, None) => {
                return Err(FleetError::ConfigError("http audit requires a base url".into()))
            }
            (AuditKind::Memory, _) => Arc::new(MemoryAuditSink::new()),
            (AuditKind::Log, _) => Arc::new(LogAuditSink),
        };

        let keys: Arc<dyn KeyStore> = if std::env::var_os(&options.master_key_env).is_some() {
            Arc::new(StaticKeyStore::from_env(&options.master_key_env)?)
        } else {
            warn!(
                "{} is not set; using an ephemeral vault key, local secrets will not survive a restart",
                options.master_key_env
            );
            Arc::new(StaticKeyStore::generate())
        };
        let local_vault = Arc::new(LocalEncryptedStore::new(stores.repo(), keys));
        let registry = ProviderRegistry::new(runner, local_vault).with_retry(options.retry.clone());

        let mut preprocessors: Vec<Arc<dyn Preprocessor>> = vec![Arc::new(
            ToolCapabilityPreprocessor::new(options.runtime_capability.clone()),
        )];
        if !options.skill_dirs.is_empty() {
            preprocessors.push(Arc::new(SkillDirsPreprocessor::new(options.skill_dirs.clone())));
        }
        let pipeline = Pipeline::new(preprocessors);
        info!("Preprocessors: {}", pipeline.names().join(", "));

        let (progress, progress_handle) = ProgressHub::spawn(options.progress.clone(), shutdown);

        let engine = Arc::new(ReconcileEngine::new(
            stores.clone(),
            registry.clone(),
            pipeline,
            Auditor::new(sink),
            progress.clone(),
            options.engine.clone(),
        ));
        let rollout = Arc::new(RolloutOrchestrator::new(engine.clone()));
        let vault = VaultRouter::new(stores.clone(), registry);

        let state = Self {
            stores,
            engine,
            rollout,
            vault,
            progress,
            workspace: options.workspace.clone(),
        };
        Ok((state, progress_handle))
    }

    /// In-memory state backed by a memory audit sink. Must be called inside a
    /// tokio runtime.
    pub fn in_memory(runner: Arc<dyn CommandRunner>) -> Result<(Self, Arc<MemoryAuditSink>), FleetError> {
        let options = AppOptions {
            retry: RetryOptions::immediate(1),
            ..Default::default()
        };
        let stores = Stores::in_memory();
        let audit = Arc::new(MemoryAuditSink::new());
        let local_vault = Arc::new(LocalEncryptedStore::new(
            stores.repo(),
            Arc::new(StaticKeyStore::generate()),
        ));
        let registry = ProviderRegistry::new(runner, local_vault).with_retry(options.retry.clone());
        let pipeline = Pipeline::new(vec![Arc::new(ToolCapabilityPreprocessor::default())]);
        let (progress, _) = ProgressHub::spawn(options.progress.clone(), std::future::pending());
        let engine = Arc::new(ReconcileEngine::new(
            stores.clone(),
            registry.clone(),
            pipeline,
            Auditor::new(audit.clone()),
            progress.clone(),
            options.engine.clone(),
        ));
        let state = Self {
            rollout: Arc::new(RolloutOrchestrator::new(engine.clone())),
            vault: VaultRouter::new(stores.clone(), registry),
            stores,
            engine,
            progress,
            workspace: options.workspace,
        };
        Ok((state, audit))
    }

    /// Default runner for production: real child processes
    pub fn process_runner() -> Arc<dyn CommandRunner> {
        Arc::new(ProcessRunner::default())
    }

    pub async fn shutdown(&self) -> Result<(), FleetError> {
        info!("Shutting down application state...");
        Ok(())
    }
}

fn platform_client(base_url: &str, token_env: Option<&str>) -> Result<HttpClient, FleetError> {
    match token_env.and_then(|var| std::env::var(var).ok()) {
        Some(token) => HttpClient::with_token(base_url, SecretString::from(token)),
        None => HttpClient::new(base_url),
    }
}
