//! Application configuration options

use std::time::Duration;

use crate::progress::hub;
use crate::reconcile;
use crate::retry::RetryOptions;
use crate::storage::settings::{AuditKind, Settings, StoreKind};
use crate::workers::{health, reconciler, sweeper};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    pub lifecycle: LifecycleOptions,

    pub store: StoreOptions,

    pub audit: AuditKind,

    /// Environment variable holding the vault master key
    pub master_key_env: String,

    pub enable_server: bool,

    pub server: ServerOptions,

    pub engine: reconcile::Options,

    pub retry: RetryOptions,

    pub progress: hub::Options,

    pub reconciler_worker: reconciler::Options,

    pub health_worker: health::Options,

    pub sweeper_worker: sweeper::Options,

    pub workspace: String,

    pub runtime_capability: String,

    pub skill_dirs: Vec<String>,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl AppOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let r = &settings.reconciler;
        Self {
            lifecycle: LifecycleOptions::default(),
            store: StoreOptions {
                kind: settings.store.kind,
                base_url: settings.store.base_url.clone(),
                token_env: settings.store.token_env.clone(),
            },
            audit: settings.audit.kind,
            master_key_env: settings.vault.master_key_env.clone(),
            enable_server: settings.server.enabled,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            engine: reconcile::Options {
                default_image: settings.default_image.clone(),
                max_concurrency: r.max_concurrency,
                log_retention_days: r.log_retention_days,
            },
            retry: settings.retry.to_options(),
            progress: hub::Options {
                log_capacity: settings.progress.log_capacity,
                retention: Duration::from_secs(settings.progress.retention_secs),
                gc_interval: Duration::from_secs(settings.progress.gc_interval_secs),
                ..Default::default()
            },
            reconciler_worker: reconciler::Options {
                interval: Duration::from_secs(r.interval_secs),
                ..Default::default()
            },
            health_worker: health::Options {
                interval: Duration::from_secs(r.health_interval_secs),
            },
            sweeper_worker: sweeper::Options {
                interval: Duration::from_secs(r.sweep_interval_secs),
                stuck_threshold: Duration::from_secs(r.stuck_threshold_secs),
            },
            workspace: settings.workspace.clone(),
            runtime_capability: settings.runtime_capability.clone(),
            skill_dirs: settings.skill_dirs.clone(),
        }
    }
}

/// Lifecycle options for the daemon
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub kind: StoreKind,
    pub base_url: Option<String>,
    pub token_env: Option<String>,
}

/// Control surface options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8470,
        }
    }
}
