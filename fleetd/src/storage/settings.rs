//! Settings file management
//!
//! `settings.json` is read once at startup. Every field has a default, so a
//! partial file (or none at all) is a valid configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::FleetError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::retry::RetryOptions;

pub const DEFAULT_SETTINGS_PATH: &str = "/etc/fleetd/settings.json";

/// Daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,

    /// Directory for a daily rolling log file
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub audit: AuditSettings,

    #[serde(default)]
    pub reconciler: ReconcilerSettings,

    #[serde(default)]
    pub progress: ProgressSettings,

    #[serde(default)]
    pub vault: VaultSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    /// Workspace new instances belong to when a request names none
    #[serde(default = "default_workspace")]
    pub workspace: String,

    /// Image for manifests without `runtime.image`
    #[serde(default = "default_image")]
    pub default_image: String,

    /// Tool capability the preprocessor grants every workload
    #[serde(default = "default_runtime_capability")]
    pub runtime_capability: String,

    /// Extra skill directories mounted into local workloads
    #[serde(default)]
    pub skill_dirs: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_workspace() -> String {
    "default".to_string()
}

fn default_image() -> String {
    "ghcr.io/fleetd/bot-runtime:latest".to_string()
}

fn default_runtime_capability() -> String {
    "fleet_runtime".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_dir: None,
            server: ServerSettings::default(),
            store: StoreSettings::default(),
            audit: AuditSettings::default(),
            reconciler: ReconcilerSettings::default(),
            progress: ProgressSettings::default(),
            vault: VaultSettings::default(),
            retry: RetrySettings::default(),
            workspace: default_workspace(),
            default_image: default_image(),
            runtime_capability: default_runtime_capability(),
            skill_dirs: Vec::new(),
        }
    }
}

impl Settings {
    /// Read settings; a missing file yields the defaults
    pub async fn load(file: &File) -> Result<Self, FleetError> {
        if !file.exists().await {
            return Ok(Self::default());
        }
        file.read_json()
            .await
            .map_err(|e| FleetError::ConfigError(format!("{}: {}", file.path().display(), e)))
    }

    /// Reject combinations that would only fail later at runtime
    pub fn validate(&self) -> Result<(), FleetError> {
        if self.store.kind == StoreKind::Http && self.store.base_url.is_none() {
            return Err(FleetError::ConfigError("store.base_url is required for the http store".into()));
        }
        if self.audit.kind == AuditKind::Http && self.store.base_url.is_none() {
            return Err(FleetError::ConfigError("http audit uses store.base_url, which is not set".into()));
        }
        if self.reconciler.max_concurrency == 0 {
            return Err(FleetError::ConfigError("reconciler.max_concurrency must be at least 1".into()));
        }
        if self.reconciler.interval_secs == 0 || self.reconciler.health_interval_secs == 0 {
            return Err(FleetError::ConfigError("reconciler intervals must be positive".into()));
        }
        if self.progress.log_capacity == 0 {
            return Err(FleetError::ConfigError("progress.log_capacity must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(FleetError::ConfigError("retry.max_attempts must be at least 1".into()));
        }
        if self.default_image.trim().is_empty() {
            return Err(FleetError::ConfigError("default_image must not be empty".into()));
        }
        Ok(())
    }
}

/// Control surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8470
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Http,
}

/// Record store backing instances, targets, change-sets and vault rows
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub kind: StoreKind,

    /// Platform API base URL
    #[serde(default)]
    pub base_url: Option<String>,

    /// Environment variable holding the platform API token
    #[serde(default)]
    pub token_env: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditKind {
    #[default]
    Log,
    Memory,
    Http,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditSettings {
    #[serde(default)]
    pub kind: AuditKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerSettings {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,

    /// CREATING or RECONCILING longer than this is considered stuck
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Retention for provider log groups created on first use
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,
}

fn default_interval() -> u64 {
    15
}

fn default_health_interval() -> u64 {
    60
}

fn default_stuck_threshold() -> u64 {
    900
}

fn default_sweep_interval() -> u64 {
    120
}

fn default_max_concurrency() -> usize {
    8
}

fn default_log_retention_days() -> u32 {
    30
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            health_interval_secs: default_health_interval(),
            stuck_threshold_secs: default_stuck_threshold(),
            sweep_interval_secs: default_sweep_interval(),
            max_concurrency: default_max_concurrency(),
            log_retention_days: default_log_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSettings {
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,
}

fn default_log_capacity() -> usize {
    500
}

fn default_retention() -> u64 {
    300
}

fn default_gc_interval() -> u64 {
    30
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            log_capacity: default_log_capacity(),
            retention_secs: default_retention(),
            gc_interval_secs: default_gc_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSettings {
    /// Environment variable holding the base64 master key
    #[serde(default = "default_master_key_env")]
    pub master_key_env: String,
}

fn default_master_key_env() -> String {
    "FLEETD_MASTER_KEY".to_string()
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            master_key_env: default_master_key_env(),
        }
    }
}

/// Retry policy for provider calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay() -> u64 {
    500
}

fn default_max_delay() -> u64 {
    30_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl RetrySettings {
    pub fn to_options(&self) -> RetryOptions {
        RetryOptions {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings: Settings = serde_json::from_str(
            r#"{"log_level": "debug", "server": {"port": 9000}, "reconciler": {"max_concurrency": 2}}"#,
        )
        .unwrap();
        assert_eq!(settings.log_level, LogLevel::Debug);
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.reconciler.max_concurrency, 2);
        assert_eq!(settings.reconciler.stuck_threshold_secs, 900);
        assert_eq!(settings.progress.log_capacity, 500);
        assert_eq!(settings.store.kind, StoreKind::Memory);
        settings.validate().unwrap();
    }

    #[test]
    fn test_http_store_requires_url() {
        let settings: Settings = serde_json::from_str(r#"{"store": {"kind": "http"}}"#).unwrap();
        assert!(matches!(settings.validate(), Err(FleetError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&File::new(dir.path().join("settings.json"))).await.unwrap();
        assert_eq!(settings.workspace, "default");
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        let loaded = tokio_test::block_on(Settings::load(&File::new(path)));
        tokio_test::assert_err!(&loaded);
        assert!(matches!(loaded, Err(FleetError::ConfigError(_))));
    }

    #[test]
    fn test_retry_options() {
        let retry = RetrySettings::default().to_options();
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.base_delay, Duration::from_millis(500));
    }
}
