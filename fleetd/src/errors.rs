//! Error types for fleetd

use std::fmt;

use openapi_server::ErrorResponse;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Provider-agnostic classification of a provider failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderErrorKind {
    Authentication,
    Authorization,
    NotFound,
    AlreadyExists,
    QuotaExceeded,
    Network,
    Unknown,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderErrorKind::Authentication => "AUTHENTICATION",
            ProviderErrorKind::Authorization => "AUTHORIZATION",
            ProviderErrorKind::NotFound => "NOT_FOUND",
            ProviderErrorKind::AlreadyExists => "ALREADY_EXISTS",
            ProviderErrorKind::QuotaExceeded => "QUOTA_EXCEEDED",
            ProviderErrorKind::Network => "NETWORK",
            ProviderErrorKind::Unknown => "UNKNOWN",
        }
    }

    /// Generic remediation hints, extended by each provider's classifier
    pub fn default_suggestions(&self) -> Vec<String> {
        let hints: &[&str] = match self {
            ProviderErrorKind::Authentication => &[
                "Check that the provider CLI is logged in",
                "Verify the configured credentials or key file have not expired",
            ],
            ProviderErrorKind::Authorization => &[
                "Grant the deploying identity permission for this operation",
            ],
            ProviderErrorKind::NotFound => &[
                "Verify the resource still exists and the region/project is correct",
            ],
            ProviderErrorKind::AlreadyExists => &[
                "Delete the conflicting resource or reuse it",
            ],
            ProviderErrorKind::QuotaExceeded => &[
                "Request a quota increase or free existing capacity",
            ],
            ProviderErrorKind::Network => &[
                "Check network connectivity to the provider endpoint",
            ],
            ProviderErrorKind::Unknown => &["Inspect the provider logs for details"],
        };
        hints.iter().map(|s| s.to_string()).collect()
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure from a concrete provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub provider: String,
    pub code: Option<String>,
    pub message: String,
    pub suggestions: Vec<String>,
    /// Explicitly transient (throttling, rate limiting) regardless of kind
    pub transient: bool,
}

impl ProviderError {
    pub fn new(provider: impl Into<String>, kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            provider: provider.into(),
            code: None,
            message: message.into(),
            suggestions: kind.default_suggestions(),
            transient: false,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.insert(0, suggestion.into());
        self
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// QUOTA_EXCEEDED, NETWORK and explicitly transient codes are retried
    pub fn is_retryable(&self) -> bool {
        self.transient
            || matches!(
                self.kind,
                ProviderErrorKind::QuotaExceeded | ProviderErrorKind::Network
            )
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ProviderErrorKind::NotFound
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} {} ({}): {}", self.provider, self.kind, code, self.message),
            None => write!(f, "{} {}: {}", self.provider, self.kind, self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Main error type for fleetd
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Manifest error: {0}")]
    ManifestError(String),

    #[error("Vault error: {0}")]
    VaultError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for FleetError {
    fn from(err: anyhow::Error) -> Self {
        FleetError::Internal(err.to_string())
    }
}

impl FleetError {
    /// Stable machine-readable type name
    pub fn error_type(&self) -> &'static str {
        match self {
            FleetError::Provider(e) => e.kind.as_str(),
            FleetError::NotFound(_) => "NOT_FOUND",
            FleetError::Conflict(_) => "CONFLICT",
            FleetError::InvalidState(_) => "INVALID_STATE",
            FleetError::ValidationError(_) | FleetError::ManifestError(_) => "VALIDATION",
            FleetError::ConfigError(_) => "CONFIGURATION",
            FleetError::VaultError(_) => "VAULT",
            FleetError::HttpError(_) => "NETWORK",
            _ => "INTERNAL",
        }
    }

    /// Structured failure safe to show to users
    pub fn to_response(&self) -> ErrorResponse {
        match self {
            FleetError::Provider(e) => ErrorResponse {
                error_type: e.kind.as_str().to_string(),
                message: e.message.clone(),
                suggestions: e.suggestions.clone(),
            },
            FleetError::IoError(_) | FleetError::ShutdownError(_) | FleetError::Internal(_) => {
                ErrorResponse {
                    error_type: self.error_type().to_string(),
                    message: "Internal error".to_string(),
                    suggestions: vec!["Check the fleetd logs for details".to_string()],
                }
            }
            other => ErrorResponse {
                error_type: other.error_type().to_string(),
                message: other.to_string(),
                suggestions: Vec::new(),
            },
        }
    }

    pub fn as_provider(&self) -> Option<&ProviderError> {
        match self {
            FleetError::Provider(e) => Some(e),
            _ => None,
        }
    }
}
