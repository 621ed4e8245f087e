//! Shared CLI invocation for concrete providers
//!
//! Wraps a [`CommandRunner`] with the provider's error classifier and the
//! retry policy: failures classified as retryable are retried with backoff,
//! everything else fails fast.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;

use crate::errors::{FleetError, ProviderError, ProviderErrorKind};
use crate::providers::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::retry::{retry_with_backoff, RetryOptions};

/// Maps a failed invocation's stderr to a classified error
pub type Classifier = fn(provider: &str, stderr: &str) -> ProviderError;

pub struct Cli {
    runner: Arc<dyn CommandRunner>,
    provider: &'static str,
    program: &'static str,
    classify: Classifier,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) retry: RetryOptions,
}

fn is_retryable(err: &FleetError) -> bool {
    err.as_provider().map(ProviderError::is_retryable).unwrap_or(false)
}

impl Cli {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        provider: &'static str,
        program: &'static str,
        classify: Classifier,
    ) -> Self {
        Self {
            runner,
            provider,
            program,
            classify,
            env: Vec::new(),
            retry: RetryOptions::default(),
        }
    }

    /// A handle whose process environment carries additional variables
    pub fn with_extra_env(&self, extra: Vec<(String, String)>) -> Cli {
        Cli {
            runner: self.runner.clone(),
            provider: self.provider,
            program: self.program,
            classify: self.classify,
            env: self.env.iter().cloned().chain(extra).collect(),
            retry: self.retry.clone(),
        }
    }

    /// One attempt; a non-zero exit becomes a classified provider error
    async fn exec(&self, args: &[String], stdin: Option<&SecretString>) -> Result<CommandOutput, FleetError> {
        let mut spec = CommandSpec::new(self.program, args.iter().cloned());
        spec.env = self.env.clone();
        if let Some(secret) = stdin {
            spec = spec.stdin(SecretString::from(secret.expose_secret().to_string()));
        }

        let output = self.runner.run(spec).await.map_err(|e| match e {
            FleetError::IoError(io) if io.kind() == std::io::ErrorKind::NotFound => {
                FleetError::from(ProviderError::new(
                    self.provider,
                    ProviderErrorKind::Unknown,
                    format!("{} CLI not found", self.program),
                )
                .with_suggestion(format!("Install the {} CLI and make sure it is on PATH", self.program)))
            }
            other => other,
        })?;

        if output.success() {
            return Ok(output);
        }
        let stderr = if output.stderr.trim().is_empty() {
            output.stdout.trim()
        } else {
            output.stderr.trim()
        };
        Err((self.classify)(self.provider, stderr).into())
    }

    async fn call(
        &self,
        label: &str,
        args: &[&str],
        stdin: Option<&SecretString>,
    ) -> Result<CommandOutput, FleetError> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        retry_with_backoff(&self.retry, label, is_retryable, || self.exec(&args, stdin)).await
    }

    /// Run and return stdout
    pub async fn run(&self, label: &str, args: &[&str]) -> Result<String, FleetError> {
        Ok(self.call(label, args, None).await?.stdout)
    }

    /// Run with a secret piped to stdin
    pub async fn run_with_stdin(
        &self,
        label: &str,
        args: &[&str],
        stdin: &SecretString,
    ) -> Result<String, FleetError> {
        Ok(self.call(label, args, Some(stdin)).await?.stdout)
    }

    /// Run and parse stdout as JSON
    pub async fn run_json<T: DeserializeOwned>(&self, label: &str, args: &[&str]) -> Result<T, FleetError> {
        self.call(label, args, None).await?.json()
    }

    /// Like [`Cli::run_json`] but a NOT_FOUND failure yields `None`
    pub async fn find_json<T: DeserializeOwned>(
        &self,
        label: &str,
        args: &[&str],
    ) -> Result<Option<T>, FleetError> {
        match self.run_json(label, args).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Run where NOT_FOUND already satisfies the call (stop, delete)
    pub async fn run_absent_ok(&self, label: &str, args: &[&str]) -> Result<(), FleetError> {
        match self.run(label, args).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

pub fn is_not_found(err: &FleetError) -> bool {
    err.as_provider().map(ProviderError::is_not_found).unwrap_or(false)
}

pub fn is_already_exists(err: &FleetError) -> bool {
    err.as_provider()
        .map(|e| e.kind == ProviderErrorKind::AlreadyExists)
        .unwrap_or(false)
}

/// Reject plain secret values on providers that only attach references
pub(crate) fn reference_only<'a>(
    provider: &str,
    bindings: &'a [crate::providers::SecretBinding],
) -> Result<Vec<(&'a str, &'a str)>, FleetError> {
    use crate::providers::SecretSource;

    bindings
        .iter()
        .map(|binding| match &binding.source {
            SecretSource::Reference(reference) => Ok((binding.env_name.as_str(), reference.as_str())),
            SecretSource::Value(_) => Err(FleetError::from(ProviderError::new(
                provider,
                ProviderErrorKind::Unknown,
                format!("secret {} has no {} secret store reference", binding.key, provider),
            )
            .with_suggestion("Store the secret through the instance's vault before deploying"))),
        })
        .collect()
}
