//! Manifest preprocessing
//!
//! An ordered list of named transformations applied to a desired manifest
//! right before deployment. The list is sorted by ascending priority once,
//! when the pipeline is built.

pub mod skills;
pub mod tools;

use std::sync::Arc;

use tracing::debug;

use crate::errors::FleetError;
use crate::models::{DeploymentType, Instance, Manifest};

pub use skills::SkillDirsPreprocessor;
pub use tools::ToolCapabilityPreprocessor;

/// What a preprocessor may look at besides the manifest
#[derive(Debug, Clone, Copy)]
pub struct PreprocessContext<'a> {
    pub instance: &'a Instance,
    pub deployment_type: DeploymentType,
}

impl<'a> PreprocessContext<'a> {
    pub fn new(instance: &'a Instance) -> Self {
        Self {
            instance,
            deployment_type: instance.deployment_type(),
        }
    }
}

pub trait Preprocessor: Send + Sync {
    fn name(&self) -> &str;

    /// Lower runs first
    fn priority(&self) -> i32;

    /// Returns whether the manifest changed
    fn apply(&self, manifest: &mut Manifest, ctx: &PreprocessContext<'_>) -> Result<bool, FleetError>;
}

/// Result of a pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreprocessReport {
    /// Names of the preprocessors that modified the manifest, in run order
    pub modified_by: Vec<String>,
}

impl PreprocessReport {
    pub fn modified(&self) -> bool {
        !self.modified_by.is_empty()
    }
}

#[derive(Clone, Default)]
pub struct Pipeline {
    preprocessors: Vec<Arc<dyn Preprocessor>>,
}

impl Pipeline {
    pub fn new(mut preprocessors: Vec<Arc<dyn Preprocessor>>) -> Self {
        // Stable: equal priorities keep registration order
        preprocessors.sort_by_key(|p| p.priority());
        Self { preprocessors }
    }

    pub fn is_empty(&self) -> bool {
        self.preprocessors.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.preprocessors.iter().map(|p| p.name()).collect()
    }

    /// Run every preprocessor in order. A failing preprocessor aborts the run.
    pub fn run(&self, manifest: &mut Manifest, ctx: &PreprocessContext<'_>) -> Result<PreprocessReport, FleetError> {
        let mut report = PreprocessReport::default();
        for preprocessor in &self.preprocessors {
            let modified = preprocessor.apply(manifest, ctx).map_err(|e| {
                FleetError::ManifestError(format!("preprocessor {} failed: {}", preprocessor.name(), e))
            })?;
            if modified {
                debug!(
                    instance_id = %ctx.instance.id,
                    "Preprocessor {} modified the manifest", preprocessor.name()
                );
                report.modified_by.push(preprocessor.name().to_string());
            }
        }
        Ok(report)
    }
}

/// Append `value` to the string array at `path` unless already present.
/// A non-array value at `path` is replaced.
pub(crate) fn push_unique(manifest: &mut Manifest, path: &[&str], value: &str) -> bool {
    let Some((last, parents)) = path.split_last() else {
        return false;
    };
    let parent = manifest.object_at_mut(parents);
    let entry = parent
        .entry(last.to_string())
        .or_insert_with(|| serde_json::Value::Array(Vec::new()));
    if !entry.is_array() {
        *entry = serde_json::Value::Array(Vec::new());
    }
    match entry {
        serde_json::Value::Array(items) => {
            if items.iter().any(|item| item.as_str() == Some(value)) {
                false
            } else {
                items.push(serde_json::Value::String(value.to_string()));
                true
            }
        }
        _ => false,
    }
}
