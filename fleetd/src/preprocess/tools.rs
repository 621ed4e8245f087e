//! Grants the fleet runtime capability in the manifest's tool policy.
//!
//! An explicit `tools.allow` list is a whitelist, so the capability must
//! join it. Without one, the capability goes to `tools.alsoAllow`, which
//! extends the default policy instead of narrowing it.

use crate::errors::FleetError;
use crate::models::Manifest;
use crate::preprocess::{push_unique, PreprocessContext, Preprocessor};

pub const DEFAULT_CAPABILITY: &str = "fleet_runtime";

pub struct ToolCapabilityPreprocessor {
    capability: String,
}

impl ToolCapabilityPreprocessor {
    pub fn new(capability: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
        }
    }
}

impl Default for ToolCapabilityPreprocessor {
    fn default() -> Self {
        Self::new(DEFAULT_CAPABILITY)
    }
}

impl Preprocessor for ToolCapabilityPreprocessor {
    fn name(&self) -> &str {
        "tool-capability"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn apply(&self, manifest: &mut Manifest, _ctx: &PreprocessContext<'_>) -> Result<bool, FleetError> {
        let has_allow = manifest
            .get_path(&["tools", "allow"])
            .is_some_and(|v| v.is_array());
        let list = if has_allow { "allow" } else { "alsoAllow" };
        Ok(push_unique(manifest, &["tools", list], &self.capability))
    }
}
