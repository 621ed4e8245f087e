//! Adds the host's shared skill directories to `skills.load.extraDirs`

use crate::errors::FleetError;
use crate::models::{DeploymentType, Manifest};
use crate::preprocess::{push_unique, PreprocessContext, Preprocessor};

pub struct SkillDirsPreprocessor {
    dirs: Vec<String>,
}

impl SkillDirsPreprocessor {
    pub fn new(dirs: Vec<String>) -> Self {
        Self { dirs }
    }
}

impl Preprocessor for SkillDirsPreprocessor {
    fn name(&self) -> &str {
        "skill-dirs"
    }

    fn priority(&self) -> i32 {
        20
    }

    /// Host paths only exist for workloads on this host
    fn apply(&self, manifest: &mut Manifest, ctx: &PreprocessContext<'_>) -> Result<bool, FleetError> {
        if ctx.deployment_type != DeploymentType::Local || self.dirs.is_empty() {
            return Ok(false);
        }
        let mut modified = false;
        for dir in &self.dirs {
            modified |= push_unique(manifest, &["skills", "load", "extraDirs"], dir);
        }
        Ok(modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Instance;
    use serde_json::json;

    #[test]
    fn test_local_only_and_deduplicated() {
        let preprocessor = SkillDirsPreprocessor::new(vec!["/opt/skills".into(), "/srv/skills".into()]);
        let mut manifest = Manifest::from_value(json!({"skills": {"load": {"extraDirs": ["/srv/skills"]}}})).unwrap();

        let local = Instance::new("bot", "ws", &manifest, None);
        assert!(preprocessor.apply(&mut manifest, &PreprocessContext::new(&local)).unwrap());
        assert!(!preprocessor.apply(&mut manifest, &PreprocessContext::new(&local)).unwrap());
        assert_eq!(
            manifest.get_path(&["skills", "load", "extraDirs"]),
            Some(&json!(["/srv/skills", "/opt/skills"]))
        );

        let remote = Instance::new("bot", "ws", &manifest, Some(DeploymentType::Gce));
        let mut other = Manifest::new();
        assert!(!preprocessor.apply(&mut other, &PreprocessContext::new(&remote)).unwrap());
    }
}
