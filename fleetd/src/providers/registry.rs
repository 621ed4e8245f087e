//! Deployment type to provider resolution

use std::sync::Arc;

use crate::models::{CloudConfig, DeploymentType, Instance};
use crate::providers::azure::AzureVmProvider;
use crate::providers::command::CommandRunner;
use crate::providers::docker::DockerProvider;
use crate::providers::ecs::EcsProvider;
use crate::providers::gce::GceProvider;
use crate::providers::{Provider, ProviderConfig};
use crate::retry::RetryOptions;
use crate::vault::SecretBackend;

/// Builds providers sharing one command runner and the local vault
#[derive(Clone)]
pub struct ProviderRegistry {
    runner: Arc<dyn CommandRunner>,
    local_vault: Arc<dyn SecretBackend>,
    retry: RetryOptions,
}

impl ProviderRegistry {
    pub fn new(runner: Arc<dyn CommandRunner>, local_vault: Arc<dyn SecretBackend>) -> Self {
        Self {
            runner,
            local_vault,
            retry: RetryOptions::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// An uninitialized provider for the deployment type; absent means LOCAL
    pub fn resolve(&self, deployment_type: Option<DeploymentType>) -> Box<dyn Provider> {
        match DeploymentType::or_default(deployment_type) {
            DeploymentType::Local => Box::new(DockerProvider::new(
                self.runner.clone(),
                false,
                Some(self.local_vault.clone()),
            )),
            DeploymentType::Docker => Box::new(DockerProvider::new(
                self.runner.clone(),
                true,
                Some(self.local_vault.clone()),
            )),
            DeploymentType::EcsEc2 => Box::new(EcsProvider::new(self.runner.clone())),
            DeploymentType::Gce => Box::new(GceProvider::new(self.runner.clone())),
            DeploymentType::AzureVm => Box::new(AzureVmProvider::new(self.runner.clone())),
        }
    }

    /// Resolve and bind to the instance's workspace and placement
    pub fn for_instance(&self, instance: &Instance, cloud: CloudConfig) -> Box<dyn Provider> {
        let mut provider = self.resolve(instance.deployment_type);
        let mut config = ProviderConfig::new(instance.workspace_id.clone(), cloud);
        config.retry = self.retry.clone();
        provider.initialize(config);
        provider
    }

    pub fn local_vault(&self) -> &Arc<dyn SecretBackend> {
        &self.local_vault
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::command::ScriptedRunner;
    use crate::store::Stores;
    use crate::vault::local::{LocalEncryptedStore, StaticKeyStore};

    fn registry() -> ProviderRegistry {
        let vault = LocalEncryptedStore::new(Stores::in_memory().repo(), Arc::new(StaticKeyStore::generate()));
        ProviderRegistry::new(Arc::new(ScriptedRunner::new()), Arc::new(vault))
    }

    #[test]
    fn test_absent_type_resolves_local() {
        let registry = registry();
        assert_eq!(registry.resolve(None).name(), "local");
        assert_eq!(registry.resolve(Some(DeploymentType::Local)).name(), "local");
    }

    #[test]
    fn test_each_type_has_a_provider() {
        let registry = registry();
        let names: Vec<&str> = DeploymentType::ALL
            .iter()
            .map(|t| registry.resolve(Some(*t)).name())
            .collect();
        assert_eq!(names, vec!["local", "docker", "ecs", "gce", "azure-vm"]);
    }
}
