//! Secret vault routing
//!
//! Secrets belong to an instance. Where they are kept depends on the
//! instance's deployment: cloud deployments write into their provider's
//! secret store, everything else into the local encrypted store.

pub mod local;

use std::sync::Arc;

use async_trait::async_trait;
use openapi_server::SecretDescriptor;
use secrecy::SecretString;
use tracing::{debug, info};

use crate::errors::FleetError;
use crate::models::{CloudConfig, DeploymentType, Instance};
use crate::providers::{Provider, ProviderRegistry};
use crate::store::Stores;

pub use local::{KeyStore, LocalEncryptedStore, StaticKeyStore, VaultSecret};

/// Per-instance secret persistence
#[async_trait]
pub trait SecretBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create or overwrite
    async fn store_secret(&self, instance_id: &str, key: &str, value: &SecretString) -> Result<(), FleetError>;

    async fn get_secret(&self, instance_id: &str, key: &str) -> Result<Option<SecretString>, FleetError>;

    /// Succeeds when the secret is already gone
    async fn delete_secret(&self, instance_id: &str, key: &str) -> Result<(), FleetError>;

    /// Identifier a workload can resolve on its own, if the backend has one
    fn reference(&self, instance_id: &str, key: &str) -> Option<String>;
}

/// A cloud provider's secret store behind the backend interface
pub struct ProviderSecretStore {
    provider: Box<dyn Provider>,
}

impl ProviderSecretStore {
    pub fn new(provider: Box<dyn Provider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl SecretBackend for ProviderSecretStore {
    fn name(&self) -> &'static str {
        self.provider.name()
    }

    async fn store_secret(&self, instance_id: &str, key: &str, value: &SecretString) -> Result<(), FleetError> {
        self.provider.store_secret(instance_id, key, value).await.map(|_| ())
    }

    async fn get_secret(&self, instance_id: &str, key: &str) -> Result<Option<SecretString>, FleetError> {
        self.provider.get_secret(instance_id, key).await
    }

    async fn delete_secret(&self, instance_id: &str, key: &str) -> Result<(), FleetError> {
        self.provider.delete_secret(instance_id, key).await
    }

    fn reference(&self, instance_id: &str, key: &str) -> Option<String> {
        self.provider.secret_reference(instance_id, key)
    }
}

/// Cloud configuration of an instance: the linked deployment target when it
/// exists, otherwise the instance metadata. Missing fields are left to
/// provider defaults.
pub async fn resolve_cloud_config(stores: &Stores, instance: &Instance) -> Result<CloudConfig, FleetError> {
    let target = match &instance.deployment_target_id {
        Some(target_id) => {
            let target = stores.targets.get(target_id).await?.map(|t| t.value);
            if target.is_none() {
                debug!(
                    instance_id = %instance.id,
                    "Deployment target {} not found, falling back to metadata", target_id
                );
            }
            target
        }
        None => None,
    };
    Ok(CloudConfig::resolve(instance, target.as_ref()))
}

/// Resolved backend for one instance
pub struct ResolvedStore {
    pub deployment_type: DeploymentType,
    pub backend: Arc<dyn SecretBackend>,
}

/// Picks the secret backend of an instance
#[derive(Clone)]
pub struct VaultRouter {
    stores: Stores,
    registry: ProviderRegistry,
}

impl VaultRouter {
    pub fn new(stores: Stores, registry: ProviderRegistry) -> Self {
        Self { stores, registry }
    }

    pub async fn resolve_store(&self, instance_id: &str) -> Result<ResolvedStore, FleetError> {
        let instance = self.stores.instances.load(instance_id).await?.value;
        let deployment_type = instance.deployment_type();
        let backend: Arc<dyn SecretBackend> = match deployment_type {
            DeploymentType::EcsEc2 | DeploymentType::Gce | DeploymentType::AzureVm => {
                let cloud = resolve_cloud_config(&self.stores, &instance).await?;
                debug!(
                    instance_id = %instance.id,
                    "Routing secrets to {} ({:?} config)", deployment_type, cloud.source
                );
                Arc::new(ProviderSecretStore::new(self.registry.for_instance(&instance, cloud)))
            }
            DeploymentType::Local | DeploymentType::Docker => self.registry.local_vault().clone(),
        };
        Ok(ResolvedStore {
            deployment_type,
            backend,
        })
    }

    pub async fn store_secret(
        &self,
        instance_id: &str,
        key: &str,
        value: &SecretString,
    ) -> Result<SecretDescriptor, FleetError> {
        validate_key(key)?;
        let resolved = self.resolve_store(instance_id).await?;
        resolved.backend.store_secret(instance_id, key, value).await?;
        info!(instance_id = %instance_id, "Stored secret {} in {}", key, resolved.backend.name());
        Ok(SecretDescriptor {
            instance_id: instance_id.to_string(),
            key: key.to_string(),
            backend: resolved.backend.name().to_string(),
        })
    }

    pub async fn get_secret(&self, instance_id: &str, key: &str) -> Result<Option<SecretString>, FleetError> {
        self.resolve_store(instance_id).await?.backend.get_secret(instance_id, key).await
    }

    pub async fn delete_secret(&self, instance_id: &str, key: &str) -> Result<(), FleetError> {
        self.resolve_store(instance_id).await?.backend.delete_secret(instance_id, key).await
    }
}

/// Secret keys become resource names and environment variables
pub fn validate_key(key: &str) -> Result<(), FleetError> {
    if key.is_empty() || key.len() > 128 {
        return Err(FleetError::ValidationError("secret key must be 1-128 characters".to_string()));
    }
    if !key.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')) {
        return Err(FleetError::ValidationError(format!(
            "secret key {:?} may only contain letters, digits, '_', '-' and '.'",
            key
        )));
    }
    Ok(())
}
