//! Domain models persisted in the record store

pub mod changeset;
pub mod instance;
pub mod manifest;
pub mod target;

pub use changeset::{ChangeSet, ChangeSetStatus, RolloutStrategy};
pub use instance::{DeploymentType, HealthStatus, Instance, InstanceStatus};
pub use manifest::{Environment, Manifest};
pub use target::{CloudConfig, DeploymentTarget};
