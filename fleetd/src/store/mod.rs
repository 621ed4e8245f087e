//! Record store boundary
//!
//! fleetd persists instances, deployment targets, change-sets and local vault
//! rows through a generic get/put/query interface. Every row carries a
//! revision; a put with a stale expected revision fails with
//! [`FleetError::Conflict`], which is the compare-and-set primitive the
//! reconciler and rollout orchestrator build on.

pub mod http;
pub mod memory;

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::errors::FleetError;
use crate::models::{ChangeSet, DeploymentTarget, Instance};

pub use http::HttpRecordStore;
pub use memory::MemoryStore;

/// Conflicting writes are retried this many times by [`Repo::modify`]
const MAX_CAS_ATTEMPTS: u32 = 8;

/// A stored row
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub revision: u64,
    pub data: Value,
}

/// Top-level field equality filter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub equals: Vec<(String, Value)>,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.push((field.into(), value.into()));
        self
    }

    pub fn matches(&self, data: &Value) -> bool {
        self.equals
            .iter()
            .all(|(field, value)| data.get(field) == Some(value))
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>, FleetError>;

    /// Write a row. `expected_revision`: `None` writes unconditionally,
    /// `Some(0)` requires the row to be absent, `Some(n)` requires revision n.
    async fn put(
        &self,
        collection: &str,
        id: &str,
        data: Value,
        expected_revision: Option<u64>,
    ) -> Result<Record, FleetError>;

    /// Rows matching the query, ordered by id
    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Record>, FleetError>;

    /// Returns false when the row did not exist
    async fn delete(&self, collection: &str, id: &str) -> Result<bool, FleetError>;
}

/// A typed row kind
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: &'static str;

    fn id(&self) -> &str;
}

impl Entity for Instance {
    const COLLECTION: &'static str = "instances";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for DeploymentTarget {
    const COLLECTION: &'static str = "deployment_targets";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for ChangeSet {
    const COLLECTION: &'static str = "change_sets";

    fn id(&self) -> &str {
        &self.id
    }
}

/// An entity together with the revision it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub revision: u64,
    pub value: T,
}

impl<T: Entity> Versioned<T> {
    fn from_record(record: Record) -> Result<Self, FleetError> {
        let value = serde_json::from_value(record.data).map_err(|e| {
            FleetError::StoreError(format!(
                "corrupt {} row {}: {}",
                T::COLLECTION,
                record.id,
                e
            ))
        })?;
        Ok(Self {
            revision: record.revision,
            value,
        })
    }
}

/// Typed view over one collection
pub struct Repo<T> {
    store: Arc<dyn RecordStore>,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for Repo<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T: Entity> Repo<T> {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            _entity: PhantomData,
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Versioned<T>>, FleetError> {
        match self.store.get(T::COLLECTION, id).await? {
            Some(record) => Ok(Some(Versioned::from_record(record)?)),
            None => Ok(None),
        }
    }

    /// Like [`Repo::get`] but absent rows are [`FleetError::NotFound`]
    pub async fn load(&self, id: &str) -> Result<Versioned<T>, FleetError> {
        self.get(id).await?.ok_or_else(|| {
            FleetError::NotFound(format!("{} {}", T::COLLECTION.trim_end_matches('s'), id))
        })
    }

    /// Insert a new row; fails with a conflict if the id is taken
    pub async fn insert(&self, value: &T) -> Result<Versioned<T>, FleetError> {
        let record = self
            .store
            .put(T::COLLECTION, value.id(), serde_json::to_value(value)?, Some(0))
            .await?;
        Versioned::from_record(record)
    }

    /// Conditional write against the revision the value was read at
    pub async fn update(&self, current: &Versioned<T>) -> Result<Versioned<T>, FleetError> {
        let record = self
            .store
            .put(
                T::COLLECTION,
                current.value.id(),
                serde_json::to_value(&current.value)?,
                Some(current.revision),
            )
            .await?;
        Versioned::from_record(record)
    }

    /// Unconditional write
    pub async fn upsert(&self, value: &T) -> Result<Versioned<T>, FleetError> {
        let record = self
            .store
            .put(T::COLLECTION, value.id(), serde_json::to_value(value)?, None)
            .await?;
        Versioned::from_record(record)
    }

    /// Read-modify-write with conflict retry. `apply` runs against the
    /// freshest row each attempt and may reject the change with an error.
    pub async fn modify<R, F>(&self, id: &str, mut apply: F) -> Result<(Versioned<T>, R), FleetError>
    where
        F: FnMut(&mut T) -> Result<R, FleetError> + Send,
        R: Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut current = self.load(id).await?;
            let outcome = apply(&mut current.value)?;
            match self.update(&current).await {
                Ok(written) => return Ok((written, outcome)),
                Err(FleetError::Conflict(msg)) if attempt < MAX_CAS_ATTEMPTS => {
                    debug!(
                        "Write conflict on {} {} (attempt {}): {}",
                        T::COLLECTION,
                        id,
                        attempt,
                        msg
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn query(&self, query: &Query) -> Result<Vec<Versioned<T>>, FleetError> {
        self.store
            .query(T::COLLECTION, query)
            .await?
            .into_iter()
            .map(Versioned::from_record)
            .collect()
    }

    pub async fn delete(&self, id: &str) -> Result<bool, FleetError> {
        self.store.delete(T::COLLECTION, id).await
    }
}

/// Typed access to every collection fleetd owns
#[derive(Clone)]
pub struct Stores {
    pub raw: Arc<dyn RecordStore>,
    pub instances: Repo<Instance>,
    pub targets: Repo<DeploymentTarget>,
    pub change_sets: Repo<ChangeSet>,
}

impl Stores {
    pub fn new(raw: Arc<dyn RecordStore>) -> Self {
        Self {
            instances: Repo::new(raw.clone()),
            targets: Repo::new(raw.clone()),
            change_sets: Repo::new(raw.clone()),
            raw,
        }
    }

    /// In-memory stores for tests and the default configuration
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn repo<T: Entity>(&self) -> Repo<T> {
        Repo::new(self.raw.clone())
    }
}
