//! In-memory record store

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::FleetError;
use crate::store::{Query, Record, RecordStore};

/// Record store held in process memory. Writes are serialized by a single
/// lock, so per-row revisions are strictly monotonic.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Record>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows in a collection
    pub fn len(&self, collection: &str) -> usize {
        let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
        collections.get(collection).map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>, FleetError> {
        let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
        Ok(collections.get(collection).and_then(|c| c.get(id)).cloned())
    }

    async fn put(
        &self,
        collection: &str,
        id: &str,
        data: Value,
        expected_revision: Option<u64>,
    ) -> Result<Record, FleetError> {
        let mut collections = self.collections.write().unwrap_or_else(|e| e.into_inner());
        let rows = collections.entry(collection.to_string()).or_default();
        let current = rows.get(id).map(|r| r.revision).unwrap_or(0);

        if let Some(expected) = expected_revision {
            if expected != current {
                return Err(FleetError::Conflict(format!(
                    "{}/{}: expected revision {}, found {}",
                    collection, id, expected, current
                )));
            }
        }

        let record = Record {
            id: id.to_string(),
            revision: current + 1,
            data,
        };
        rows.insert(id.to_string(), record.clone());
        Ok(record)
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Record>, FleetError> {
        let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
        Ok(collections
            .get(collection)
            .map(|rows| {
                rows.values()
                    .filter(|r| query.matches(&r.data))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, FleetError> {
        let mut collections = self.collections.write().unwrap_or_else(|e| e.into_inner());
        Ok(collections
            .get_mut(collection)
            .and_then(|rows| rows.remove(id))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_revisions_and_preconditions() {
        let store = MemoryStore::new();
        let first = store.put("things", "a", json!({"v": 1}), Some(0)).await.unwrap();
        assert_eq!(first.revision, 1);

        let stale = store.put("things", "a", json!({"v": 2}), Some(0)).await;
        assert!(matches!(stale, Err(FleetError::Conflict(_))));

        let second = store.put("things", "a", json!({"v": 2}), Some(1)).await.unwrap();
        assert_eq!(second.revision, 2);

        let forced = store.put("things", "a", json!({"v": 3}), None).await.unwrap();
        assert_eq!(forced.revision, 3);
    }

    #[tokio::test]
    async fn test_query_orders_by_id_and_delete_is_idempotent() {
        let store = MemoryStore::new();
        store.put("things", "b", json!({"kind": "x"}), None).await.unwrap();
        store.put("things", "a", json!({"kind": "x"}), None).await.unwrap();
        store.put("things", "c", json!({"kind": "y"}), None).await.unwrap();

        let xs = store
            .query("things", &Query::all().eq("kind", "x"))
            .await
            .unwrap();
        let ids: Vec<_> = xs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(store.delete("things", "a").await.unwrap());
        assert!(!store.delete("things", "a").await.unwrap());
        assert_eq!(store.len("things"), 2);
    }
}
