//! Record store backed by the platform record API

use std::sync::Arc;

use async_trait::async_trait;
use openapi_client::RecordEnvelope;
use serde_json::Value;

use crate::errors::FleetError;
use crate::http::HttpClient;
use crate::store::{Query, Record, RecordStore};

pub struct HttpRecordStore {
    client: Arc<HttpClient>,
}

impl HttpRecordStore {
    pub fn new(client: Arc<HttpClient>) -> Self {
        Self { client }
    }
}

impl From<RecordEnvelope> for Record {
    fn from(envelope: RecordEnvelope) -> Self {
        Self {
            id: envelope.id,
            revision: envelope.revision,
            data: envelope.data,
        }
    }
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>, FleetError> {
        Ok(self.client.get_record(collection, id).await?.map(Record::from))
    }

    async fn put(
        &self,
        collection: &str,
        id: &str,
        data: Value,
        expected_revision: Option<u64>,
    ) -> Result<Record, FleetError> {
        let envelope = self
            .client
            .put_record(collection, id, data, expected_revision)
            .await?;
        Ok(envelope.into())
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Record>, FleetError> {
        let mut records: Vec<Record> = self
            .client
            .query_records(collection, &query.equals)
            .await?
            .into_iter()
            .map(Record::from)
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, FleetError> {
        self.client.delete_record(collection, id).await
    }
}
