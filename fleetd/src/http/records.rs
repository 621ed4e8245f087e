//! Record store API client

use openapi_client::{RecordEnvelope, RecordListResponse, RecordWriteRequest};
use serde_json::Value;

use crate::errors::FleetError;
use crate::http::client::HttpClient;

fn query_string(filters: &[(String, Value)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (field, value) in filters {
        match value {
            Value::String(s) => serializer.append_pair(field, s),
            other => serializer.append_pair(field, &other.to_string()),
        };
    }
    serializer.finish()
}

impl HttpClient {
    pub async fn get_record(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<RecordEnvelope>, FleetError> {
        let path = format!("/records/{}/{}", collection, id);
        self.get_opt(&path).await
    }

    pub async fn put_record(
        &self,
        collection: &str,
        id: &str,
        data: Value,
        expected_revision: Option<u64>,
    ) -> Result<RecordEnvelope, FleetError> {
        let path = format!("/records/{}/{}", collection, id);
        self.put(&path, &RecordWriteRequest { data }, expected_revision)
            .await
    }

    pub async fn query_records(
        &self,
        collection: &str,
        filters: &[(String, Value)],
    ) -> Result<Vec<RecordEnvelope>, FleetError> {
        let path = if filters.is_empty() {
            format!("/records/{}", collection)
        } else {
            format!("/records/{}?{}", collection, query_string(filters))
        };
        let response: RecordListResponse = self.get(&path).await?;
        Ok(response.records)
    }

    pub async fn delete_record(&self, collection: &str, id: &str) -> Result<bool, FleetError> {
        let path = format!("/records/{}/{}", collection, id);
        self.delete(&path).await
    }
}
