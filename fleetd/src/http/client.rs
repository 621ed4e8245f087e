//! HTTP client for the platform API

use reqwest::{header, Client, Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error};

use crate::errors::FleetError;

/// HTTP client for the platform record and audit APIs
pub struct HttpClient {
    client: Client,
    base_url: String,
    token: Option<SecretString>,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(base_url: &str) -> Result<Self, FleetError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Create a new HTTP client sending a bearer token on every request
    pub fn with_token(base_url: &str, token: SecretString) -> Result<Self, FleetError> {
        let mut client = Self::new(base_url)?;
        client.token = Some(token);
        Ok(client)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);

        let mut request = self.client.request(method, &url);
        if let Some(token) = &self.token {
            request = request.header(
                header::AUTHORIZATION,
                format!("Bearer {}", token.expose_secret()),
            );
        }
        request
    }

    /// Map a non-success status to an error; 404 is left to the caller
    async fn check(method: &str, response: Response) -> Result<Response, FleetError> {
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        error!("HTTP {} failed: {} - {}", method, status, body);
        Err(match status {
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                FleetError::Conflict(format!("{}: {}", status, body))
            }
            _ => FleetError::StoreError(format!("{}: {}", status, body)),
        })
    }

    /// GET returning `None` on 404
    pub async fn get_opt<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, FleetError> {
        let response = Self::check("GET", self.request(Method::GET, path).send().await?).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.json().await?))
    }

    /// GET treating 404 as an error
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, FleetError> {
        self.get_opt(path)
            .await?
            .ok_or_else(|| FleetError::NotFound(path.to_string()))
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, FleetError> {
        let response = self.request(Method::POST, path).json(body).send().await?;
        let response = Self::check("POST", response).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(FleetError::NotFound(path.to_string()));
        }
        Ok(response.json().await?)
    }

    /// PUT with an optional `If-Match` revision precondition
    pub async fn put<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
        if_match: Option<u64>,
    ) -> Result<T, FleetError> {
        let mut request = self.request(Method::PUT, path).json(body);
        if let Some(revision) = if_match {
            request = request.header(header::IF_MATCH, revision.to_string());
        }
        let response = Self::check("PUT", request.send().await?).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(FleetError::NotFound(path.to_string()));
        }
        Ok(response.json().await?)
    }

    /// DELETE; returns false when the resource did not exist
    pub async fn delete(&self, path: &str) -> Result<bool, FleetError> {
        let response = Self::check("DELETE", self.request(Method::DELETE, path).send().await?).await?;
        Ok(response.status() != StatusCode::NOT_FOUND)
    }
}
