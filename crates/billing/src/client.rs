//! Authenticated HTTP transport to the billing provider

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};

/// Raw provider answer; status interpretation is left to the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderResponse {
    pub status: u16,
    pub body: String,
}

impl ProviderResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> BillingResult<T> {
        serde_json::from_str(&self.body).map_err(|e| {
            tracing::error!(error = %e, status = self.status, "Failed to decode provider response");
            BillingError::ProviderUnavailable {
                status: Some(self.status),
                body: format!("undecodable response: {}", e),
            }
        })
    }

    /// Converts a non-2xx answer into `ProviderUnavailable` with status and body.
    pub fn error_for_status(self) -> BillingResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(BillingError::provider_status(self.status, self.body))
        }
    }
}

/// Transport seam used by the provider adapter.
///
/// Implementations return `Ok` for every HTTP answer, whatever its status,
/// and `Err(ProviderUnavailable { status: None, .. })` for transport failures.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn get(&self, path: &str) -> BillingResult<ProviderResponse>;
    async fn post(&self, path: &str, body: &serde_json::Value) -> BillingResult<ProviderResponse>;
}

/// reqwest-backed provider client with bearer authentication
#[derive(Clone)]
pub struct HttpProviderClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl HttpProviderClient {
    pub fn new(config: &BillingConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn into_response(
        method: &'static str,
        path: &str,
        result: Result<reqwest::Response, reqwest::Error>,
    ) -> BillingResult<ProviderResponse> {
        let response = result.map_err(|e| {
            tracing::warn!(method, path = %path, error = %e, "Provider request failed");
            BillingError::transport(format!("{} {}: {}", method, path, e))
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            tracing::warn!(method, path = %path, status, error = %e, "Failed to read provider response");
            BillingError::transport(format!("{} {}: reading body: {}", method, path, e))
        })?;

        tracing::debug!(method, path = %path, status, "Provider response");
        Ok(ProviderResponse { status, body })
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn get(&self, path: &str) -> BillingResult<ProviderResponse> {
        let result = self
            .http
            .get(self.url(path))
            .bearer_auth(&self.access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await;
        Self::into_response("GET", path, result).await
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> BillingResult<ProviderResponse> {
        let result = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await;
        Self::into_response("POST", path, result).await
    }
}
