//! Main client for the Shiioo SDK: the Rust binding for spec §6's HTTP
//! surface (run lifecycle, cancellation, resumable SSE stream).

use crate::api::{HealthApi, RunsApi};
use crate::config::{ClientConfig, RetryConfig};
use crate::error::{ShiiooError, ShiiooResult};
use crate::transport::HttpTransport;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Main client for interacting with the Shiioo API.
#[derive(Clone)]
pub struct ShiiooClient {
    config: Arc<ClientConfig>,
    http: HttpTransport,
}

impl ShiiooClient {
    /// Create a new client builder.
    pub fn builder() -> ShiiooClientBuilder {
        ShiiooClientBuilder::new()
    }

    /// Create a client from configuration.
    fn from_config(config: ClientConfig) -> ShiiooResult<Self> {
        let config = Arc::new(config);
        let http = HttpTransport::new(config.clone())?;

        Ok(Self { config, http })
    }

    pub(crate) fn http(&self) -> &HttpTransport {
        &self.http
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Get the health API.
    pub fn health(&self) -> HealthApi<'_> {
        HealthApi::new(self)
    }

    /// Get the runs API.
    pub fn runs(&self) -> RunsApi<'_> {
        RunsApi::new(self)
    }
}

/// Builder for creating a ShiiooClient.
pub struct ShiiooClientBuilder {
    base_url: Option<String>,
    api_key: Option<String>,
    timeout: Duration,
    retry_config: RetryConfig,
}

impl ShiiooClientBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            base_url: None,
            api_key: None,
            timeout: Duration::from_secs(30),
            retry_config: RetryConfig::default(),
        }
    }

    /// Set the base URL of the Shiioo server.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Set the API key for authentication.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry configuration.
    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    /// Build the client.
    pub fn build(self) -> ShiiooResult<ShiiooClient> {
        let base_url_str = self
            .base_url
            .ok_or_else(|| ShiiooError::Config("base_url is required".to_string()))?;

        let base_url = Url::parse(&base_url_str)?;

        let config = ClientConfig {
            base_url,
            api_key: self.api_key,
            timeout: self.timeout,
            retry_config: self.retry_config,
        };

        ShiiooClient::from_config(config)
    }
}

impl Default for ShiiooClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
