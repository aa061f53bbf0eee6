//! Health API endpoint.

use crate::client::ShiiooClient;
use crate::error::ShiiooResult;
use serde::{Deserialize, Serialize};

/// Health API for checking server status.
pub struct HealthApi<'a> {
    client: &'a ShiiooClient,
}

impl<'a> HealthApi<'a> {
    pub(crate) fn new(client: &'a ShiiooClient) -> Self {
        Self { client }
    }

    /// Check basic health status (`GET /api/health`).
    pub async fn check(&self) -> ShiiooResult<HealthCheck> {
        self.client.http().get("/api/health").await
    }
}

/// Basic health check response, mirroring `shiioo-server`'s
/// `health_check` handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: String,
    pub service: String,
    pub version: String,
}
