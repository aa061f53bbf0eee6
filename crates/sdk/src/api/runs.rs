//! Runs API: the client-side surface of spec §6's run lifecycle endpoints
//! (`POST /runs`, `GET /runs/{id}`, `POST /runs/{id}/cancel`) plus the
//! `code-mode` alias.

use crate::client::ShiiooClient;
use crate::error::ShiiooResult;
use crate::stream::ResumableStream;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shiioo_core::{RunId, RunKind, RunStatus};

/// Runs API for starting, inspecting, canceling and streaming runs.
pub struct RunsApi<'a> {
    client: &'a ShiiooClient,
}

impl<'a> RunsApi<'a> {
    pub(crate) fn new(client: &'a ShiiooClient) -> Self {
        Self { client }
    }

    /// `POST /runs`: starts a run of the given kind for a project.
    pub async fn start(
        &self,
        project_id: impl Into<String>,
        kind: RunKind,
        metadata: Option<Value>,
    ) -> ShiiooResult<StartRunResponse> {
        let req = CreateRunRequest {
            project_id: project_id.into(),
            kind,
            metadata,
        };
        self.client.http().post("/runs", &req).await
    }

    /// `POST /code-mode`: syntactic sugar that pins `kind = code_mode`.
    pub async fn start_code_mode(
        &self,
        project_id: impl Into<String>,
        metadata: Option<Value>,
    ) -> ShiiooResult<StartRunResponse> {
        let req = CreateCodeModeRequest {
            project_id: project_id.into(),
            metadata,
        };
        self.client.http().post("/code-mode", &req).await
    }

    /// `GET /runs/{id}`: current run summary.
    pub async fn get(&self, run_id: RunId) -> ShiiooResult<RunSummary> {
        self.client.http().get(&format!("/runs/{run_id}")).await
    }

    /// `POST /runs/{id}/cancel`: idempotent; returns 200 whether or not
    /// the run was still active.
    pub async fn cancel(&self, run_id: RunId) -> ShiiooResult<()> {
        self.client
            .http()
            .post_no_response(&format!("/runs/{run_id}/cancel"), &json!({}))
            .await
    }

    /// `POST /code-mode/{id}/cancel`: alias of `cancel`.
    pub async fn cancel_code_mode(&self, run_id: RunId) -> ShiiooResult<()> {
        self.client
            .http()
            .post_no_response(&format!("/code-mode/{run_id}/cancel"), &json!({}))
            .await
    }

    /// Opens the resumable SSE stream at `GET /runs/{id}/stream` starting
    /// strictly after `start_index` (spec §4.D). Pass `0` for a fresh
    /// subscription or a previously persisted cursor to resume.
    pub async fn stream(&self, run_id: RunId, start_index: u64) -> ShiiooResult<ResumableStream> {
        ResumableStream::connect(self.client.clone(), "/runs", run_id, start_index).await
    }

    /// Opens the `code-mode` alias of the resumable SSE stream.
    pub async fn stream_code_mode(
        &self,
        run_id: RunId,
        start_index: u64,
    ) -> ShiiooResult<ResumableStream> {
        ResumableStream::connect(self.client.clone(), "/code-mode", run_id, start_index).await
    }
}

#[derive(Debug, Serialize)]
struct CreateRunRequest {
    project_id: String,
    kind: RunKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
struct CreateCodeModeRequest {
    project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<Value>,
}

/// Mirrors `shiioo-server`'s `CreateRunResponse`: `{run_id, workflow_run_id}`
/// per spec §6.
#[derive(Debug, Clone, Deserialize)]
pub struct StartRunResponse {
    pub run_id: RunId,
    pub workflow_run_id: Option<String>,
}

/// Mirrors `shiioo-server`'s `RunSummary`: the subset of `Run` exposed by
/// `GET /runs/{id}` per spec §6.
#[derive(Debug, Clone, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub project_id: String,
    pub kind: RunKind,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
}
