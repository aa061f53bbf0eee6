use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shiioo_core::{OrchestratorError, Run, RunId, RunKind, RunStatus};
use std::sync::Arc;
use std::time::Duration;

fn parse_run_id(raw: &str) -> Result<RunId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError(OrchestratorError::bad_request("invalid run id")))
}

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub project_id: String,
    pub kind: RunKind,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCodeModeRequest {
    pub project_id: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct CreateRunResponse {
    pub run_id: RunId,
    pub workflow_run_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub project_id: String,
    pub kind: RunKind,
    pub status: RunStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<Run> for RunSummary {
    fn from(run: Run) -> Self {
        Self {
            run_id: run.id,
            project_id: run.project_id,
            kind: run.kind,
            status: run.status,
            created_at: run.created_at,
        }
    }
}

/// `POST /runs`: creates a run row, spawns its driver task detached, and
/// registers a cancellation token the run's task races against (spec
/// §4.F, §6).
pub async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRunRequest>,
) -> ApiResult<(StatusCode, Json<CreateRunResponse>)> {
    start_run(&state, req.project_id, req.kind, req.metadata.unwrap_or_else(|| json!({})))
        .await
}

/// `POST /code-mode`: syntactic sugar over `POST /runs` that pins
/// `kind = code_mode` (spec §6).
pub async fn create_code_mode_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateCodeModeRequest>,
) -> ApiResult<(StatusCode, Json<CreateRunResponse>)> {
    start_run(
        &state,
        req.project_id,
        RunKind::CodeMode,
        req.metadata.unwrap_or_else(|| json!({})),
    )
    .await
}

async fn start_run(
    state: &AppState,
    project_id: String,
    kind: RunKind,
    metadata: Value,
) -> ApiResult<(StatusCode, Json<CreateRunResponse>)> {
    let run_id = state
        .run_store
        .create_run(&project_id, kind, metadata)
        .await?;

    let cancel = state.cancellations.register(run_id);
    let orchestrator = state.orchestrator.clone();
    let cancellations = state.cancellations.clone();
    let project_id_for_task = project_id.clone();

    tokio::spawn(async move {
        if let Err(e) = orchestrator
            .run(run_id, &project_id_for_task, kind, cancel)
            .await
        {
            tracing::error!(run_id = %run_id, error = %e, "run driver exited with a persistence error");
        }
        cancellations.remove(run_id);
    });

    // `workflow_run_id` is assigned by the executor at the very start of
    // the driver task, before any step runs; a short bounded poll lets
    // the response include it without the orchestrator needing to
    // expose a partial-execution API.
    let workflow_run_id = poll_for_workflow_run_id(state, run_id).await;

    Ok((
        StatusCode::CREATED,
        Json(CreateRunResponse { run_id, workflow_run_id }),
    ))
}

async fn poll_for_workflow_run_id(state: &AppState, run_id: RunId) -> Option<String> {
    for _ in 0..20 {
        if let Ok(run) = state.run_store.get_run(run_id).await {
            if run.workflow_run_id.is_some() {
                return run.workflow_run_id;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

/// `GET /runs/{id}`: current run summary (spec §6).
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<RunSummary>> {
    let run_id = parse_run_id(&id)?;
    let run = state.run_store.get_run(run_id).await?;
    Ok(Json(run.into()))
}

/// `POST /runs/{id}/cancel`: idempotent; 404 on an unknown run (spec §6).
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let run_id = parse_run_id(&id)?;
    state.run_store.get_run(run_id).await?;
    state.cancellations.cancel(run_id);
    Ok(StatusCode::OK)
}
