use crate::config::{AppState, Secrets, ServerConfig};
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use shiioo_core::OrchestratorError;
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;
mod stream;

/// Start the API server.
pub async fn serve(addr: &str, config: ServerConfig, secrets: Secrets) -> Result<()> {
    let state = AppState::new(&config, &secrets)?;

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Builds the router for the durable run orchestrator's HTTP surface
/// (spec §6): run lifecycle, cancellation, and the resumable SSE stream,
/// plus a `code-mode` alias that is syntactic sugar over the same run
/// lifecycle (spec §6).
fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/runs", post(handlers::create_run))
        .route("/runs/{id}", get(handlers::get_run))
        .route("/runs/{id}/cancel", post(handlers::cancel_run))
        .route("/runs/{id}/stream", get(stream::run_stream))
        .route("/code-mode", post(handlers::create_code_mode_run))
        .route("/code-mode/{id}/cancel", post(handlers::cancel_run))
        .route("/code-mode/{id}/stream", get(stream::run_stream))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "shiioo",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Wraps the crate's closed error taxonomy so every handler maps to its
/// spec-mandated HTTP status through a single `IntoResponse` impl
/// (spec §7).
pub struct ApiError(pub OrchestratorError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse {
            error: self.0.message.clone(),
            code: self.0.code.to_string(),
            details: None,
        };
        (status, Json(body)).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
