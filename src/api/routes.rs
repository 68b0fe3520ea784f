//! HTTP routes for run submission and lifecycle management.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::upload::extract_zip;
use crate::catalog::AgentCatalog;
use crate::error::{CatalogError, RegistryError};
use crate::registry::{RunRecord, RunRegistry, RunStatus};
use crate::runner::{ExecutionRequest, SandboxRunner, WorkQueue};

/// Shared state for the submission API.
#[derive(Clone)]
pub struct AppState {
    pub registry: RunRegistry,
    pub catalog: Arc<dyn AgentCatalog>,
    pub runner: Arc<SandboxRunner>,
    pub queue: WorkQueue,
}

/// API-level error with an HTTP status.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::RunNotFound(_) => Self::not_found(e.to_string()),
            _ => Self {
                status: StatusCode::CONFLICT,
                message: e.to_string(),
            },
        }
    }
}

impl From<CatalogError> for ApiError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::AgentNotFound(_) => Self::not_found(e.to_string()),
            _ => Self {
                status: StatusCode::BAD_GATEWAY,
                message: e.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

/// Builds the submission API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/run", post(submit_run))
        .route("/runs", get(list_runs))
        .route("/runs/:run_id", get(get_run).delete(delete_run))
        .route("/agents", get(list_agents))
        .route("/agents/:version_id", get(get_agent))
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    Json(json!({
        "service": "agent-harbor",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

struct Submission {
    agent_id: String,
    problem_statement: String,
    inference_url: String,
    api_key: String,
    files_zip: Option<Vec<u8>>,
}

async fn parse_submission(mut multipart: Multipart) -> Result<Submission, ApiError> {
    let mut agent_id = None;
    let mut problem_statement = None;
    let mut inference_url = None;
    let mut api_key = None;
    let mut files_zip = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "agent_id" => agent_id = Some(read_text(field).await?),
            "problem_statement" => problem_statement = Some(read_text(field).await?),
            "inference_url" => inference_url = Some(read_text(field).await?),
            "api_key" => api_key = Some(read_text(field).await?),
            "files_zip" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("failed to read files_zip: {e}")))?;
                files_zip = Some(bytes.to_vec());
            }
            other => {
                warn!(field = %other, "Ignoring unknown submission field");
            }
        }
    }

    Ok(Submission {
        agent_id: agent_id.ok_or_else(|| ApiError::bad_request("missing field 'agent_id'"))?,
        problem_statement: problem_statement
            .ok_or_else(|| ApiError::bad_request("missing field 'problem_statement'"))?,
        inference_url: inference_url
            .ok_or_else(|| ApiError::bad_request("missing field 'inference_url'"))?,
        api_key: api_key.ok_or_else(|| ApiError::bad_request("missing field 'api_key'"))?,
        files_zip,
    })
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| ApiError::bad_request(format!("failed to read field: {e}")))
}

/// Accepts a run submission.
///
/// The record is created Pending; any failure before the run is handed to
/// the execution queue short-circuits it to Failed, and the failed record
/// is returned so the caller sees the terminal state immediately.
async fn submit_run(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let submission = parse_submission(multipart).await?;
    let run_id = Uuid::new_v4().to_string();

    state
        .registry
        .create(RunRecord::new(
            &run_id,
            &submission.agent_id,
            &submission.problem_statement,
        ))
        .await?;
    info!(run_id = %run_id, agent_id = %submission.agent_id, "Run submitted");

    let files: Option<BTreeMap<String, Vec<u8>>> = match &submission.files_zip {
        Some(bytes) => match extract_zip(bytes) {
            Ok(files) => {
                let _ = state.registry.set_files_count(&run_id, files.len()).await;
                Some(files)
            }
            Err(e) => {
                return fail_submission(&state, &run_id, StatusCode::BAD_REQUEST, e.to_string())
                    .await;
            }
        },
        None => None,
    };

    let agent_path = match state.catalog.download_agent(&submission.agent_id).await {
        Ok(path) => path,
        Err(e) => {
            let status = match e {
                CatalogError::AgentNotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::BAD_GATEWAY,
            };
            return fail_submission(&state, &run_id, status, e.to_string()).await;
        }
    };
    let _ = state
        .registry
        .set_agent_path(&run_id, agent_path.clone())
        .await;

    let request = ExecutionRequest {
        run_id: run_id.clone(),
        agent_path,
        problem_statement: submission.problem_statement,
        inference_url: submission.inference_url,
        api_key: submission.api_key,
        files,
    };

    // Queued is recorded before the handoff so a worker can never observe
    // the run still Pending.
    state.registry.mark_queued(&run_id).await?;
    if let Err(e) = state.queue.try_submit(request) {
        return fail_submission(&state, &run_id, StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            .await;
    }

    let record = state.registry.get(&run_id).await?;
    Ok((StatusCode::OK, Json(record)).into_response())
}

/// Short-circuits a Pending run to Failed and returns the terminal record.
async fn fail_submission(
    state: &AppState,
    run_id: &str,
    status: StatusCode,
    error: String,
) -> Result<Response, ApiError> {
    warn!(run_id = %run_id, error = %error, "Run failed before execution");
    state.registry.fail(run_id, error).await?;
    let record = state.registry.get(run_id).await?;
    Ok((status, Json(record)).into_response())
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunRecord>, ApiError> {
    Ok(Json(state.registry.get(&run_id).await?))
}

#[derive(Deserialize)]
struct ListRunsQuery {
    status: Option<RunStatus>,
    limit: Option<usize>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> impl IntoResponse {
    let runs = state
        .registry
        .list(query.status, query.limit.unwrap_or(50))
        .await;
    Json(json!({"count": runs.len(), "runs": runs}))
}

/// Deletes a run. An in-flight run is stopped first; its sandbox teardown
/// happens in the worker that owns it.
async fn delete_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = state.registry.get(&run_id).await?;
    if matches!(record.status, RunStatus::Queued | RunStatus::Running) {
        state.runner.stop(&run_id).await;
        let _ = state.registry.cancel(&run_id).await;
    }
    state.registry.remove(&run_id).await?;
    info!(run_id = %run_id, "Run deleted");
    Ok(Json(json!({"status": "deleted", "run_id": run_id})))
}

#[derive(Deserialize)]
struct ListAgentsQuery {
    num_agents: Option<usize>,
}

async fn list_agents(
    State(state): State<AppState>,
    Query(query): Query<ListAgentsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let agents = state
        .catalog
        .fetch_top_agents(query.num_agents.unwrap_or(15))
        .await?;
    Ok(Json(json!({"count": agents.len(), "agents": agents})))
}

async fn get_agent(
    State(state): State<AppState>,
    Path(version_id): Path<String>,
) -> Result<Json<crate::registry::AgentInfo>, ApiError> {
    Ok(Json(state.catalog.get_agent_info(&version_id).await?))
}
