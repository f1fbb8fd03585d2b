// HTTP route handlers for the coderun API

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use coderun_common::queue::{EnqueueOptions, TaskMessage};
use coderun_common::redis;
use coderun_common::store::ExecutionStore;
use coderun_common::tasks::{new_compile_task, UnsupportedLanguageError};
use coderun_common::types::{CodeSession, Execution, ExecutionStatus};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct UpdateSessionRequest {
    pub language: Option<String>,
    pub source_code: Option<String>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw)
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, format!("Invalid {} ID format", what)))
}

fn session_view(session: &CodeSession) -> Value {
    json!({
        "session_id": session.id,
        "language": session.language,
        "source_code": session.source_code,
        "status": session.status.external(),
    })
}

/// External view of an execution. Output and timing are only exposed once
/// the run has completed.
pub fn execution_view(execution: &Execution) -> Value {
    let mut view = json!({
        "execution_id": execution.id,
        "status": execution.status.external(),
    });
    if execution.status == ExecutionStatus::Completed {
        view["stdout"] = json!(execution.stdout.clone().unwrap_or_default());
        view["stderr"] = json!(execution.stderr.clone().unwrap_or_default());
        view["execution_time_ms"] = json!(execution.execution_time_ms.unwrap_or_default());
    }
    view
}

/// Build the queued record and its task from a session snapshot. Fails
/// before anything is written when the session's language has no runtime.
pub fn prepare_run(
    session: &CodeSession,
    options: EnqueueOptions,
) -> Result<(Execution, TaskMessage), UnsupportedLanguageError> {
    let execution = Execution::queued(Uuid::new_v4(), Some(session.id));
    let task = new_compile_task(execution.id, &session.language, &session.source_code)?;
    Ok((execution, TaskMessage::new(task, options)))
}

/// GET /status - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// POST /code-sessions - Open a session with an empty python program
pub async fn create_session(State(state): State<Arc<AppState>>) -> Response {
    let session = CodeSession::new();
    let mut conn = state.redis.clone();

    match redis::save_session(&mut conn, &session).await {
        Ok(()) => {
            info!(session_id = %session.id, "Session created");
            (
                StatusCode::CREATED,
                Json(json!({
                    "session_id": session.id,
                    "status": session.status.external(),
                })),
            )
                .into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to create session");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create session")
        }
    }
}

/// PATCH /code-sessions/{id} - Replace language and/or source code
pub async fn update_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<UpdateSessionRequest>,
) -> Response {
    let id = match parse_id(&session_id, "session") {
        Ok(id) => id,
        Err(response) => return response,
    };

    let mut conn = state.redis.clone();
    let mut session = match redis::get_session(&mut conn, &id).await {
        Ok(Some(session)) => session,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Session not found"),
        Err(e) => {
            error!(session_id = %id, error = %e, "Failed to load session");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load session");
        }
    };

    if let Some(language) = request.language {
        session.language = language;
    }
    if let Some(source_code) = request.source_code {
        session.source_code = source_code;
    }
    session.updated_at = Utc::now();

    match redis::save_session(&mut conn, &session).await {
        Ok(()) => {
            info!(session_id = %id, language = %session.language, "Session updated");
            (StatusCode::OK, Json(session_view(&session))).into_response()
        }
        Err(e) => {
            error!(session_id = %id, error = %e, "Failed to save session");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save session")
        }
    }
}

/// POST /code-sessions/{id}/run - Queue an execution of the session's code
pub async fn run_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Response {
    let id = match parse_id(&session_id, "session") {
        Ok(id) => id,
        Err(response) => return response,
    };

    let mut conn = state.redis.clone();
    let session = match redis::get_session(&mut conn, &id).await {
        Ok(Some(session)) => session,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Session not found"),
        Err(e) => {
            error!(session_id = %id, error = %e, "Failed to load session");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load session");
        }
    };

    let (execution, message) = match prepare_run(&session, state.enqueue) {
        Ok(prepared) => prepared,
        Err(e) => {
            warn!(session_id = %id, language = %e.0, "Run rejected");
            return error_response(StatusCode::UNPROCESSABLE_ENTITY, e.to_string());
        }
    };

    match redis::submit_execution(&mut conn, &execution, &message).await {
        Ok(()) => {
            info!(
                session_id = %id,
                execution_id = %execution.id,
                task_type = %message.task.type_tag,
                "Execution queued"
            );
            (
                StatusCode::CREATED,
                Json(json!({
                    "execution_id": execution.id,
                    "status": execution.status.external(),
                })),
            )
                .into_response()
        }
        Err(e) => {
            error!(session_id = %id, error = %e, "Failed to queue execution");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to queue execution")
        }
    }
}

/// GET /executions/{id} - Query execution status and output
pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> Response {
    let id = match parse_id(&execution_id, "execution") {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.store.get(id).await {
        Ok(Some(execution)) => {
            info!(execution_id = %id, status = %execution.status, "Execution retrieved");
            (StatusCode::OK, Json(execution_view(&execution))).into_response()
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Execution not found"),
        Err(e) => {
            error!(execution_id = %id, error = %e, "Failed to fetch execution");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to query execution: {}", e),
            )
        }
    }
}
