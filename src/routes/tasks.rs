use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{internal_error, AppError, AppResult};
use crate::jobs::types::JobStatus;
use crate::state::AppState;

/// Response for verbs that enqueue work.
#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct TaskAccepted {
    pub task_id: Uuid,
    pub status: &'static str,
}

/// Per-plot command limit, enforced through the shared cache's atomic
/// counter with a one-hour TTL. Every mutating verb on the command surface
/// passes through here before enqueueing. An unavailable cache degrades to
/// unlimited rather than rejecting commands.
pub(crate) async fn enforce_plot_command_rate(
    state: &AppState,
    verb: &'static str,
    plot_id: &str,
    limit_per_hour: u32,
) -> AppResult<()> {
    let rate_key = format!("rate:{verb}:{plot_id}");
    match state
        .cache
        .incr_with_ttl(&rate_key, std::time::Duration::from_secs(3600))
        .await
    {
        Ok(count) if count > i64::from(limit_per_hour) => Err(AppError::rate_limited(format!(
            "plot {plot_id} exceeded {limit_per_hour} {verb} requests per hour"
        ))),
        Ok(_) => Ok(()),
        Err(err) => {
            tracing::warn!(error = %err, verb, "command rate counter unavailable");
            Ok(())
        }
    }
}

/// Maps a submit outcome onto the command response. An enqueue absorbed by
/// the dedup gate with no surviving job row means the same request already
/// ran inside this window.
pub(crate) fn accepted_response(
    outcome: crate::jobs::SubmitOutcome,
) -> AppResult<Json<TaskAccepted>> {
    match outcome.job_id {
        Some(task_id) => Ok(Json(TaskAccepted {
            task_id,
            status: "pending",
        })),
        None => Err(AppError::new(
            axum::http::StatusCode::CONFLICT,
            "conflict",
            "an identical request was already processed in this window",
        )),
    }
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct TaskStateResponse {
    pub task_id: Uuid,
    pub kind: String,
    /// One of pending, completed, failed.
    pub status: &'static str,
    pub attempts: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[utoipa::path(
    get,
    path = "/tasks/{id}",
    responses(
        (status = 200, description = "Task state", body = TaskStateResponse),
        (status = 404, description = "Unknown task")
    )
)]
pub(crate) async fn task_state_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<TaskStateResponse>> {
    let job = state
        .jobs
        .job(id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| AppError::not_found(format!("unknown task {id}")))?;

    // Running collapses onto pending for the external contract.
    let status = match job.status_enum() {
        JobStatus::Pending | JobStatus::Running => "pending",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
    };

    let result = if status == "completed" {
        state.jobs.job_result(id).await.map_err(internal_error)?
    } else {
        None
    };

    Ok(Json(TaskStateResponse {
        task_id: job.id,
        kind: job.kind,
        status,
        attempts: job.attempts,
        result,
        error: job.last_error,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/tasks/{id}", get(task_state_handler))
}
