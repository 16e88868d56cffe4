use axum::extract::{OriginalUri, Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use super::tasks::{accepted_response, enforce_plot_command_rate, TaskAccepted};
use crate::error::{internal_error, AppError, AppResult};
use crate::jobs::types::JobKind;
use crate::state::AppState;
use crate::storage::timeseries::Assessment;

const DEFAULT_PAGE_SIZE: i64 = 10;
const MAX_WINDOW_DAYS: u32 = 365;

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct AssessRequest {
    pub plot_id: String,
    pub policy_id: String,
    pub farmer_address: String,
    #[serde(default = "default_window_days")]
    pub window_days: u32,
}

fn default_window_days() -> u32 {
    7
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct PageQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

#[utoipa::path(
    post,
    path = "/v1/damage/assess",
    request_body = AssessRequest,
    responses(
        (status = 200, description = "Evidence bundle enqueued", body = TaskAccepted),
        (status = 422, description = "Invalid request"),
        (status = 429, description = "Per-plot rate limit exceeded")
    )
)]
pub(crate) async fn assess_handler(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Json(request): Json<AssessRequest>,
) -> AppResult<Json<TaskAccepted>> {
    if request.plot_id.trim().is_empty() || request.policy_id.trim().is_empty() {
        return Err(AppError::validation("plot_id and policy_id are required")
            .with_path(uri.path().to_string()));
    }
    if request.farmer_address.trim().is_empty() {
        return Err(
            AppError::validation("farmer_address is required").with_path(uri.path().to_string())
        );
    }
    if request.window_days == 0 || request.window_days > MAX_WINDOW_DAYS {
        return Err(AppError::validation(format!(
            "window_days must be within 1..={MAX_WINDOW_DAYS}"
        )));
    }

    enforce_plot_command_rate(
        &state,
        "damage_assess",
        &request.plot_id,
        state.config.damage_assess_rate_per_hour,
    )
    .await?;

    let payload = json!({
        "plot_id": request.plot_id,
        "policy_id": request.policy_id,
        "farmer_address": request.farmer_address,
        "window_days": request.window_days,
    });
    let dedup_key = format!("{}:{}", request.plot_id, request.policy_id);
    let outcome = state
        .jobs
        .submitter()
        .submit(JobKind::BundleEvidence, payload, Some(&dedup_key))
        .await
        .map_err(AppError::from)?;

    accepted_response(outcome)
}

#[utoipa::path(
    get,
    path = "/v1/damage/assessments/{plot}",
    params(PageQuery),
    responses((status = 200, description = "Recent assessments", body = [Assessment]))
)]
pub(crate) async fn recent_assessments_handler(
    State(state): State<AppState>,
    Path(plot_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> AppResult<Json<Vec<Assessment>>> {
    let assessments = state
        .store
        .recent_assessments(
            &plot_id,
            page.limit.unwrap_or(DEFAULT_PAGE_SIZE),
            page.offset.unwrap_or(0),
        )
        .await
        .map_err(internal_error)?;
    Ok(Json(assessments))
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct AssessmentResponse {
    #[serde(flatten)]
    pub assessment: Assessment,
    /// Gateway URL for the published evidence document.
    pub evidence_url: String,
}

#[utoipa::path(
    get,
    path = "/v1/damage/assessment/{id}",
    responses(
        (status = 200, description = "One assessment", body = AssessmentResponse),
        (status = 404, description = "Unknown assessment")
    )
)]
pub(crate) async fn assessment_handler(
    State(state): State<AppState>,
    Path(assessment_id): Path<String>,
) -> AppResult<Json<AssessmentResponse>> {
    let cache_key = format!("assessment:{assessment_id}");
    let assessment = match state.cache.get_json::<Assessment>(&cache_key).await {
        Ok(Some(cached)) => cached,
        _ => {
            let assessment = state
                .store
                .assessment(&assessment_id)
                .await
                .map_err(internal_error)?
                .ok_or_else(|| {
                    AppError::not_found(format!("unknown assessment {assessment_id}"))
                })?;
            if let Err(err) = state
                .cache
                .set_json(&cache_key, &assessment, state.config.cache_damage_ttl)
                .await
            {
                tracing::warn!(error = %err, "assessment cache write failed");
            }
            assessment
        }
    };

    let evidence_url = state.content.url_for(&assessment.evidence_cid);
    Ok(Json(AssessmentResponse {
        assessment,
        evidence_url,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/damage/assess", post(assess_handler))
        .route("/damage/assessments/{plot}", get(recent_assessments_handler))
        .route("/damage/assessment/{id}", get(assessment_handler))
}
