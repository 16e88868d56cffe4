use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use super::tasks::{accepted_response, enforce_plot_command_rate, TaskAccepted};
use crate::error::{internal_error, AppError, AppResult};
use crate::jobs::types::JobKind;
use crate::services::satellite::types::{BiomassSummary, Subscription};
use crate::state::AppState;

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CreateSubscriptionRequest {
    pub policy_id: String,
    pub plot_id: String,
    /// GeoJSON polygon of the insured field.
    pub geometry: JsonValue,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

fn validate_polygon(geometry: &JsonValue) -> AppResult<()> {
    let kind = geometry.get("type").and_then(|value| value.as_str());
    if kind != Some("Polygon") && kind != Some("MultiPolygon") {
        return Err(AppError::validation(
            "geometry must be a GeoJSON Polygon or MultiPolygon",
        ));
    }
    if geometry.get("coordinates").and_then(|value| value.as_array()).is_none() {
        return Err(AppError::validation("geometry.coordinates is required"));
    }
    Ok(())
}

#[utoipa::path(
    post,
    path = "/v1/planet/subscription",
    request_body = CreateSubscriptionRequest,
    responses(
        (status = 200, description = "Subscription creation enqueued", body = TaskAccepted),
        (status = 422, description = "Invalid request"),
        (status = 429, description = "Per-plot rate limit exceeded")
    )
)]
pub(crate) async fn create_subscription_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateSubscriptionRequest>,
) -> AppResult<Json<TaskAccepted>> {
    if request.plot_id.trim().is_empty() || request.policy_id.trim().is_empty() {
        return Err(AppError::validation("plot_id and policy_id are required"));
    }
    if request.end_at <= request.start_at {
        return Err(AppError::validation("end_at must be after start_at"));
    }
    validate_polygon(&request.geometry)?;
    enforce_plot_command_rate(
        &state,
        "planet_subscription",
        &request.plot_id,
        state.config.command_rate_per_hour,
    )
    .await?;

    let payload = json!({
        "policy_id": request.policy_id,
        "plot_id": request.plot_id,
        "geometry": request.geometry,
        "start_at": request.start_at,
        "end_at": request.end_at,
    });
    let dedup_key = format!("{}:{}", request.plot_id, request.policy_id);
    let outcome = state
        .jobs
        .submitter()
        .submit(JobKind::CreateSubscription, payload, Some(&dedup_key))
        .await
        .map_err(AppError::from)?;

    accepted_response(outcome)
}

#[utoipa::path(
    get,
    path = "/v1/planet/subscription/{id}",
    responses(
        (status = 200, description = "Subscription record", body = Subscription),
        (status = 404, description = "Unknown subscription")
    )
)]
pub(crate) async fn subscription_handler(
    State(state): State<AppState>,
    Path(subscription_id): Path<String>,
) -> AppResult<Json<Subscription>> {
    let subscription = state
        .store
        .subscription(&subscription_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| AppError::not_found(format!("unknown subscription {subscription_id}")))?;
    Ok(Json(subscription))
}

#[utoipa::path(
    delete,
    path = "/v1/planet/subscription/{id}",
    responses(
        (status = 200, description = "Cancellation enqueued", body = TaskAccepted),
        (status = 404, description = "Unknown subscription"),
        (status = 429, description = "Per-plot rate limit exceeded")
    )
)]
pub(crate) async fn cancel_subscription_handler(
    State(state): State<AppState>,
    Path(subscription_id): Path<String>,
) -> AppResult<Json<TaskAccepted>> {
    // Fail fast on unknown ids so the caller gets a 404 instead of a task
    // that quarantines later.
    let subscription = state
        .store
        .subscription(&subscription_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| AppError::not_found(format!("unknown subscription {subscription_id}")))?;
    enforce_plot_command_rate(
        &state,
        "planet_cancel",
        &subscription.plot_id,
        state.config.command_rate_per_hour,
    )
    .await?;

    let payload = json!({ "subscription_id": subscription_id });
    let outcome = state
        .jobs
        .submitter()
        .submit(JobKind::CancelSubscription, payload, Some(&subscription_id))
        .await
        .map_err(AppError::from)?;

    accepted_response(outcome)
}

#[utoipa::path(
    get,
    path = "/v1/planet/biomass/{plot}",
    responses(
        (status = 200, description = "Biomass summary", body = BiomassSummary),
        (status = 404, description = "No biomass data for plot")
    )
)]
pub(crate) async fn biomass_handler(
    State(state): State<AppState>,
    Path(plot_id): Path<String>,
) -> AppResult<Json<BiomassSummary>> {
    let cache_key = format!("biomass_summary:{plot_id}");
    if let Ok(Some(cached)) = state.cache.get_json::<BiomassSummary>(&cache_key).await {
        return Ok(Json(cached));
    }

    let end = Utc::now().date_naive();
    let start = end - Duration::days(i64::from(state.config.biomass_baseline_window_days));
    let summary = state
        .satellite
        .summary_for_window(&plot_id, start, end)
        .await
        .map_err(AppError::from)?;

    if let Err(err) = state
        .cache
        .set_json(&cache_key, &summary, state.config.cache_satellite_ttl)
        .await
    {
        tracing::warn!(error = %err, "biomass summary cache write failed");
    }
    Ok(Json(summary))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/planet/subscription", post(create_subscription_handler))
        .route(
            "/planet/subscription/{id}",
            get(subscription_handler).delete(cancel_subscription_handler),
        )
        .route("/planet/biomass/{plot}", get(biomass_handler))
}
