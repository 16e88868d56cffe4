use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use super::tasks::{accepted_response, enforce_plot_command_rate, TaskAccepted};
use crate::error::{internal_error, AppError, AppResult};
use crate::jobs::types::JobKind;
use crate::services::weather_engine::types::WeatherIndex;
use crate::state::AppState;

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct SubmitWeatherRequest {
    pub plot_id: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct ComputeIndicesRequest {
    pub plot_id: String,
    #[serde(default)]
    pub policy_id: Option<String>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct IndexWindowQuery {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

fn validate_plot_id(plot_id: &str) -> AppResult<()> {
    let trimmed = plot_id.trim();
    if trimmed.is_empty() || trimmed.len() > 64 {
        return Err(AppError::validation("plot_id must be 1-64 characters"));
    }
    Ok(())
}

#[utoipa::path(
    post,
    path = "/v1/weather/submit",
    request_body = SubmitWeatherRequest,
    responses(
        (status = 200, description = "Fetch task enqueued", body = TaskAccepted),
        (status = 422, description = "Invalid request"),
        (status = 429, description = "Per-plot rate limit exceeded")
    )
)]
pub(crate) async fn submit_weather_handler(
    State(state): State<AppState>,
    Json(request): Json<SubmitWeatherRequest>,
) -> AppResult<Json<TaskAccepted>> {
    validate_plot_id(&request.plot_id)?;
    if !(-90.0..=90.0).contains(&request.latitude)
        || !(-180.0..=180.0).contains(&request.longitude)
    {
        return Err(AppError::validation("latitude/longitude out of range"));
    }
    enforce_plot_command_rate(
        &state,
        "weather_submit",
        &request.plot_id,
        state.config.command_rate_per_hour,
    )
    .await?;

    state
        .store
        .upsert_plot(&request.plot_id, request.latitude, request.longitude)
        .await
        .map_err(internal_error)?;

    let payload = json!({ "plot_id": request.plot_id });
    let outcome = state
        .jobs
        .submitter()
        .submit(JobKind::FetchPlotWeather, payload, Some(&request.plot_id))
        .await
        .map_err(AppError::from)?;

    accepted_response(outcome)
}

#[utoipa::path(
    post,
    path = "/v1/weather/indices",
    request_body = ComputeIndicesRequest,
    responses(
        (status = 200, description = "Index computation enqueued", body = TaskAccepted),
        (status = 422, description = "Invalid request"),
        (status = 429, description = "Per-plot rate limit exceeded")
    )
)]
pub(crate) async fn compute_indices_handler(
    State(state): State<AppState>,
    Json(request): Json<ComputeIndicesRequest>,
) -> AppResult<Json<TaskAccepted>> {
    validate_plot_id(&request.plot_id)?;
    if request.window_end <= request.window_start {
        return Err(AppError::validation("window_end must be after window_start"));
    }
    enforce_plot_command_rate(
        &state,
        "weather_indices",
        &request.plot_id,
        state.config.command_rate_per_hour,
    )
    .await?;

    let payload = json!({
        "plot_id": request.plot_id,
        "policy_id": request.policy_id,
        "window_start": request.window_start,
        "window_end": request.window_end,
    });
    let dedup_key = format!(
        "{}:{}:{}",
        request.plot_id,
        request.window_start.timestamp(),
        request.window_end.timestamp()
    );
    let outcome = state
        .jobs
        .submitter()
        .submit(JobKind::ComputePlotIndices, payload, Some(&dedup_key))
        .await
        .map_err(AppError::from)?;

    accepted_response(outcome)
}

#[utoipa::path(
    get,
    path = "/v1/weather/indices/{plot}",
    params(IndexWindowQuery),
    responses(
        (status = 200, description = "Latest weather index", body = WeatherIndex),
        (status = 404, description = "No index for plot")
    )
)]
pub(crate) async fn latest_index_handler(
    State(state): State<AppState>,
    Path(plot_id): Path<String>,
    Query(window): Query<IndexWindowQuery>,
) -> AppResult<Json<WeatherIndex>> {
    validate_plot_id(&plot_id)?;

    let bounded = window.start.is_some() || window.end.is_some();
    if !bounded {
        // Unbounded lookups are served from the cache when it is warm.
        let cache_key = format!("weather_index:{plot_id}");
        if let Ok(Some(cached)) = state.cache.get_json::<WeatherIndex>(&cache_key).await {
            return Ok(Json(cached));
        }
    }

    let index = match (window.start, window.end) {
        (Some(start), Some(end)) if end <= start => {
            return Err(AppError::validation("end must be after start"));
        }
        (Some(start), Some(end)) => state
            .store
            .latest_index_overlapping(&plot_id, start, end)
            .await
            .map_err(internal_error)?,
        _ => state
            .store
            .latest_index(&plot_id)
            .await
            .map_err(internal_error)?,
    };

    let index = index
        .ok_or_else(|| AppError::not_found(format!("no weather index for plot {plot_id}")))?;

    if !bounded {
        let cache_key = format!("weather_index:{plot_id}");
        if let Err(err) = state
            .cache
            .set_json(&cache_key, &index, state.config.cache_weather_ttl)
            .await
        {
            tracing::warn!(error = %err, "weather index cache write failed");
        }
    }
    Ok(Json(index))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/weather/submit", post(submit_weather_handler))
        .route("/weather/indices", post(compute_indices_handler))
        .route("/weather/indices/{plot}", get(latest_index_handler))
}
