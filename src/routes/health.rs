use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value as JsonValue;

use crate::error::AppResult;
use crate::state::AppState;

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct IntegrationStatus {
    pub category: String,
    pub name: String,
    pub status: String,
    pub recorded_at: String,
    pub metadata: JsonValue,
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct DetailedHealthResponse {
    pub status: String,
    pub database: bool,
    pub cache: bool,
    pub integrations: Vec<IntegrationStatus>,
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "OK", body = HealthResponse))
)]
pub(crate) async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[utoipa::path(
    get,
    path = "/health/detailed",
    responses((status = 200, description = "Component health", body = DetailedHealthResponse))
)]
pub(crate) async fn detailed_health_handler(
    State(state): State<AppState>,
) -> AppResult<Json<DetailedHealthResponse>> {
    let database = sqlx::query("SELECT 1").execute(&state.db).await.is_ok();
    let cache = state.cache.ping().await.is_ok();

    let integrations = if database {
        state
            .store
            .latest_integration_status()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|row| IntegrationStatus {
                category: row.category,
                name: row.name,
                status: row.status,
                recorded_at: row.recorded_at.to_rfc3339(),
                metadata: row.metadata.0,
            })
            .collect()
    } else {
        Vec::new()
    };

    let status = if database && cache { "ok" } else { "degraded" };
    Ok(Json(DetailedHealthResponse {
        status: status.to_string(),
        database,
        cache,
        integrations,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/detailed", get(detailed_health_handler))
}
