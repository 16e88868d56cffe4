use axum::extract::State;
use axum::routing::get;
use axum::Router;
use std::fmt::Write;

use crate::error::{internal_error, AppResult};
use crate::state::AppState;

/// Plain-text exposition of queue depths, one gauge per (queue, status).
#[utoipa::path(
    get,
    path = "/metrics",
    responses((status = 200, description = "Prometheus-style text metrics", body = String))
)]
pub(crate) async fn metrics_handler(State(state): State<AppState>) -> AppResult<String> {
    let depths = state.jobs.queue_depths().await.map_err(internal_error)?;

    let mut out = String::new();
    let _ = writeln!(
        out,
        "# HELP processor_jobs Job count by queue and status.\n# TYPE processor_jobs gauge"
    );
    for row in depths {
        let _ = writeln!(
            out,
            "processor_jobs{{queue=\"{}\",status=\"{}\"}} {}",
            row.queue, row.status, row.count
        );
    }
    Ok(out)
}

pub fn router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics_handler))
}
