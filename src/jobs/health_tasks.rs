use super::TaskContext;
use crate::error::PipelineError;
use serde_json::{json, Value as JsonValue};

/// One-minute heartbeat: verify the database and cache respond and record
/// the outcome where /health/detailed can read it.
pub async fn health_check(ctx: &TaskContext) -> Result<JsonValue, PipelineError> {
    let db_ok = sqlx::query("SELECT 1")
        .execute(ctx.store.pool())
        .await
        .is_ok();
    let cache_ok = ctx.cache.ping().await.is_ok();

    let status = if db_ok && cache_ok { "ok" } else { "degraded" };
    if db_ok {
        ctx.store
            .record_integration_status(
                "core",
                "heartbeat",
                status,
                json!({ "db": db_ok, "cache": cache_ok }),
            )
            .await?;
    }

    if !db_ok || !cache_ok {
        tracing::warn!(db_ok, cache_ok, "health check degraded");
    }
    Ok(json!({ "db": db_ok, "cache": cache_ok, "status": status }))
}
