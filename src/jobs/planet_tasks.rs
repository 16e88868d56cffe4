use super::types::{
    CancelSubscriptionPayload, CreateSubscriptionPayload, JobKind, RefreshBiomassPayload,
};
use super::TaskContext;
use crate::error::PipelineError;
use crate::services::events::PushEventKind;
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use tokio_util::sync::CancellationToken;

/// Six-hourly status sweep across all non-terminal subscriptions.
pub async fn check_subscriptions(ctx: &TaskContext) -> Result<JsonValue, PipelineError> {
    let outcome = ctx.satellite.sweep_statuses().await?;
    ctx.store
        .record_integration_status(
            "satellite",
            "planet",
            if outcome.failed_polls == 0 { "ok" } else { "degraded" },
            json!({
                "checked": outcome.checked,
                "transitioned": outcome.transitioned,
                "failed_polls": outcome.failed_polls,
            }),
        )
        .await?;
    Ok(json!({
        "checked": outcome.checked,
        "transitioned": outcome.transitioned,
        "failed_polls": outcome.failed_polls,
    }))
}

/// Daily fan-out: one biomass refresh task per live subscription.
pub async fn fetch_latest_biomass(
    ctx: &TaskContext,
    cancel: &CancellationToken,
) -> Result<JsonValue, PipelineError> {
    let subscriptions = ctx.store.non_terminal_subscriptions().await?;
    let mut enqueued = 0usize;
    for subscription in &subscriptions {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let payload = json!({ "subscription_id": subscription.subscription_id });
        let outcome = ctx
            .submitter
            .submit(
                JobKind::RefreshSubscriptionBiomass,
                payload,
                Some(&subscription.subscription_id),
            )
            .await?;
        if !outcome.absorbed {
            enqueued += 1;
        }
    }
    Ok(json!({ "subscriptions": subscriptions.len(), "enqueued": enqueued }))
}

/// Pulls deliveries for one subscription and refreshes the rolling cache.
pub async fn refresh_subscription_biomass(
    ctx: &TaskContext,
    payload: RefreshBiomassPayload,
) -> Result<JsonValue, PipelineError> {
    let subscription = ctx
        .store
        .subscription(&payload.subscription_id)
        .await?
        .ok_or_else(|| {
            PipelineError::InsufficientData(format!(
                "unknown subscription {}",
                payload.subscription_id
            ))
        })?;

    let summary = ctx.satellite.refresh_biomass(&subscription).await?;

    let cache_key = format!("biomass_summary:{}", subscription.plot_id);
    if let Err(err) = ctx
        .cache
        .set_json(&cache_key, &summary, ctx.config.cache_satellite_ttl)
        .await
    {
        tracing::warn!(error = %err, "biomass summary cache write failed");
    }

    ctx.events.publish(
        PushEventKind::SatelliteUpdate,
        Some(&subscription.plot_id),
        json!({
            "current": summary.current,
            "deviation_percent": summary.deviation_percent,
            "trend": summary.trend,
            "stress": summary.stress.as_str(),
        }),
    );

    Ok(json!({
        "plot_id": summary.plot_id,
        "sample_count": summary.sample_count,
        "current": summary.current,
        "deviation_percent": summary.deviation_percent,
    }))
}

/// Daily end-date sweep.
pub async fn cancel_expired_subscriptions(ctx: &TaskContext) -> Result<JsonValue, PipelineError> {
    let expired = ctx.satellite.expire_ended(Utc::now()).await?;
    Ok(json!({ "expired": expired }))
}

/// Daily data-quality watch; flagged plots become alerts.
pub async fn monitor_biomass_quality(ctx: &TaskContext) -> Result<JsonValue, PipelineError> {
    let flagged = ctx.satellite.poor_quality_plots().await?;
    for plot_id in &flagged {
        ctx.events.publish(
            PushEventKind::Alert,
            Some(plot_id),
            json!({ "message": "biomass data quality degraded" }),
        );
    }
    ctx.store
        .record_integration_status(
            "satellite",
            "biomass_quality",
            if flagged.is_empty() { "ok" } else { "degraded" },
            json!({ "flagged_plots": flagged }),
        )
        .await?;
    Ok(json!({ "flagged": flagged.len() }))
}

/// Weekly cache cleanup: retention-bounded delete of old biomass rows.
pub async fn cleanup_biomass_cache(ctx: &TaskContext) -> Result<JsonValue, PipelineError> {
    let deleted = ctx
        .store
        .delete_biomass_older_than(i64::from(ctx.config.biomass_data_retention_days))
        .await?;
    Ok(json!({ "deleted": deleted }))
}

/// Ad-hoc command: create the upstream subscription for a policy plot.
pub async fn create_subscription(
    ctx: &TaskContext,
    payload: CreateSubscriptionPayload,
) -> Result<JsonValue, PipelineError> {
    let subscription = ctx
        .satellite
        .create_subscription(
            &payload.policy_id,
            &payload.plot_id,
            &payload.geometry,
            payload.start_at,
            payload.end_at,
        )
        .await?;

    ctx.events.publish(
        PushEventKind::SatelliteUpdate,
        Some(&payload.plot_id),
        json!({
            "subscription_id": subscription.subscription_id,
            "status": subscription.status.as_str(),
        }),
    );
    Ok(json!({
        "subscription_id": subscription.subscription_id,
        "status": subscription.status.as_str(),
    }))
}

/// Ad-hoc command: explicit cancel. Terminal subscriptions no-op.
pub async fn cancel_subscription(
    ctx: &TaskContext,
    payload: CancelSubscriptionPayload,
) -> Result<JsonValue, PipelineError> {
    let cancelled = ctx.satellite.cancel(&payload.subscription_id).await?;
    Ok(json!({ "subscription_id": payload.subscription_id, "cancelled": cancelled }))
}
