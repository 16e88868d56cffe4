use super::types::{BundleEvidencePayload, JobKind};
use super::TaskContext;
use crate::error::PipelineError;
use crate::services::events::PushEventKind;
use crate::services::evidence::EvidenceRequest;
use chrono::{Duration, Utc};
use serde_json::{json, Value as JsonValue};
use tokio_util::sync::CancellationToken;

/// Composite score above which a pending assessment is produced.
const PENDING_COMPOSITE_THRESHOLD: f64 = 0.6;
/// A plot is not re-assessed more often than this.
const REASSESSMENT_COOLDOWN_HOURS: i64 = 24;
const DEFAULT_ASSESSMENT_WINDOW_DAYS: u32 = 7;

/// Ten-minute sweep: stressed plots with an active policy and no fresh
/// assessment get a bundle task.
pub async fn process_pending_assessments(
    ctx: &TaskContext,
    cancel: &CancellationToken,
) -> Result<JsonValue, PipelineError> {
    let since = Utc::now() - Duration::hours(REASSESSMENT_COOLDOWN_HOURS);
    let stressed = ctx
        .store
        .plots_with_composite_at_least(PENDING_COMPOSITE_THRESHOLD, since)
        .await?;

    let mut enqueued = 0usize;
    for (plot_id, _score) in &stressed {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let Some(policy) = ctx.store.active_policy_for_plot(plot_id).await? else {
            continue;
        };

        let recent = ctx.store.recent_assessments(plot_id, 1, 0).await?;
        if recent
            .first()
            .is_some_and(|assessment| assessment.created_at >= since)
        {
            continue;
        }

        let payload = json!({
            "plot_id": plot_id,
            "policy_id": policy.policy_id,
            "farmer_address": policy.farmer_address,
            "window_days": DEFAULT_ASSESSMENT_WINDOW_DAYS,
        });
        let dedup_key = format!("{plot_id}:{}", policy.policy_id);
        let outcome = ctx
            .submitter
            .submit(JobKind::BundleEvidence, payload, Some(&dedup_key))
            .await?;
        if !outcome.absorbed {
            enqueued += 1;
        }
    }

    Ok(json!({ "stressed": stressed.len(), "enqueued": enqueued }))
}

/// Assembles and publishes one evidence bundle. A concurrent duplicate
/// resolves to the existing assessment and no-ops.
pub async fn bundle_evidence(
    ctx: &TaskContext,
    payload: BundleEvidencePayload,
) -> Result<JsonValue, PipelineError> {
    let request = EvidenceRequest {
        plot_id: payload.plot_id.clone(),
        policy_id: payload.policy_id.clone(),
        farmer_address: payload.farmer_address.clone(),
        window_days: payload.window_days,
    };
    let outcome = ctx.bundler.bundle(&request).await?;

    if outcome.created {
        let cache_key = format!("assessment:{}", outcome.assessment.assessment_id);
        if let Err(err) = ctx
            .cache
            .set_json(&cache_key, &outcome.assessment, ctx.config.cache_damage_ttl)
            .await
        {
            tracing::warn!(error = %err, "assessment cache write failed");
        }
        ctx.events.publish(
            PushEventKind::DamageAssessment,
            Some(&payload.plot_id),
            json!({
                "assessment_id": outcome.assessment.assessment_id,
                "evidence_cid": outcome.assessment.evidence_cid,
                "window_days": outcome.assessment.window_days,
            }),
        );
    }

    Ok(json!({
        "assessment_id": outcome.assessment.assessment_id,
        "evidence_cid": outcome.assessment.evidence_cid,
        "created": outcome.created,
    }))
}

/// Daily retention sweep: archive terminal assessments and drop samples that
/// aged out of their retention windows.
pub async fn archive_old_assessments(ctx: &TaskContext) -> Result<JsonValue, PipelineError> {
    let archived = ctx
        .store
        .archive_assessments_older_than(i64::from(ctx.config.assessment_retention_days))
        .await?;
    let samples_deleted = ctx
        .store
        .delete_samples_older_than(i64::from(ctx.config.weather_data_retention_days))
        .await?;
    let biomass_deleted = ctx
        .store
        .delete_biomass_older_than(i64::from(ctx.config.biomass_data_retention_days))
        .await?;

    tracing::info!(archived, samples_deleted, biomass_deleted, "retention sweep finished");
    Ok(json!({
        "archived": archived,
        "samples_deleted": samples_deleted,
        "biomass_deleted": biomass_deleted,
    }))
}
