use super::types::{ComputePlotIndicesPayload, FetchPlotWeatherPayload, JobKind};
use super::TaskContext;
use crate::error::PipelineError;
use crate::services::events::PushEventKind;
use crate::services::weather_engine::{self, EngineParams};
use chrono::{Duration, Utc};
use serde_json::{json, Value as JsonValue};
use tokio_util::sync::CancellationToken;

/// Plots are swept while they have at least one sample in this window.
const SWEEP_LOOKBACK_DAYS: i64 = 30;
/// How far back each per-plot fetch reaches; overlaps are absorbed by the
/// insert-only sample table.
const FETCH_WINDOW_HOURS: i64 = 6;
/// Composite score at which a plot is offered for evidence bundling.
const COMPOSITE_TRIGGER_THRESHOLD: f64 = 0.6;
/// Default assessment lookback for trigger-driven bundles.
const DEFAULT_ASSESSMENT_WINDOW_DAYS: u32 = 7;

/// Five-minute sweep: enumerate eligible plots and fan out one fetch task
/// each. The sweep itself does no network I/O.
pub async fn sweep_weather(
    ctx: &TaskContext,
    cancel: &CancellationToken,
) -> Result<JsonValue, PipelineError> {
    let plots = ctx.store.active_plots(SWEEP_LOOKBACK_DAYS).await?;
    let mut enqueued = 0usize;
    let mut absorbed = 0usize;
    for plot in &plots {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let payload = json!({ "plot_id": plot.plot_id });
        let outcome = ctx
            .submitter
            .submit(JobKind::FetchPlotWeather, payload, Some(&plot.plot_id))
            .await?;
        if outcome.absorbed {
            absorbed += 1;
        } else {
            enqueued += 1;
        }
    }
    tracing::info!(plots = plots.len(), enqueued, absorbed, "weather sweep fanned out");
    Ok(json!({ "plots": plots.len(), "enqueued": enqueued, "absorbed": absorbed }))
}

/// Per-plot fetch: nearest stations, recent samples, insert-only append.
pub async fn fetch_plot_weather(
    ctx: &TaskContext,
    payload: FetchPlotWeatherPayload,
) -> Result<JsonValue, PipelineError> {
    let plot = ctx
        .store
        .plot(&payload.plot_id)
        .await?
        .ok_or_else(|| {
            PipelineError::InsufficientData(format!("unknown plot {}", payload.plot_id))
        })?;

    let end = Utc::now();
    let start = end - Duration::hours(FETCH_WINDOW_HOURS);
    let samples = ctx
        .weather
        .samples_for_location(plot.latitude, plot.longitude, start, end)
        .await?;

    if samples.is_empty() {
        // No stations or no new readings: a quiet outcome, not a failure.
        ctx.store
            .record_integration_status(
                "weather",
                "weatherxm",
                "empty",
                json!({ "plot_id": payload.plot_id }),
            )
            .await?;
        return Ok(json!({ "fetched": 0, "stored": 0 }));
    }

    let stored = ctx.store.append_samples(&payload.plot_id, &samples).await?;
    ctx.store
        .record_integration_status(
            "weather",
            "weatherxm",
            "ok",
            json!({ "plot_id": payload.plot_id, "fetched": samples.len(), "stored": stored }),
        )
        .await?;
    ctx.events.publish(
        PushEventKind::WeatherUpdate,
        Some(&payload.plot_id),
        json!({ "new_samples": stored }),
    );
    Ok(json!({ "fetched": samples.len(), "stored": stored }))
}

/// Midnight sweep: one index computation per plot over the previous UTC day.
pub async fn daily_weather_indices(
    ctx: &TaskContext,
    cancel: &CancellationToken,
) -> Result<JsonValue, PipelineError> {
    let yesterday = Utc::now().date_naive() - Duration::days(1);
    let window_start = yesterday
        .and_hms_opt(0, 0, 0)
        .expect("midnight exists")
        .and_utc();
    let window_end = yesterday
        .and_hms_opt(23, 59, 59)
        .expect("end of day exists")
        .and_utc();

    let plots = ctx.store.active_plots(SWEEP_LOOKBACK_DAYS).await?;
    let mut enqueued = 0usize;
    for plot in &plots {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let payload = json!({
            "plot_id": plot.plot_id,
            "policy_id": null,
            "window_start": window_start,
            "window_end": window_end,
        });
        let dedup_key = format!("{}:{yesterday}", plot.plot_id);
        let outcome = ctx
            .submitter
            .submit(JobKind::ComputePlotIndices, payload, Some(&dedup_key))
            .await?;
        if !outcome.absorbed {
            enqueued += 1;
        }
    }
    Ok(json!({ "plots": plots.len(), "enqueued": enqueued, "day": yesterday.to_string() }))
}

/// Runs the pure engine over a stored sample window and commits a new index
/// row. Reprocessing never mutates an existing row.
pub async fn compute_plot_indices(
    ctx: &TaskContext,
    payload: ComputePlotIndicesPayload,
) -> Result<JsonValue, PipelineError> {
    let samples = ctx
        .store
        .sample_range(&payload.plot_id, payload.window_start, payload.window_end)
        .await?;

    let params = EngineParams::from_config(&ctx.config);
    let index = weather_engine::compute_weather_index(
        &params,
        &payload.plot_id,
        payload.policy_id.as_deref(),
        payload.window_start,
        payload.window_end,
        &samples,
    )?;

    ctx.store.insert_index(&index).await?;

    let cache_key = format!("weather_index:{}", payload.plot_id);
    if let Err(err) = ctx
        .cache
        .set_json(&cache_key, &index, ctx.config.cache_weather_ttl)
        .await
    {
        tracing::warn!(error = %err, "weather index cache write failed");
    }

    ctx.events.publish(
        PushEventKind::WeatherUpdate,
        Some(&payload.plot_id),
        json!({
            "composite_score": index.composite_score,
            "dominant_stress": index.dominant_stress.as_str(),
            "window_start": index.window_start,
            "window_end": index.window_end,
        }),
    );

    Ok(json!({
        "plot_id": index.plot_id,
        "composite_score": index.composite_score,
        "dominant_stress": index.dominant_stress.as_str(),
        "sample_count": index.sample_count,
        "is_anomaly": index.is_anomaly,
    }))
}

/// Ten-minute sweep over fresh indices; stressed plots with an active policy
/// get an evidence-bundle task. Cross-kind enqueues go through the typed
/// submit API only.
pub async fn check_weather_triggers(
    ctx: &TaskContext,
    cancel: &CancellationToken,
) -> Result<JsonValue, PipelineError> {
    let since = Utc::now() - Duration::hours(24);
    let triggered = ctx
        .store
        .plots_with_composite_at_least(COMPOSITE_TRIGGER_THRESHOLD, since)
        .await?;

    let mut bundles = 0usize;
    let mut skipped_no_policy = 0usize;
    for (plot_id, composite_score) in &triggered {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let Some(policy) = ctx.store.active_policy_for_plot(plot_id).await? else {
            skipped_no_policy += 1;
            continue;
        };

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
            bundles += 1;
            ctx.events.publish(
                PushEventKind::Alert,
                Some(plot_id),
                json!({
                    "message": "weather trigger crossed",
                    "composite_score": composite_score,
                }),
            );
        }
    }

    Ok(json!({
        "triggered": triggered.len(),
        "bundles_enqueued": bundles,
        "skipped_no_policy": skipped_no_policy,
    }))
}
