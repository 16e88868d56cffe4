pub mod damage_tasks;
pub mod health_tasks;
pub mod planet_tasks;
pub mod schedule;
pub mod store;
pub mod types;
pub mod weather_tasks;

use crate::clients::weatherxm::WeatherStationClient;
use crate::config::ProcessorConfig;
use crate::error::PipelineError;
use crate::services::events::EventBus;
use crate::services::evidence::EvidenceBundler;
use crate::services::satellite::SubscriptionManager;
use crate::storage::cache::CacheStore;
use crate::storage::timeseries::TimeseriesStore;
use chrono::Utc;
use rand::Rng;
use schedule::{occurrence_dedup_key, PERIODIC_TABLE};
use serde_json::{json, Value as JsonValue};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use types::{JobKind, JobRow, Queue};
use uuid::Uuid;

/// Beat granularity for the periodic scheduler.
const BEAT_TICK: Duration = Duration::from_secs(20);
/// Retry backoff ceiling.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(3600);
/// Periodic sweeps stop enqueueing when a queue backs up this far; command
/// submissions are unaffected.
const MAX_PENDING_PER_QUEUE: i64 = 500;

#[derive(Debug, Clone, Copy)]
pub struct SubmitOutcome {
    pub job_id: Option<Uuid>,
    /// True when the dedup gate absorbed this enqueue.
    pub absorbed: bool,
}

/// The only path for enqueueing work, including cross-kind enqueues from
/// inside tasks. A set-if-absent lease in the cache absorbs duplicate
/// submissions inside the dedup window; the job store additionally refuses a
/// second active row for the same (kind, dedup key).
pub struct JobSubmitter {
    db: PgPool,
    cache: CacheStore,
    dedup_ttl: Duration,
}

impl JobSubmitter {
    pub fn new(db: PgPool, cache: CacheStore, dedup_ttl: Duration) -> Self {
        Self {
            db,
            cache,
            dedup_ttl,
        }
    }

    pub async fn submit(
        &self,
        kind: JobKind,
        payload: JsonValue,
        dedup_key: Option<&str>,
    ) -> Result<SubmitOutcome, PipelineError> {
        self.submit_with_ttl(kind, payload, dedup_key, self.dedup_ttl)
            .await
    }

    pub async fn submit_with_ttl(
        &self,
        kind: JobKind,
        payload: JsonValue,
        dedup_key: Option<&str>,
        dedup_ttl: Duration,
    ) -> Result<SubmitOutcome, PipelineError> {
        if let Some(key) = dedup_key {
            let lease_key = format!("dedup:{}:{key}", kind.name());
            match self.cache.acquire_lease(&lease_key, dedup_ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    // The gate already fired for this window: this submission
                    // is absorbed, pointing at the live job when one remains.
                    tracing::debug!(kind = kind.name(), dedup_key = key, "enqueue absorbed by dedup gate");
                    let existing = store::find_active(&self.db, kind, key).await?;
                    return Ok(SubmitOutcome {
                        job_id: existing.map(|job| job.id),
                        absorbed: true,
                    });
                }
                Err(err) => {
                    // Losing the cache degrades dedup to the job store's
                    // active-row check, which downstream idempotency absorbs.
                    tracing::warn!(error = %err, "dedup gate unavailable; relying on job store");
                }
            }
        }

        let (job, created) = store::enqueue(&self.db, kind, payload, dedup_key).await?;
        Ok(SubmitOutcome {
            job_id: Some(job.id),
            absorbed: !created,
        })
    }
}

/// Root context handed to every task: typed handles only, no globals.
pub struct TaskContext {
    pub config: ProcessorConfig,
    pub store: TimeseriesStore,
    pub cache: CacheStore,
    pub weather: Arc<WeatherStationClient>,
    pub satellite: Arc<SubscriptionManager>,
    pub bundler: Arc<EvidenceBundler>,
    pub events: EventBus,
    pub submitter: Arc<JobSubmitter>,
}

pub struct JobService {
    db: PgPool,
    ctx: Arc<TaskContext>,
    queue_concurrency: usize,
    poll_interval: Duration,
    soft_time_limit: Duration,
    hard_time_limit: Duration,
}

impl JobService {
    pub fn new(db: PgPool, ctx: Arc<TaskContext>) -> Self {
        let config = &ctx.config;
        Self {
            queue_concurrency: config.queue_concurrency.max(1),
            poll_interval: config.job_poll_interval,
            soft_time_limit: config.task_soft_time_limit,
            hard_time_limit: config.task_time_limit,
            db,
            ctx,
        }
    }

    pub fn submitter(&self) -> Arc<JobSubmitter> {
        self.ctx.submitter.clone()
    }

    pub async fn job(&self, job_id: Uuid) -> Result<Option<JobRow>, sqlx::Error> {
        store::job(&self.db, job_id).await
    }

    pub async fn job_result(&self, job_id: Uuid) -> Result<Option<JsonValue>, sqlx::Error> {
        store::job_result(&self.db, job_id).await
    }

    pub async fn queue_depths(&self) -> Result<Vec<store::QueueDepthRow>, sqlx::Error> {
        store::queue_depths(&self.db).await
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken, enable_beat: bool) {
        for queue in Queue::ALL {
            self.clone().start_queue(queue, cancel.clone());
        }
        if enable_beat {
            self.start_beat(cancel);
        }
    }

    fn start_queue(self: Arc<Self>, queue: Queue, cancel: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.queue_concurrency));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }

                while let Ok(permit) = semaphore.clone().try_acquire_owned() {
                    let job = match store::claim_next_pending(&self.db, queue).await {
                        Ok(Some(job)) => job,
                        Ok(None) => {
                            drop(permit);
                            break;
                        }
                        Err(err) => {
                            tracing::warn!(queue = queue.as_str(), error = %err, "job claim failed");
                            drop(permit);
                            break;
                        }
                    };

                    let service = self.clone();
                    let span = tracing::info_span!(
                        "job",
                        job_id = %job.id,
                        kind = %job.kind,
                        queue = queue.as_str(),
                        attempt = job.attempts,
                    );
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(err) = service.run_one(job).instrument(span).await {
                            tracing::warn!(error = %err, "job runner error");
                        }
                    });
                }
            }
        });
    }

    fn start_beat(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            let now = Utc::now();
            let mut due: Vec<(usize, chrono::DateTime<Utc>)> = PERIODIC_TABLE
                .iter()
                .enumerate()
                .map(|(idx, entry)| (idx, entry.cadence.next_occurrence(now)))
                .collect();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(BEAT_TICK) => {}
                }

                let now = Utc::now();
                for (idx, next_at) in due.iter_mut() {
                    if now < *next_at {
                        continue;
                    }
                    let entry = &PERIODIC_TABLE[*idx];
                    let occurrence = *next_at;
                    *next_at = entry.cadence.next_occurrence(now);

                    match store::pending_count(&self.db, entry.kind.queue()).await {
                        Ok(depth) if depth > MAX_PENDING_PER_QUEUE => {
                            tracing::warn!(
                                kind = entry.kind.name(),
                                queue = entry.kind.queue().as_str(),
                                depth,
                                "queue saturated; skipping periodic enqueue"
                            );
                            continue;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(error = %err, "queue depth check failed");
                        }
                    }

                    let key = occurrence_dedup_key(entry.kind, occurrence);
                    let ttl = entry
                        .cadence
                        .period()
                        .to_std()
                        .unwrap_or(Duration::from_secs(300));
                    if let Err(err) = self
                        .ctx
                        .submitter
                        .submit_with_ttl(entry.kind, json!({}), Some(&key), ttl)
                        .await
                    {
                        tracing::warn!(
                            kind = entry.kind.name(),
                            error = %err,
                            "periodic enqueue failed"
                        );
                    }
                }
            }
        });
    }

    async fn run_one(&self, job: JobRow) -> Result<(), sqlx::Error> {
        let Some(kind) = job.kind_enum() else {
            store::mark_quarantined(&self.db, job.id, "unsupported job kind").await?;
            return Ok(());
        };
        let policy = kind.retry_policy();

        // Soft limit raises cooperative cancellation; the hard limit tears
        // the task future down.
        let task_cancel = CancellationToken::new();
        let soft_guard = {
            let soft = self.soft_time_limit;
            let cancel = task_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(soft).await;
                cancel.cancel();
            })
        };

        let outcome = tokio::time::timeout(
            self.hard_time_limit,
            self.execute(kind, &job, task_cancel.clone()),
        )
        .await;
        soft_guard.abort();

        match outcome {
            Ok(Ok(result)) => {
                store::mark_completed(&self.db, job.id, result).await?;
                tracing::info!(status = "completed", "job finished");
            }
            Ok(Err(PipelineError::Cancelled)) => {
                store::mark_cancelled_requeue(&self.db, job.id).await?;
                tracing::info!(status = "cancelled", "job re-enqueued after cancellation");
            }
            Ok(Err(err)) => {
                self.handle_failure(&job, kind, policy.max_attempts, policy.base_backoff, err)
                    .await?;
            }
            Err(_) => {
                let err = PipelineError::Timeout;
                tracing::warn!(
                    hard_limit_seconds = self.hard_time_limit.as_secs(),
                    "job exceeded hard time limit; worker torn down"
                );
                self.handle_failure(&job, kind, policy.max_attempts, policy.base_backoff, err)
                    .await?;
            }
        }
        Ok(())
    }

    async fn handle_failure(
        &self,
        job: &JobRow,
        kind: JobKind,
        max_attempts: u32,
        base_backoff: Duration,
        err: PipelineError,
    ) -> Result<(), sqlx::Error> {
        let attempts = job.attempts.max(1) as u32;

        if err.is_retryable() && attempts < max_attempts {
            let exp = base_backoff.saturating_mul(2u32.saturating_pow(attempts - 1));
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
            let backoff = exp.min(MAX_RETRY_BACKOFF) + jitter;
            let not_before = Utc::now()
                + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::seconds(60));
            store::mark_retry(&self.db, job.id, not_before, &err.to_string()).await?;
            tracing::warn!(
                status = "retrying",
                attempts,
                max_attempts,
                backoff_seconds = backoff.as_secs(),
                error = %err,
                "job failed; retry scheduled"
            );
            return Ok(());
        }

        store::mark_quarantined(&self.db, job.id, &err.to_string()).await?;
        match &err {
            PipelineError::Fatal(_) => {
                tracing::error!(status = "quarantined", error = %err, "job hit an invariant violation");
                self.ctx.events.alert(
                    "task invariant violation",
                    json!({ "job_id": job.id, "kind": kind.name(), "error": err.to_string() }),
                );
            }
            // The normal outcome of a quiet plot: recorded, not alerted.
            PipelineError::InsufficientData(_) => {
                tracing::info!(status = "quarantined", error = %err, "job had insufficient data");
            }
            _ => {
                tracing::warn!(status = "quarantined", attempts, error = %err, "job quarantined");
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        kind: JobKind,
        job: &JobRow,
        cancel: CancellationToken,
    ) -> Result<JsonValue, PipelineError> {
        let ctx = self.ctx.as_ref();
        match kind {
            JobKind::SweepWeather => weather_tasks::sweep_weather(ctx, &cancel).await,
            JobKind::FetchPlotWeather => {
                weather_tasks::fetch_plot_weather(ctx, parse_payload(job)?).await
            }
            JobKind::DailyWeatherIndices => {
                weather_tasks::daily_weather_indices(ctx, &cancel).await
            }
            JobKind::ComputePlotIndices => {
                weather_tasks::compute_plot_indices(ctx, parse_payload(job)?).await
            }
            JobKind::CheckWeatherTriggers => {
                weather_tasks::check_weather_triggers(ctx, &cancel).await
            }
            JobKind::CheckSubscriptions => planet_tasks::check_subscriptions(ctx).await,
            JobKind::FetchLatestBiomass => planet_tasks::fetch_latest_biomass(ctx, &cancel).await,
            JobKind::RefreshSubscriptionBiomass => {
                planet_tasks::refresh_subscription_biomass(ctx, parse_payload(job)?).await
            }
            JobKind::CancelExpiredSubscriptions => {
                planet_tasks::cancel_expired_subscriptions(ctx).await
            }
            JobKind::MonitorBiomassQuality => planet_tasks::monitor_biomass_quality(ctx).await,
            JobKind::CleanupBiomassCache => planet_tasks::cleanup_biomass_cache(ctx).await,
            JobKind::CreateSubscription => {
                planet_tasks::create_subscription(ctx, parse_payload(job)?).await
            }
            JobKind::CancelSubscription => {
                planet_tasks::cancel_subscription(ctx, parse_payload(job)?).await
            }
            JobKind::ProcessPendingAssessments => {
                damage_tasks::process_pending_assessments(ctx, &cancel).await
            }
            JobKind::BundleEvidence => damage_tasks::bundle_evidence(ctx, parse_payload(job)?).await,
            JobKind::ArchiveOldAssessments => damage_tasks::archive_old_assessments(ctx).await,
            JobKind::HealthCheck => health_tasks::health_check(ctx).await,
        }
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(job: &JobRow) -> Result<T, PipelineError> {
    serde_json::from_value(job.payload.0.clone()).map_err(|err| {
        PipelineError::Permanent(format!("job {} payload failed to decode: {err}", job.id))
    })
}
