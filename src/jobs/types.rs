use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::types::Json as SqlJson;
use std::time::Duration;
use uuid::Uuid;

/// Worker queues. A task kind is statically assigned to exactly one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Queue {
    Default,
    Weather,
    Planet,
    Damage,
}

impl Queue {
    pub const ALL: [Queue; 4] = [Queue::Default, Queue::Weather, Queue::Planet, Queue::Damage];

    pub fn as_str(&self) -> &'static str {
        match self {
            Queue::Default => "default",
            Queue::Weather => "weather",
            Queue::Planet => "planet",
            Queue::Damage => "damage",
        }
    }
}

/// Stable task-kind names (`domain.verb`), used for dedup-key composition,
/// routing and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    SweepWeather,
    FetchPlotWeather,
    DailyWeatherIndices,
    ComputePlotIndices,
    CheckWeatherTriggers,
    CheckSubscriptions,
    FetchLatestBiomass,
    RefreshSubscriptionBiomass,
    CancelExpiredSubscriptions,
    MonitorBiomassQuality,
    CleanupBiomassCache,
    CreateSubscription,
    CancelSubscription,
    ProcessPendingAssessments,
    BundleEvidence,
    ArchiveOldAssessments,
    HealthCheck,
}

/// Per-kind retry policy: attempts, backoff base, and the execution time
/// limits enforced by the worker.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::SweepWeather => "weather.sweep",
            JobKind::FetchPlotWeather => "weather.fetch_plot",
            JobKind::DailyWeatherIndices => "weather.daily_indices",
            JobKind::ComputePlotIndices => "weather.compute_indices",
            JobKind::CheckWeatherTriggers => "weather.check_triggers",
            JobKind::CheckSubscriptions => "planet.check_subscriptions",
            JobKind::FetchLatestBiomass => "planet.fetch_latest_biomass",
            JobKind::RefreshSubscriptionBiomass => "planet.refresh_biomass",
            JobKind::CancelExpiredSubscriptions => "planet.cancel_expired",
            JobKind::MonitorBiomassQuality => "planet.monitor_quality",
            JobKind::CleanupBiomassCache => "planet.cleanup_cache",
            JobKind::CreateSubscription => "planet.create_subscription",
            JobKind::CancelSubscription => "planet.cancel_subscription",
            JobKind::ProcessPendingAssessments => "damage.process_pending",
            JobKind::BundleEvidence => "damage.bundle_evidence",
            JobKind::ArchiveOldAssessments => "damage.archive_old",
            JobKind::HealthCheck => "health.check",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "weather.sweep" => Some(JobKind::SweepWeather),
            "weather.fetch_plot" => Some(JobKind::FetchPlotWeather),
            "weather.daily_indices" => Some(JobKind::DailyWeatherIndices),
            "weather.compute_indices" => Some(JobKind::ComputePlotIndices),
            "weather.check_triggers" => Some(JobKind::CheckWeatherTriggers),
            "planet.check_subscriptions" => Some(JobKind::CheckSubscriptions),
            "planet.fetch_latest_biomass" => Some(JobKind::FetchLatestBiomass),
            "planet.refresh_biomass" => Some(JobKind::RefreshSubscriptionBiomass),
            "planet.cancel_expired" => Some(JobKind::CancelExpiredSubscriptions),
            "planet.monitor_quality" => Some(JobKind::MonitorBiomassQuality),
            "planet.cleanup_cache" => Some(JobKind::CleanupBiomassCache),
            "planet.create_subscription" => Some(JobKind::CreateSubscription),
            "planet.cancel_subscription" => Some(JobKind::CancelSubscription),
            "damage.process_pending" => Some(JobKind::ProcessPendingAssessments),
            "damage.bundle_evidence" => Some(JobKind::BundleEvidence),
            "damage.archive_old" => Some(JobKind::ArchiveOldAssessments),
            "health.check" => Some(JobKind::HealthCheck),
            _ => None,
        }
    }

    pub fn queue(&self) -> Queue {
        match self {
            JobKind::SweepWeather
            | JobKind::FetchPlotWeather
            | JobKind::DailyWeatherIndices
            | JobKind::ComputePlotIndices
            | JobKind::CheckWeatherTriggers => Queue::Weather,
            JobKind::CheckSubscriptions
            | JobKind::FetchLatestBiomass
            | JobKind::RefreshSubscriptionBiomass
            | JobKind::CancelExpiredSubscriptions
            | JobKind::MonitorBiomassQuality
            | JobKind::CleanupBiomassCache
            | JobKind::CreateSubscription
            | JobKind::CancelSubscription => Queue::Planet,
            JobKind::ProcessPendingAssessments
            | JobKind::BundleEvidence
            | JobKind::ArchiveOldAssessments => Queue::Damage,
            JobKind::HealthCheck => Queue::Default,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            // Sweeps re-fire on their own cadence; retrying a missed sweep
            // is pointless.
            JobKind::SweepWeather
            | JobKind::DailyWeatherIndices
            | JobKind::CheckWeatherTriggers
            | JobKind::CheckSubscriptions
            | JobKind::FetchLatestBiomass
            | JobKind::CancelExpiredSubscriptions
            | JobKind::MonitorBiomassQuality
            | JobKind::CleanupBiomassCache
            | JobKind::ProcessPendingAssessments
            | JobKind::ArchiveOldAssessments
            | JobKind::HealthCheck => RetryPolicy {
                max_attempts: 1,
                base_backoff: Duration::from_secs(60),
            },
            JobKind::FetchPlotWeather => RetryPolicy {
                max_attempts: 3,
                base_backoff: Duration::from_secs(30),
            },
            JobKind::ComputePlotIndices => RetryPolicy {
                max_attempts: 3,
                base_backoff: Duration::from_secs(60),
            },
            JobKind::RefreshSubscriptionBiomass
            | JobKind::CreateSubscription
            | JobKind::CancelSubscription => RetryPolicy {
                max_attempts: 3,
                base_backoff: Duration::from_secs(120),
            },
            JobKind::BundleEvidence => RetryPolicy {
                max_attempts: 3,
                base_backoff: Duration::from_secs(300),
            },
        }
    }
}

pub const JOB_STATUS_PENDING: &str = "pending";
pub const JOB_STATUS_RUNNING: &str = "running";
pub const JOB_STATUS_COMPLETED: &str = "completed";
pub const JOB_STATUS_FAILED: &str = "failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => JOB_STATUS_PENDING,
            JobStatus::Running => JOB_STATUS_RUNNING,
            JobStatus::Completed => JOB_STATUS_COMPLETED,
            JobStatus::Failed => JOB_STATUS_FAILED,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub kind: String,
    pub queue: String,
    pub payload: SqlJson<JsonValue>,
    pub dedup_key: Option<String>,
    pub status: String,
    pub attempts: i32,
    pub not_before: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl JobRow {
    pub fn kind_enum(&self) -> Option<JobKind> {
        JobKind::parse(&self.kind)
    }

    pub fn status_enum(&self) -> JobStatus {
        match self.status.as_str() {
            JOB_STATUS_PENDING => JobStatus::Pending,
            JOB_STATUS_RUNNING => JobStatus::Running,
            JOB_STATUS_COMPLETED => JobStatus::Completed,
            JOB_STATUS_FAILED => JobStatus::Failed,
            other => {
                tracing::warn!(status = %other, job_id = %self.id, "unknown job status; treating as failed");
                JobStatus::Failed
            }
        }
    }
}

// ---- task payloads ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchPlotWeatherPayload {
    pub plot_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputePlotIndicesPayload {
    pub plot_id: String,
    #[serde(default)]
    pub policy_id: Option<String>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshBiomassPayload {
    pub subscription_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSubscriptionPayload {
    pub policy_id: String,
    pub plot_id: String,
    pub geometry: JsonValue,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelSubscriptionPayload {
    pub subscription_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleEvidencePayload {
    pub plot_id: String,
    pub policy_id: String,
    pub farmer_address: String,
    pub window_days: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_and_stay_stable() {
        let kinds = [
            JobKind::SweepWeather,
            JobKind::FetchPlotWeather,
            JobKind::DailyWeatherIndices,
            JobKind::ComputePlotIndices,
            JobKind::CheckWeatherTriggers,
            JobKind::CheckSubscriptions,
            JobKind::FetchLatestBiomass,
            JobKind::RefreshSubscriptionBiomass,
            JobKind::CancelExpiredSubscriptions,
            JobKind::MonitorBiomassQuality,
            JobKind::CleanupBiomassCache,
            JobKind::CreateSubscription,
            JobKind::CancelSubscription,
            JobKind::ProcessPendingAssessments,
            JobKind::BundleEvidence,
            JobKind::ArchiveOldAssessments,
            JobKind::HealthCheck,
        ];
        for kind in kinds {
            assert_eq!(JobKind::parse(kind.name()), Some(kind));
            let (domain, verb) = kind.name().split_once('.').expect("domain.verb");
            assert!(!domain.is_empty() && !verb.is_empty());
        }
        assert_eq!(JobKind::parse("weather.unknown"), None);
    }

    #[test]
    fn every_kind_has_exactly_one_queue() {
        assert_eq!(JobKind::SweepWeather.queue(), Queue::Weather);
        assert_eq!(JobKind::RefreshSubscriptionBiomass.queue(), Queue::Planet);
        assert_eq!(JobKind::BundleEvidence.queue(), Queue::Damage);
        assert_eq!(JobKind::HealthCheck.queue(), Queue::Default);
    }

    #[test]
    fn retry_policies_bound_attempts() {
        assert_eq!(JobKind::SweepWeather.retry_policy().max_attempts, 1);
        assert_eq!(JobKind::BundleEvidence.retry_policy().max_attempts, 3);
        assert!(JobKind::FetchPlotWeather.retry_policy().max_attempts >= 1);
    }
}
